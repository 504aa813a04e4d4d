// =============================================================================
// Mean-reversion strategy — fading range extremes
// =============================================================================
//
// Long entry requires the confirm RSI7 under 35. Touching the lower
// Bollinger band and an upward MACD histogram pivot each add weight; extreme
// oversold (RSI7 < 25) scales the signal by 1.2 (capped at 1.0).
//
// Falling-knife veto: a filter frame with a bearish EMA stack AND a strongly
// negative MACD means the "range" is actually a cliff — no long. Shorts
// mirror every threshold.
// =============================================================================

use crate::strategy::signal;
use crate::strategy::{StrategyContext, StrategyMetrics, StrategyResult};
use crate::types::{Action, Side, StrategyKind};

const ENTRY_RSI_LONG: f64 = 35.0;
const ENTRY_RSI_SHORT: f64 = 65.0;
const EXTREME_RSI_LONG: f64 = 25.0;
const EXTREME_RSI_SHORT: f64 = 75.0;

/// MACD magnitude beyond which the filter frame vetoes a fade.
const KNIFE_MACD: f64 = 50.0;

/// Bonus weights.
const BAND_TOUCH_BONUS: f64 = 0.10;
const PIVOT_BONUS: f64 = 0.10;

pub fn evaluate(ctx: &StrategyContext<'_>, side: Side) -> StrategyResult {
    let kind = StrategyKind::MeanReversion;
    let confirm = ctx.confirm;
    let filter = ctx.filter;
    let metrics =
        StrategyMetrics::from_frames(confirm, filter, ctx.analysis.timeframe_alignment.score);

    // ── Entry threshold ──────────────────────────────────────────────────
    let at_extreme = match side {
        Side::Long => confirm.rsi7 < ENTRY_RSI_LONG,
        Side::Short => confirm.rsi7 > ENTRY_RSI_SHORT,
    };
    if !at_extreme {
        return StrategyResult::wait(
            ctx.symbol,
            kind,
            format!("RSI7 {:.1} not stretched enough to fade", confirm.rsi7),
            metrics,
        );
    }

    // ── Falling-knife veto ───────────────────────────────────────────────
    let knife = match side {
        Side::Long => filter.ema20 < filter.ema50 && filter.macd < -KNIFE_MACD,
        Side::Short => filter.ema20 > filter.ema50 && filter.macd > KNIFE_MACD,
    };
    if knife {
        return StrategyResult::wait(
            ctx.symbol,
            kind,
            format!("veto: filter frame is a falling knife against a {side} fade"),
            metrics,
        );
    }

    let mut warnings = Vec::new();
    let mut raw = signal::weighted_strength(
        side,
        confirm,
        filter,
        ctx.analysis.timeframe_alignment.score,
    );

    // Bollinger band touch strengthens the fade.
    let band_touch = match side {
        Side::Long => confirm.bb_lower > 0.0 && confirm.close <= confirm.bb_lower,
        Side::Short => confirm.bb_upper > 0.0 && confirm.close >= confirm.bb_upper,
    };
    if band_touch {
        raw += BAND_TOUCH_BONUS;
    }

    // Histogram pivot in the fade direction.
    let pivot_agrees = match side {
        Side::Long => confirm.macd_turn == 1,
        Side::Short => confirm.macd_turn == -1,
    };
    if pivot_agrees {
        raw += PIVOT_BONUS;
    }

    // Extreme stretch scales the whole signal.
    let extreme = match side {
        Side::Long => confirm.rsi7 < EXTREME_RSI_LONG,
        Side::Short => confirm.rsi7 > EXTREME_RSI_SHORT,
    };
    if extreme {
        raw = (raw * 1.2).min(1.0);
    } else {
        warnings.push("fade without extreme stretch — smaller edge".to_string());
    }

    let strength = signal::volatility_adjusted(raw, filter.atr_ratio);

    StrategyResult {
        symbol: ctx.symbol.to_string(),
        action: match side {
            Side::Long => Action::Long,
            Side::Short => Action::Short,
        },
        confidence: signal::confidence_tier(strength),
        signal_strength: strength,
        recommended_leverage: signal::recommended_leverage(
            kind,
            strength,
            filter.atr_ratio,
            ctx.max_leverage,
        ),
        strategy_type: kind,
        reason: format!(
            "{side} fade: RSI7 {:.1}{}{}",
            confirm.rsi7,
            if band_touch { ", band touch" } else { "" },
            if pivot_agrees { ", histogram pivot" } else { "" },
        ),
        warnings,
        key_metrics: metrics,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegimeThresholds;
    use crate::indicators::TimeframeIndicators;
    use crate::regime::RegimeClassifier;

    fn frame(ema20: f64, ema50: f64, macd: f64, rsi7: f64) -> TimeframeIndicators {
        let mut tf = TimeframeIndicators::empty();
        tf.close = 100.0;
        tf.ema20 = ema20;
        tf.ema50 = ema50;
        tf.macd = macd;
        tf.rsi7 = rsi7;
        tf.atr_ratio = 1.0;
        tf
    }

    fn build_ctx<'a>(
        analysis: &'a crate::regime::RegimeAnalysis,
        confirm: &'a TimeframeIndicators,
        filter: &'a TimeframeIndicators,
    ) -> StrategyContext<'a> {
        StrategyContext {
            symbol: "ETH",
            analysis,
            confirm,
            filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        }
    }

    fn ranging_analysis(
        confirm: &TimeframeIndicators,
        filter: &TimeframeIndicators,
    ) -> crate::regime::RegimeAnalysis {
        let primary = frame(100.0, 100.0, 0.0, 50.0);
        RegimeClassifier::new(RegimeThresholds::default())
            .classify("ETH", &primary, confirm, filter)
    }

    #[test]
    fn shallow_dip_waits() {
        let confirm = frame(100.0, 100.0, 0.0, 45.0);
        let filter = frame(100.0, 100.0, 0.0, 50.0);
        let analysis = ranging_analysis(&confirm, &filter);
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter), Side::Long);
        assert_eq!(r.action, Action::Wait);
    }

    #[test]
    fn falling_knife_vetoed() {
        let confirm = frame(100.0, 100.0, -0.5, 20.0);
        let filter = frame(95.0, 100.0, -80.0, 30.0); // bearish stack, MACD < -50
        let analysis = ranging_analysis(&confirm, &filter);
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter), Side::Long);
        assert_eq!(r.action, Action::Wait);
        assert!(r.reason.contains("veto"));
    }

    #[test]
    fn oversold_fade_goes_long() {
        let mut confirm = frame(100.0, 100.0, 0.1, 28.0);
        confirm.bb_lower = 101.0; // close 100 touches the lower band
        let filter = frame(100.0, 99.0, 0.5, 50.0);
        let analysis = ranging_analysis(&confirm, &filter);
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter), Side::Long);
        assert_eq!(r.action, Action::Long);
        assert!(r.signal_strength > 0.3);
        assert!(r.reason.contains("band touch"));
    }

    #[test]
    fn extreme_oversold_scales_up() {
        let confirm_mild = frame(100.0, 100.0, 0.1, 30.0);
        let confirm_extreme = frame(100.0, 100.0, 0.1, 20.0);
        let filter = frame(100.0, 99.0, 0.5, 50.0);
        let analysis = ranging_analysis(&confirm_mild, &filter);

        let mild = evaluate(&build_ctx(&analysis, &confirm_mild, &filter), Side::Long);
        let extreme = evaluate(&build_ctx(&analysis, &confirm_extreme, &filter), Side::Long);
        assert!(extreme.signal_strength > mild.signal_strength);
        // The non-extreme fade carries a warning.
        assert!(!mild.warnings.is_empty());
        assert!(extreme.warnings.is_empty());
    }

    #[test]
    fn pivot_bonus_applies() {
        let mut with_pivot = frame(100.0, 100.0, 0.1, 28.0);
        with_pivot.macd_turn = 1;
        let without_pivot = frame(100.0, 100.0, 0.1, 28.0);
        let filter = frame(100.0, 99.0, 0.5, 50.0);
        let analysis = ranging_analysis(&without_pivot, &filter);

        let a = evaluate(&build_ctx(&analysis, &with_pivot, &filter), Side::Long);
        let b = evaluate(&build_ctx(&analysis, &without_pivot, &filter), Side::Long);
        assert!(a.signal_strength > b.signal_strength);
    }

    #[test]
    fn short_mirrors_thresholds() {
        let mut confirm = frame(100.0, 100.0, -0.1, 78.0);
        confirm.bb_upper = 99.0; // close 100 above the upper band
        let filter = frame(100.0, 101.0, -0.5, 50.0);
        let analysis = ranging_analysis(&confirm, &filter);
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter), Side::Short);
        assert_eq!(r.action, Action::Short);
        assert!(r.warnings.is_empty()); // 78 > 75 is extreme
    }
}
