// =============================================================================
// Trend-following strategy — pullback entries and steady continuation
// =============================================================================
//
// Long entry requires the filter frame's EMA20 above EMA50. Two setups:
//   1. Steady continuation: regime is uptrend_continuation and the confirm
//      RSI7 sits in the healthy [45, 65] band — a fixed 0.5 strength signal.
//   2. Pullback: confirm RSI7 under 40 inside the intact trend, ideally with
//      price holding at or above 99.5 % of its EMA20.
// Shorts mirror both setups.
// =============================================================================

use crate::regime::MarketRegime;
use crate::strategy::signal;
use crate::strategy::{StrategyContext, StrategyMetrics, StrategyResult};
use crate::types::{Action, Side, StrategyKind};

/// Healthy continuation RSI band for longs; mirrored for shorts.
const CONTINUATION_RSI_LONG: (f64, f64) = (45.0, 65.0);
const CONTINUATION_RSI_SHORT: (f64, f64) = (35.0, 55.0);

/// Pullback RSI thresholds.
const PULLBACK_RSI_LONG: f64 = 40.0;
const PULLBACK_RSI_SHORT: f64 = 60.0;

/// Price should hold within 0.5 % of the confirm EMA20 on a pullback entry.
const EMA_HOLD_RATIO: f64 = 0.995;

pub fn evaluate(ctx: &StrategyContext<'_>, side: Side) -> StrategyResult {
    let kind = StrategyKind::TrendFollowing;
    let confirm = ctx.confirm;
    let filter = ctx.filter;
    let metrics =
        StrategyMetrics::from_frames(confirm, filter, ctx.analysis.timeframe_alignment.score);

    // The filter frame must agree with the trade direction.
    let filter_aligned = match side {
        Side::Long => filter.ema20 > filter.ema50,
        Side::Short => filter.ema20 < filter.ema50,
    };
    if !filter_aligned {
        return StrategyResult::wait(
            ctx.symbol,
            kind,
            format!("filter EMA stack not aligned for {side}"),
            metrics,
        );
    }

    let mut warnings = Vec::new();

    // ── Setup 1: steady continuation ─────────────────────────────────────
    let continuation_regime = matches!(
        (side, ctx.analysis.regime),
        (Side::Long, MarketRegime::UptrendContinuation)
            | (Side::Short, MarketRegime::DowntrendContinuation)
    );
    let (band_lo, band_hi) = match side {
        Side::Long => CONTINUATION_RSI_LONG,
        Side::Short => CONTINUATION_RSI_SHORT,
    };
    if continuation_regime && confirm.rsi7 >= band_lo && confirm.rsi7 <= band_hi {
        let strength = signal::volatility_adjusted(0.5, filter.atr_ratio);
        return StrategyResult {
            symbol: ctx.symbol.to_string(),
            action: side_action(side),
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
                "steady {side} continuation: RSI7 {:.1} in healthy band",
                confirm.rsi7
            ),
            warnings,
            key_metrics: metrics,
        };
    }

    // ── Setup 2: pullback inside the trend ───────────────────────────────
    let pullback = match side {
        Side::Long => confirm.rsi7 < PULLBACK_RSI_LONG,
        Side::Short => confirm.rsi7 > PULLBACK_RSI_SHORT,
    };
    if !pullback {
        return StrategyResult::wait(
            ctx.symbol,
            kind,
            format!(
                "no entry: RSI7 {:.1} is neither a pullback nor a continuation band",
                confirm.rsi7
            ),
            metrics,
        );
    }

    let mut raw = signal::weighted_strength(
        side,
        confirm,
        filter,
        ctx.analysis.timeframe_alignment.score,
    );

    // Price ideally holds the EMA20 shelf; a break below is tradeable but
    // weaker.
    let holds_ema = match side {
        Side::Long => confirm.ema20 == 0.0 || confirm.close >= EMA_HOLD_RATIO * confirm.ema20,
        Side::Short => confirm.ema20 == 0.0 || confirm.close <= (2.0 - EMA_HOLD_RATIO) * confirm.ema20,
    };
    if !holds_ema {
        warnings.push("price extended beyond the EMA20 shelf".to_string());
        raw *= 0.9;
    }

    let strength = signal::volatility_adjusted(raw, filter.atr_ratio);

    StrategyResult {
        symbol: ctx.symbol.to_string(),
        action: side_action(side),
        confidence: signal::confidence_tier(strength),
        signal_strength: strength,
        recommended_leverage: signal::recommended_leverage(
            kind,
            strength,
            filter.atr_ratio,
            ctx.max_leverage,
        ),
        strategy_type: kind,
        reason: format!("{side} pullback: RSI7 {:.1} inside intact trend", confirm.rsi7),
        warnings,
        key_metrics: metrics,
    }
}

fn side_action(side: Side) -> Action {
    match side {
        Side::Long => Action::Long,
        Side::Short => Action::Short,
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

    fn ctx_parts(
        primary: TimeframeIndicators,
        confirm: TimeframeIndicators,
        filter: TimeframeIndicators,
    ) -> (crate::regime::RegimeAnalysis, TimeframeIndicators, TimeframeIndicators) {
        let analysis = RegimeClassifier::new(RegimeThresholds::default())
            .classify("ETH", &primary, &confirm, &filter);
        (analysis, confirm, filter)
    }

    #[test]
    fn misaligned_filter_waits() {
        let (analysis, confirm, filter) = ctx_parts(
            frame(105.0, 100.0, 2.0, 55.0),
            frame(104.0, 100.0, 1.0, 30.0),
            frame(95.0, 100.0, -1.0, 50.0), // bearish filter
        );
        let ctx = StrategyContext {
            symbol: "ETH",
            analysis: &analysis,
            confirm: &confirm,
            filter: &filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        };
        let r = evaluate(&ctx, Side::Long);
        assert_eq!(r.action, Action::Wait);
        assert!(r.reason.contains("filter"));
    }

    #[test]
    fn continuation_band_emits_half_strength_long() {
        let (analysis, confirm, filter) = ctx_parts(
            frame(105.0, 100.0, 2.0, 55.0),  // uptrend primary
            frame(104.0, 100.0, 1.0, 55.0),  // RSI in [45, 65]
            frame(103.0, 100.0, 1.0, 50.0),
        );
        assert_eq!(analysis.regime, MarketRegime::UptrendContinuation);
        let ctx = StrategyContext {
            symbol: "ETH",
            analysis: &analysis,
            confirm: &confirm,
            filter: &filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        };
        let r = evaluate(&ctx, Side::Long);
        assert_eq!(r.action, Action::Long);
        assert!((r.signal_strength - 0.5).abs() < 1e-9);
        assert!(r.recommended_leverage >= 2.0);
    }

    #[test]
    fn pullback_entry_long() {
        let (analysis, confirm, filter) = ctx_parts(
            frame(105.0, 100.0, 2.0, 55.0),
            frame(100.0, 96.0, 0.5, 32.0), // pullback RSI < 40, close at EMA20
            frame(103.0, 100.0, 1.0, 50.0),
        );
        let ctx = StrategyContext {
            symbol: "ETH",
            analysis: &analysis,
            confirm: &confirm,
            filter: &filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        };
        let r = evaluate(&ctx, Side::Long);
        assert_eq!(r.action, Action::Long);
        assert!(r.signal_strength > 0.4, "got {}", r.signal_strength);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn broken_ema_shelf_warns_and_dampens() {
        let mut confirm = frame(102.0, 96.0, 0.5, 32.0);
        confirm.close = 100.0; // below 0.995 * 102 = 101.49
        let (analysis, confirm, filter) = ctx_parts(
            frame(105.0, 100.0, 2.0, 55.0),
            confirm,
            frame(103.0, 100.0, 1.0, 50.0),
        );
        let ctx = StrategyContext {
            symbol: "ETH",
            analysis: &analysis,
            confirm: &confirm,
            filter: &filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        };
        let r = evaluate(&ctx, Side::Long);
        assert_eq!(r.action, Action::Long);
        assert!(!r.warnings.is_empty());
    }

    #[test]
    fn neither_setup_waits() {
        // RSI 70: too hot for a pullback, above the continuation band.
        let (analysis, confirm, filter) = ctx_parts(
            frame(105.0, 100.0, 2.0, 55.0),
            frame(104.0, 100.0, 1.0, 68.0),
            frame(103.0, 100.0, 1.0, 50.0),
        );
        let ctx = StrategyContext {
            symbol: "ETH",
            analysis: &analysis,
            confirm: &confirm,
            filter: &filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        };
        let r = evaluate(&ctx, Side::Long);
        assert_eq!(r.action, Action::Wait);
    }

    #[test]
    fn short_mirrors() {
        let (analysis, confirm, filter) = ctx_parts(
            frame(95.0, 100.0, -2.0, 45.0),  // downtrend primary
            frame(96.0, 100.0, -1.0, 45.0),  // RSI in short band [35, 55]
            frame(96.0, 100.0, -1.0, 50.0),
        );
        assert_eq!(analysis.regime, MarketRegime::DowntrendContinuation);
        let ctx = StrategyContext {
            symbol: "ETH",
            analysis: &analysis,
            confirm: &confirm,
            filter: &filter,
            confirm_candles: &[],
            max_leverage: 10.0,
        };
        let r = evaluate(&ctx, Side::Short);
        assert_eq!(r.action, Action::Short);
        assert!((r.signal_strength - 0.5).abs() < 1e-9);
    }
}
