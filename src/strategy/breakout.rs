// =============================================================================
// Breakout strategy — range-boundary breaks with volume confirmation
// =============================================================================
//
// Long: with at least 20 candles, let resistance be the highest high of the
// trailing 20. A close above 99.8 % of that level is a break. Volume at or
// above 1.5x average scales the signal by 1.25 (capped); an extreme ratio
// adds a small bonus. RSI7 must sit in [35, 75] — below waits (no thrust),
// above penalises (chasing). A positive filter MACD is a soft confirmation.
// Shorts mirror against the support floor.
// =============================================================================

use crate::strategy::signal;
use crate::strategy::{StrategyContext, StrategyMetrics, StrategyResult};
use crate::types::{Action, Side, StrategyKind};

/// Candles required before a range boundary is trustworthy.
const MIN_CANDLES: usize = 20;

/// Fraction of the boundary that already counts as a break.
const BREAK_RATIO: f64 = 0.998;

/// Volume confirmation threshold and scaling.
const VOLUME_CONFIRM_RATIO: f64 = 1.5;
const VOLUME_SCALE: f64 = 1.25;
const VOLUME_EXTREME_RATIO: f64 = 2.5;
const VOLUME_EXTREME_BONUS: f64 = 0.05;

/// Acceptable RSI band for chasing a break.
const RSI_LO: f64 = 35.0;
const RSI_HI: f64 = 75.0;

/// Soft confirmation bonus from the filter frame's MACD.
const FILTER_MACD_BONUS: f64 = 0.05;

/// Penalty multiplier for breaks with an overheated RSI.
const OVERHEATED_PENALTY: f64 = 0.8;

/// Probe both boundaries; the first direction that is actually breaking wins.
pub fn evaluate(ctx: &StrategyContext<'_>) -> StrategyResult {
    let kind = StrategyKind::Breakout;
    let metrics = StrategyMetrics::from_frames(
        ctx.confirm,
        ctx.filter,
        ctx.analysis.timeframe_alignment.score,
    );

    if ctx.confirm_candles.len() < MIN_CANDLES {
        return StrategyResult::wait(
            ctx.symbol,
            kind,
            format!(
                "only {} candles — need {MIN_CANDLES} to trust the range",
                ctx.confirm_candles.len()
            ),
            metrics,
        );
    }

    if let Some(result) = evaluate_side(ctx, Side::Long) {
        return result;
    }
    if let Some(result) = evaluate_side(ctx, Side::Short) {
        return result;
    }

    StrategyResult::wait(ctx.symbol, kind, "range intact — no boundary break", metrics)
}

/// Evaluate one direction; `None` when that boundary is not breaking.
fn evaluate_side(ctx: &StrategyContext<'_>, side: Side) -> Option<StrategyResult> {
    let kind = StrategyKind::Breakout;
    let confirm = ctx.confirm;
    let filter = ctx.filter;
    let metrics =
        StrategyMetrics::from_frames(confirm, filter, ctx.analysis.timeframe_alignment.score);

    let window = &ctx.confirm_candles[ctx.confirm_candles.len() - MIN_CANDLES..];
    let close = confirm.close;

    let (boundary, breaking) = match side {
        Side::Long => {
            let resistance = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            (resistance, close > BREAK_RATIO * resistance)
        }
        Side::Short => {
            let support = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            (support, close < (2.0 - BREAK_RATIO) * support)
        }
    };

    if !breaking || !boundary.is_finite() || boundary <= 0.0 {
        return None;
    }

    let mut warnings = Vec::new();

    // RSI gate: too cold means no thrust behind the break.
    if match side {
        Side::Long => confirm.rsi7 < RSI_LO,
        Side::Short => confirm.rsi7 > RSI_HI,
    } {
        return Some(StrategyResult::wait(
            ctx.symbol,
            kind,
            format!("boundary break without thrust (RSI7 {:.1})", confirm.rsi7),
            metrics,
        ));
    }

    let mut raw = signal::weighted_strength(
        side,
        confirm,
        filter,
        ctx.analysis.timeframe_alignment.score,
    );

    // Volume confirmation.
    if confirm.volume_ratio >= VOLUME_CONFIRM_RATIO {
        raw = (raw * VOLUME_SCALE).min(1.0);
        if confirm.volume_ratio >= VOLUME_EXTREME_RATIO {
            raw = (raw + VOLUME_EXTREME_BONUS).min(1.0);
        }
    } else {
        warnings.push(format!(
            "break on thin volume (ratio {:.2})",
            confirm.volume_ratio
        ));
    }

    // Overheated RSI: chase penalty rather than a veto.
    if match side {
        Side::Long => confirm.rsi7 > RSI_HI,
        Side::Short => confirm.rsi7 < RSI_LO,
    } {
        warnings.push(format!("chasing an overheated break (RSI7 {:.1})", confirm.rsi7));
        raw *= OVERHEATED_PENALTY;
    }

    // Soft confirmation from the filter MACD.
    if match side {
        Side::Long => filter.macd > 0.0,
        Side::Short => filter.macd < 0.0,
    } {
        raw = (raw + FILTER_MACD_BONUS).min(1.0);
    }

    let strength = signal::volatility_adjusted(raw, filter.atr_ratio);

    Some(StrategyResult {
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
            "{side} break of {boundary:.2} at {close:.2} (volume ratio {:.2})",
            confirm.volume_ratio
        ),
        warnings,
        key_metrics: metrics,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegimeThresholds;
    use crate::indicators::TimeframeIndicators;
    use crate::market::Candle;
    use crate::regime::RegimeClassifier;

    fn range_candles(n: usize, high: f64, low: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle::new(i as i64 * 60_000, (high + low) / 2.0, high, low, (high + low) / 2.0, 100.0))
            .collect()
    }

    fn frame(close: f64, rsi7: f64, volume_ratio: f64) -> TimeframeIndicators {
        let mut tf = TimeframeIndicators::empty();
        tf.close = close;
        tf.ema20 = close * 0.99;
        tf.ema50 = close * 0.97;
        tf.macd = 0.1;
        tf.rsi7 = rsi7;
        tf.atr_ratio = 1.0;
        tf.volume_ratio = volume_ratio;
        tf
    }

    fn neutral_analysis() -> crate::regime::RegimeAnalysis {
        let flat = {
            let mut tf = TimeframeIndicators::empty();
            tf.close = 100.0;
            tf.ema20 = 100.0;
            tf.ema50 = 100.0;
            tf.rsi7 = 50.0;
            tf.atr_ratio = 1.0;
            tf
        };
        RegimeClassifier::new(RegimeThresholds::default()).classify("ETH", &flat, &flat, &flat)
    }

    fn build_ctx<'a>(
        analysis: &'a crate::regime::RegimeAnalysis,
        confirm: &'a TimeframeIndicators,
        filter: &'a TimeframeIndicators,
        candles: &'a [Candle],
    ) -> StrategyContext<'a> {
        StrategyContext {
            symbol: "ETH",
            analysis,
            confirm,
            filter,
            confirm_candles: candles,
            max_leverage: 10.0,
        }
    }

    #[test]
    fn too_few_candles_waits() {
        let candles = range_candles(10, 105.0, 95.0);
        let confirm = frame(106.0, 60.0, 2.0);
        let filter = frame(106.0, 55.0, 1.0);
        let analysis = neutral_analysis();
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter, &candles));
        assert_eq!(r.action, Action::Wait);
        assert!(r.reason.contains("candles"));
    }

    #[test]
    fn intact_range_waits() {
        let candles = range_candles(30, 105.0, 95.0);
        let confirm = frame(100.0, 50.0, 1.0);
        let filter = frame(100.0, 50.0, 1.0);
        let analysis = neutral_analysis();
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter, &candles));
        assert_eq!(r.action, Action::Wait);
        assert!(r.reason.contains("range intact"));
    }

    #[test]
    fn resistance_break_with_volume_goes_long() {
        let candles = range_candles(30, 105.0, 95.0);
        let confirm = frame(105.5, 60.0, 2.0); // above 0.998 * 105, strong volume
        let filter = frame(105.5, 55.0, 1.0);
        let analysis = neutral_analysis();
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter, &candles));
        assert_eq!(r.action, Action::Long);
        assert_eq!(r.strategy_type, StrategyKind::Breakout);
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn thin_volume_break_warns() {
        let candles = range_candles(30, 105.0, 95.0);
        let confirm = frame(105.5, 60.0, 0.8);
        let filter = frame(105.5, 55.0, 1.0);
        let analysis = neutral_analysis();
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter, &candles));
        assert_eq!(r.action, Action::Long);
        assert!(r.warnings.iter().any(|w| w.contains("thin volume")));
    }

    #[test]
    fn cold_rsi_break_waits() {
        let candles = range_candles(30, 105.0, 95.0);
        let confirm = frame(105.5, 30.0, 2.0); // RSI below 35
        let filter = frame(105.5, 40.0, 1.0);
        let analysis = neutral_analysis();
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter, &candles));
        assert_eq!(r.action, Action::Wait);
        assert!(r.reason.contains("thrust"));
    }

    #[test]
    fn overheated_break_penalised_not_blocked() {
        let candles = range_candles(30, 105.0, 95.0);
        let hot = frame(105.5, 80.0, 2.0);
        let warm = frame(105.5, 60.0, 2.0);
        let filter = frame(105.5, 55.0, 1.0);
        let analysis = neutral_analysis();

        let r_hot = evaluate(&build_ctx(&analysis, &hot, &filter, &candles));
        let r_warm = evaluate(&build_ctx(&analysis, &warm, &filter, &candles));
        assert_eq!(r_hot.action, Action::Long);
        assert!(r_hot.signal_strength < r_warm.signal_strength);
        assert!(r_hot.warnings.iter().any(|w| w.contains("overheated")));
    }

    #[test]
    fn support_breakdown_goes_short() {
        let candles = range_candles(30, 105.0, 95.0);
        let mut confirm = frame(94.5, 40.0, 2.0); // below 1.002 * 95
        confirm.ema20 = 95.0;
        confirm.ema50 = 97.0;
        confirm.macd = -0.1;
        let mut filter = frame(94.5, 45.0, 1.0);
        filter.ema20 = 95.0;
        filter.ema50 = 97.0;
        filter.macd = -0.2;
        let analysis = neutral_analysis();
        let r = evaluate(&build_ctx(&analysis, &confirm, &filter, &candles));
        assert_eq!(r.action, Action::Short);
    }
}
