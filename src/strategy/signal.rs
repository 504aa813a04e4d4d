// =============================================================================
// Signal strength — shared weighted scoring for all strategies
// =============================================================================
//
// Component weights (sum 100):
//   RSI extremity              25
//   MACD differential          20
//   EMA alignment              25
//   Price-EMA deviation        15
//   Multi-timeframe consistency 15
//
// The raw strength is then volatility-adjusted by the filter frame's ATR
// ratio: quiet tape amplifies (x1.2 capped at 1.0), elevated volatility
// dampens, and chaotic tape cuts the signal roughly in half.
// =============================================================================

use crate::indicators::TimeframeIndicators;
use crate::types::{ConfidenceTier, Side, StrategyKind};

/// Base leverage per strategy family, scaled by signal strength and the
/// volatility multiplier before clamping.
fn base_leverage(kind: StrategyKind) -> f64 {
    match kind {
        StrategyKind::TrendFollowing => 5.0,
        StrategyKind::MeanReversion => 3.0,
        StrategyKind::Breakout => 4.0,
        StrategyKind::None => 0.0,
    }
}

fn unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Weighted raw signal strength in [0, 1] for a prospective entry in
/// `direction`, using the confirm and filter frames plus the cross-frame
/// alignment score.
pub fn weighted_strength(
    direction: Side,
    confirm: &TimeframeIndicators,
    filter: &TimeframeIndicators,
    alignment_score: f64,
) -> f64 {
    let sign = direction.sign();

    // RSI extremity: room left to run in the trade direction.
    let rsi_score = match direction {
        Side::Long => unit((70.0 - confirm.rsi7) / 40.0),
        Side::Short => unit((confirm.rsi7 - 30.0) / 40.0),
    };

    // MACD differential: magnitude of direction-agreeing momentum.
    let macd_score = if confirm.close != 0.0 && sign * confirm.macd > 0.0 {
        unit((confirm.macd / confirm.close * 10_000.0).abs() / 30.0)
    } else {
        0.0
    };

    // EMA alignment across both frames.
    let aligned = |tf: &TimeframeIndicators| sign * (tf.ema20 - tf.ema50) > 0.0;
    let ema_score = match (aligned(confirm), aligned(filter)) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    };

    // Price-EMA deviation: entries close to the EMA20 are better priced.
    let deviation_score = unit(1.0 - confirm.deviation_from_ema20.abs() / 5.0);

    let mtf_score = unit(alignment_score);

    (25.0 * rsi_score + 20.0 * macd_score + 25.0 * ema_score + 15.0 * deviation_score
        + 15.0 * mtf_score)
        / 100.0
}

/// Volatility multiplier from the filter frame's ATR ratio.
pub fn volatility_multiplier(atr_ratio: f64) -> f64 {
    if atr_ratio < 0.8 {
        1.2
    } else if atr_ratio <= 1.2 {
        1.0
    } else if atr_ratio <= 1.5 {
        0.85
    } else if atr_ratio <= 1.8 {
        0.8
    } else {
        0.65
    }
}

/// Apply the volatility multiplier, keeping the result in [0, 1].
pub fn volatility_adjusted(raw_strength: f64, atr_ratio: f64) -> f64 {
    unit(raw_strength * volatility_multiplier(atr_ratio))
}

/// Recommended leverage: `clamp(2, min(max_leverage, base * strength * vol))`.
pub fn recommended_leverage(
    kind: StrategyKind,
    signal_strength: f64,
    atr_ratio: f64,
    max_leverage: f64,
) -> f64 {
    let raw = base_leverage(kind) * signal_strength * volatility_multiplier(atr_ratio);
    raw.min(max_leverage).max(2.0)
}

/// Bucket a signal strength into the qualitative tier.
pub fn confidence_tier(signal_strength: f64) -> ConfidenceTier {
    if signal_strength >= 0.7 {
        ConfidenceTier::High
    } else if signal_strength >= 0.45 {
        ConfidenceTier::Medium
    } else {
        ConfidenceTier::Low
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ema20: f64, ema50: f64, macd: f64, rsi7: f64) -> TimeframeIndicators {
        let mut tf = TimeframeIndicators::empty();
        tf.close = 100.0;
        tf.ema20 = ema20;
        tf.ema50 = ema50;
        tf.macd = macd;
        tf.rsi7 = rsi7;
        tf.deviation_from_ema20 = if ema20 != 0.0 { (tf.close - ema20) / ema20 * 100.0 } else { 0.0 };
        tf
    }

    #[test]
    fn strong_long_setup_scores_high() {
        // Oversold pullback in an aligned uptrend.
        let confirm = frame(100.0, 96.0, 0.2, 32.0);
        let filter = frame(101.0, 97.0, 0.3, 50.0);
        let s = weighted_strength(Side::Long, &confirm, &filter, 0.9);
        assert!(s > 0.6, "got {s}");
    }

    #[test]
    fn misaligned_setup_scores_low() {
        // Overbought against a bearish EMA stack.
        let confirm = frame(95.0, 100.0, -0.5, 85.0);
        let filter = frame(94.0, 100.0, -0.5, 80.0);
        let s = weighted_strength(Side::Long, &confirm, &filter, 0.2);
        assert!(s < 0.3, "got {s}");
    }

    #[test]
    fn short_mirrors_long() {
        let confirm_bear = frame(95.0, 100.0, -0.5, 70.0);
        let filter_bear = frame(94.0, 100.0, -0.4, 60.0);
        let short = weighted_strength(Side::Short, &confirm_bear, &filter_bear, 0.8);
        let long = weighted_strength(Side::Long, &confirm_bear, &filter_bear, 0.8);
        assert!(short > long);
    }

    #[test]
    fn strength_always_bounded() {
        let confirm = frame(200.0, 100.0, 90.0, 0.0);
        let filter = frame(200.0, 100.0, 90.0, 0.0);
        let s = weighted_strength(Side::Long, &confirm, &filter, 1.5);
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn volatility_multiplier_bands() {
        assert_eq!(volatility_multiplier(0.5), 1.2);
        assert_eq!(volatility_multiplier(1.0), 1.0);
        assert_eq!(volatility_multiplier(1.4), 0.85);
        assert_eq!(volatility_multiplier(1.7), 0.8);
        assert_eq!(volatility_multiplier(2.5), 0.65);
    }

    #[test]
    fn volatility_adjustment_caps_at_one() {
        assert_eq!(volatility_adjusted(0.95, 0.5), 1.0);
        assert!((volatility_adjusted(0.5, 2.0) - 0.325).abs() < 1e-9);
    }

    #[test]
    fn leverage_clamps() {
        // Strong trend signal in quiet tape: 5 * 1.0 * 1.2 = 6, capped by max.
        let lev = recommended_leverage(StrategyKind::TrendFollowing, 1.0, 0.5, 5.0);
        assert_eq!(lev, 5.0);

        // Weak signal floors at 2.
        let lev = recommended_leverage(StrategyKind::MeanReversion, 0.1, 1.0, 10.0);
        assert_eq!(lev, 2.0);

        // Mid-range passes through: 4 * 0.75 * 1.0 = 3.
        let lev = recommended_leverage(StrategyKind::Breakout, 0.75, 1.0, 10.0);
        assert!((lev - 3.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_tiers() {
        assert_eq!(confidence_tier(0.8), ConfidenceTier::High);
        assert_eq!(confidence_tier(0.5), ConfidenceTier::Medium);
        assert_eq!(confidence_tier(0.2), ConfidenceTier::Low);
    }
}
