// =============================================================================
// Market Regime Classifier
// =============================================================================
//
// Three timeframes feed the classification:
//   primary — trend direction (EMA stack + MACD sign)
//   confirm — momentum state (RSI7 against configurable thresholds)
//   filter  — volatility state (ATR ratio)
//
// The (trend, momentum) pair maps through a fixed table onto one of eleven
// labelled regimes with a base confidence; an agreeing MACD-turn pivot on the
// primary frame adds +0.1 (capped at 1.0).
//
// The per-frame trend score is a bounded [-100, +100] sum of four clamped
// components (EMA spread, MACD-to-price, EMA20 deviation, RSI distance from
// neutral).
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RegimeThresholds;
use crate::indicators::TimeframeIndicators;
use crate::regime::history::TrendScoreHistory;

// =============================================================================
// Types
// =============================================================================

/// Directional state of the primary timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStrength {
    TrendingUp,
    TrendingDown,
    Ranging,
}

/// Momentum bucket of the confirm timeframe's RSI7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumState {
    OversoldExtreme,
    OversoldMild,
    Neutral,
    OverboughtMild,
    OverboughtExtreme,
}

/// Volatility bucket of the filter timeframe's ATR ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityState {
    LowVol,
    NormalVol,
    HighVol,
}

/// Labelled market regime. Selects the strategy and its bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    UptrendOversold,
    UptrendContinuation,
    UptrendOverbought,
    DowntrendOverbought,
    DowntrendContinuation,
    DowntrendOversold,
    RangingOversold,
    RangingOverbought,
    RangingNeutral,
    NoClearSignal,
}

impl MarketRegime {
    /// +1 for regimes that favour longs, -1 for shorts, 0 for no bias.
    pub fn bias(self) -> i8 {
        match self {
            Self::UptrendOversold | Self::UptrendContinuation | Self::RangingOversold => 1,
            Self::DowntrendOverbought | Self::DowntrendContinuation | Self::RangingOverbought => -1,
            // Exhaustion regimes and neutral states carry no entry bias.
            Self::UptrendOverbought
            | Self::DowntrendOversold
            | Self::RangingNeutral
            | Self::NoClearSignal => 0,
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UptrendOversold => "uptrend_oversold",
            Self::UptrendContinuation => "uptrend_continuation",
            Self::UptrendOverbought => "uptrend_overbought",
            Self::DowntrendOverbought => "downtrend_overbought",
            Self::DowntrendContinuation => "downtrend_continuation",
            Self::DowntrendOversold => "downtrend_oversold",
            Self::RangingOversold => "ranging_oversold",
            Self::RangingOverbought => "ranging_overbought",
            Self::RangingNeutral => "ranging_neutral",
            Self::NoClearSignal => "no_clear_signal",
        };
        write!(f, "{s}")
    }
}

/// Trend scores for the three analysed timeframes, each in [-100, +100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendScores {
    pub primary: f64,
    pub confirm: f64,
    pub filter: f64,
}

/// Cross-timeframe agreement summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeframeAlignment {
    pub aligned: bool,
    /// Weighted pairwise consistency in [0, 1].
    pub score: f64,
}

/// Headline metrics carried alongside the classification for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub rsi7_confirm: f64,
    pub atr_ratio_filter: f64,
    pub macd_primary: f64,
    pub ema_spread_pct_primary: f64,
}

/// Complete regime analysis for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAnalysis {
    pub symbol: String,
    pub regime: MarketRegime,
    pub trend_strength: TrendStrength,
    pub momentum_state: MomentumState,
    pub volatility_state: VolatilityState,
    pub confidence: f64,
    pub trend_scores: TrendScores,
    /// Scores from the previous classification round, when known.
    pub previous_scores: Option<TrendScores>,
    pub key_metrics: KeyMetrics,
    pub timeframe_alignment: TimeframeAlignment,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Trend score
// =============================================================================

fn clamp(value: f64, bound: f64) -> f64 {
    value.clamp(-bound, bound)
}

/// Bounded [-100, +100] trend score for a single timeframe.
pub fn calculate_trend_score(tf: &TimeframeIndicators) -> f64 {
    let ema_term = if tf.ema50 != 0.0 {
        clamp((tf.ema20 - tf.ema50) / tf.ema50 * 1000.0, 40.0)
    } else {
        0.0
    };

    let macd_term = if tf.close != 0.0 {
        clamp(tf.macd / tf.close * 10_000.0, 30.0)
    } else {
        0.0
    };

    let deviation_term = clamp(tf.deviation_from_ema20 * 2.0, 20.0);
    let rsi_term = clamp((tf.rsi7 - 50.0) / 5.0, 10.0);

    (ema_term + macd_term + deviation_term + rsi_term).round()
}

// =============================================================================
// Classifier
// =============================================================================

/// Regime classifier owning the RSI thresholds and the per-symbol
/// trend-score history.
pub struct RegimeClassifier {
    thresholds: RegimeThresholds,
    pub history: TrendScoreHistory,
}

impl RegimeClassifier {
    pub fn new(thresholds: RegimeThresholds) -> Self {
        Self {
            thresholds,
            history: TrendScoreHistory::new(),
        }
    }

    /// Classify one symbol from its three timeframe snapshots. Appends the
    /// computed trend-score triple to the rolling history.
    pub fn classify(
        &self,
        symbol: &str,
        primary: &TimeframeIndicators,
        confirm: &TimeframeIndicators,
        filter: &TimeframeIndicators,
    ) -> RegimeAnalysis {
        let trend = trend_strength(primary);
        let momentum = self.momentum_state(confirm.rsi7);
        let volatility = volatility_state(filter.atr_ratio);

        let (regime, mut confidence) = map_regime(trend, momentum);

        // MACD-turn confirmation: an agreeing pivot on the primary frame
        // strengthens the classification.
        if primary.macd_turn != 0 && primary.macd_turn as i8 == regime.bias() {
            confidence = (confidence + 0.1).min(1.0);
        }

        let scores = TrendScores {
            primary: calculate_trend_score(primary),
            confirm: calculate_trend_score(confirm),
            filter: calculate_trend_score(filter),
        };

        let previous_scores = self.history.latest(symbol);
        self.history.push(symbol, scores);

        let alignment = timeframe_alignment(primary, confirm, filter);

        let analysis = RegimeAnalysis {
            symbol: symbol.to_string(),
            regime,
            trend_strength: trend,
            momentum_state: momentum,
            volatility_state: volatility,
            confidence,
            trend_scores: scores,
            previous_scores,
            key_metrics: KeyMetrics {
                rsi7_confirm: confirm.rsi7,
                atr_ratio_filter: filter.atr_ratio,
                macd_primary: primary.macd,
                ema_spread_pct_primary: if primary.ema50 != 0.0 {
                    (primary.ema20 - primary.ema50) / primary.ema50 * 100.0
                } else {
                    0.0
                },
            },
            timeframe_alignment: alignment,
            timestamp: Utc::now(),
        };

        debug!(
            symbol,
            regime = %analysis.regime,
            confidence = format!("{:.2}", analysis.confidence),
            primary_score = analysis.trend_scores.primary,
            confirm_score = analysis.trend_scores.confirm,
            filter_score = analysis.trend_scores.filter,
            alignment = format!("{:.2}", analysis.timeframe_alignment.score),
            "regime classified"
        );

        analysis
    }

    fn momentum_state(&self, rsi7: f64) -> MomentumState {
        let t = &self.thresholds;
        if rsi7 <= t.oversold_extreme {
            MomentumState::OversoldExtreme
        } else if rsi7 <= t.oversold_mild {
            MomentumState::OversoldMild
        } else if rsi7 >= t.overbought_extreme {
            MomentumState::OverboughtExtreme
        } else if rsi7 >= t.overbought_mild {
            MomentumState::OverboughtMild
        } else {
            MomentumState::Neutral
        }
    }
}

fn trend_strength(primary: &TimeframeIndicators) -> TrendStrength {
    if primary.ema20 > primary.ema50 && primary.macd > 0.0 {
        TrendStrength::TrendingUp
    } else if primary.ema20 < primary.ema50 && primary.macd < 0.0 {
        TrendStrength::TrendingDown
    } else {
        TrendStrength::Ranging
    }
}

fn volatility_state(atr_ratio: f64) -> VolatilityState {
    if atr_ratio > 1.5 {
        VolatilityState::HighVol
    } else if atr_ratio < 0.7 {
        VolatilityState::LowVol
    } else {
        VolatilityState::NormalVol
    }
}

/// The fixed (trend, momentum) → (regime, base confidence) table.
fn map_regime(trend: TrendStrength, momentum: MomentumState) -> (MarketRegime, f64) {
    use MarketRegime::*;
    use MomentumState::*;
    use TrendStrength::*;

    match (trend, momentum) {
        (TrendingUp, OversoldExtreme) => (UptrendOversold, 0.9),
        (TrendingDown, OverboughtExtreme) => (DowntrendOverbought, 0.9),
        (TrendingDown, OversoldExtreme) => (DowntrendOversold, 0.6),
        (TrendingUp, OverboughtExtreme) => (UptrendOverbought, 0.6),
        (TrendingUp, OversoldMild) | (TrendingUp, Neutral) => (UptrendContinuation, 0.7),
        (TrendingDown, OverboughtMild) | (TrendingDown, Neutral) => (DowntrendContinuation, 0.7),
        (TrendingDown, OversoldMild) => (DowntrendOversold, 0.5),
        (TrendingUp, OverboughtMild) => (UptrendOverbought, 0.5),
        (Ranging, OversoldExtreme) => (RangingOversold, 0.8),
        (Ranging, OverboughtExtreme) => (RangingOverbought, 0.8),
        (Ranging, Neutral) => (RangingNeutral, 0.5),
        _ => (NoClearSignal, 0.3),
    }
}

// =============================================================================
// Timeframe alignment
// =============================================================================

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// Internal consistency of one frame: its EMA direction agrees with its MACD
/// sign. Flat components score half.
fn internal_consistency(tf: &TimeframeIndicators) -> f64 {
    let ema_dir = sign(tf.ema20 - tf.ema50);
    let macd_dir = sign(tf.macd);
    if ema_dir == 0 || macd_dir == 0 {
        0.5
    } else if ema_dir == macd_dir {
        1.0
    } else {
        0.0
    }
}

/// Pairwise consistency: 40 % EMA-direction agreement, 30 % MACD-sign
/// agreement, 15 % + 15 % internal consistency of each frame.
fn pairwise_consistency(a: &TimeframeIndicators, b: &TimeframeIndicators) -> f64 {
    let ema_agree = if sign(a.ema20 - a.ema50) == sign(b.ema20 - b.ema50) { 1.0 } else { 0.0 };
    let macd_agree = if sign(a.macd) == sign(b.macd) { 1.0 } else { 0.0 };

    0.4 * ema_agree + 0.3 * macd_agree + 0.15 * internal_consistency(a) + 0.15 * internal_consistency(b)
}

/// Weighted alignment: (primary, confirm) at 60 %, (confirm, filter) at 40 %.
pub fn timeframe_alignment(
    primary: &TimeframeIndicators,
    confirm: &TimeframeIndicators,
    filter: &TimeframeIndicators,
) -> TimeframeAlignment {
    let score = 0.6 * pairwise_consistency(primary, confirm)
        + 0.4 * pairwise_consistency(confirm, filter);
    TimeframeAlignment {
        aligned: score >= 0.6,
        score,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ema20: f64, ema50: f64, macd: f64, rsi7: f64, atr_ratio: f64) -> TimeframeIndicators {
        let mut tf = TimeframeIndicators::empty();
        tf.close = 100.0;
        tf.ema20 = ema20;
        tf.ema50 = ema50;
        tf.macd = macd;
        tf.rsi7 = rsi7;
        tf.atr_ratio = atr_ratio;
        tf.deviation_from_ema20 = if ema20 != 0.0 { (tf.close - ema20) / ema20 * 100.0 } else { 0.0 };
        tf
    }

    fn classifier() -> RegimeClassifier {
        RegimeClassifier::new(RegimeThresholds::default())
    }

    #[test]
    fn trend_score_is_bounded() {
        // Extreme bullish inputs saturate every component.
        let mut tf = frame(200.0, 100.0, 50.0, 100.0, 1.0);
        tf.deviation_from_ema20 = 50.0;
        let score = calculate_trend_score(&tf);
        assert!(score <= 100.0);
        assert_eq!(score, 100.0);

        let mut tf = frame(100.0, 200.0, -50.0, 0.0, 1.0);
        tf.deviation_from_ema20 = -50.0;
        let score = calculate_trend_score(&tf);
        assert_eq!(score, -100.0);
    }

    #[test]
    fn trend_score_zero_divisors() {
        let tf = frame(0.0, 0.0, 0.0, 50.0, 1.0);
        assert_eq!(calculate_trend_score(&tf), 0.0);
    }

    #[test]
    fn regime_table_extremes() {
        assert_eq!(
            map_regime(TrendStrength::TrendingUp, MomentumState::OversoldExtreme),
            (MarketRegime::UptrendOversold, 0.9)
        );
        assert_eq!(
            map_regime(TrendStrength::TrendingDown, MomentumState::OverboughtExtreme),
            (MarketRegime::DowntrendOverbought, 0.9)
        );
        assert_eq!(
            map_regime(TrendStrength::Ranging, MomentumState::OversoldExtreme),
            (MarketRegime::RangingOversold, 0.8)
        );
        assert_eq!(
            map_regime(TrendStrength::Ranging, MomentumState::OversoldMild),
            (MarketRegime::NoClearSignal, 0.3)
        );
    }

    #[test]
    fn continuation_regimes() {
        assert_eq!(
            map_regime(TrendStrength::TrendingUp, MomentumState::Neutral),
            (MarketRegime::UptrendContinuation, 0.7)
        );
        assert_eq!(
            map_regime(TrendStrength::TrendingDown, MomentumState::Neutral),
            (MarketRegime::DowntrendContinuation, 0.7)
        );
        // Mild exhaustion inside a trend scores lower.
        assert_eq!(
            map_regime(TrendStrength::TrendingUp, MomentumState::OverboughtMild),
            (MarketRegime::UptrendOverbought, 0.5)
        );
    }

    #[test]
    fn classify_uptrend_oversold() {
        let c = classifier();
        let primary = frame(105.0, 100.0, 2.0, 55.0, 1.0);
        let confirm = frame(104.0, 100.0, 1.5, 15.0, 1.0); // RSI7 <= 20 extreme
        let filter = frame(103.0, 100.0, 1.0, 50.0, 1.0);

        let analysis = c.classify("ETH", &primary, &confirm, &filter);
        assert_eq!(analysis.regime, MarketRegime::UptrendOversold);
        assert_eq!(analysis.trend_strength, TrendStrength::TrendingUp);
        assert_eq!(analysis.momentum_state, MomentumState::OversoldExtreme);
        assert!((analysis.confidence - 0.9).abs() < 1e-9);
        assert!(analysis.trend_scores.primary >= -100.0 && analysis.trend_scores.primary <= 100.0);
    }

    #[test]
    fn macd_turn_bumps_confidence() {
        let c = classifier();
        let mut primary = frame(105.0, 100.0, 2.0, 55.0, 1.0);
        primary.macd_turn = 1; // agrees with the up-biased regime
        let confirm = frame(104.0, 100.0, 1.5, 15.0, 1.0);
        let filter = frame(103.0, 100.0, 1.0, 50.0, 1.0);

        let analysis = c.classify("ETH", &primary, &confirm, &filter);
        assert!((analysis.confidence - 1.0).abs() < 1e-9); // 0.9 + 0.1 capped
    }

    #[test]
    fn disagreeing_turn_does_not_bump() {
        let c = classifier();
        let mut primary = frame(105.0, 100.0, 2.0, 55.0, 1.0);
        primary.macd_turn = -1;
        let confirm = frame(104.0, 100.0, 1.5, 15.0, 1.0);
        let filter = frame(103.0, 100.0, 1.0, 50.0, 1.0);

        let analysis = c.classify("ETH", &primary, &confirm, &filter);
        assert!((analysis.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn volatility_buckets() {
        assert_eq!(volatility_state(1.6), VolatilityState::HighVol);
        assert_eq!(volatility_state(0.6), VolatilityState::LowVol);
        assert_eq!(volatility_state(1.0), VolatilityState::NormalVol);
    }

    #[test]
    fn alignment_fully_agreeing_frames() {
        let up = frame(105.0, 100.0, 2.0, 60.0, 1.0);
        let alignment = timeframe_alignment(&up, &up, &up);
        assert!((alignment.score - 1.0).abs() < 1e-9);
        assert!(alignment.aligned);
    }

    #[test]
    fn alignment_conflicting_frames() {
        let up = frame(105.0, 100.0, 2.0, 60.0, 1.0);
        let down = frame(95.0, 100.0, -2.0, 40.0, 1.0);
        let alignment = timeframe_alignment(&up, &down, &up);
        assert!(alignment.score < 0.6);
        assert!(!alignment.aligned);
    }

    #[test]
    fn history_records_previous_scores() {
        let c = classifier();
        let primary = frame(105.0, 100.0, 2.0, 55.0, 1.0);
        let confirm = frame(104.0, 100.0, 1.5, 45.0, 1.0);
        let filter = frame(103.0, 100.0, 1.0, 50.0, 1.0);

        let first = c.classify("ETH", &primary, &confirm, &filter);
        assert!(first.previous_scores.is_none());

        let second = c.classify("ETH", &primary, &confirm, &filter);
        assert_eq!(second.previous_scores, Some(first.trend_scores));
    }
}
