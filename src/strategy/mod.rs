// =============================================================================
// Strategy router — dispatches a regime to its matching strategy
// =============================================================================
//
// Routing:
//   uptrend_*                → trend-following long (the strategy itself
//                              emits wait when its preconditions fail)
//   downtrend_* (not
//     the oversold variant)  → trend-following short
//   downtrend_oversold       → wait (exhausted short; no counter-trend long)
//   ranging_oversold         → mean-reversion long
//   ranging_overbought       → mean-reversion short
//   ranging_neutral          → breakout probe of the range boundaries
//                              (degrades to wait when nothing is breaking)
//   no_clear_signal          → wait
// =============================================================================

pub mod breakout;
pub mod mean_reversion;
pub mod signal;
pub mod trend_following;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::TimeframeIndicators;
use crate::market::Candle;
use crate::regime::{MarketRegime, RegimeAnalysis};
use crate::types::{Action, ConfidenceTier, StrategyKind};

/// Headline metrics carried on every strategy result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub rsi7: f64,
    pub macd: f64,
    pub atr_ratio: f64,
    pub volume_ratio: f64,
    pub alignment: f64,
}

impl StrategyMetrics {
    pub fn from_frames(
        confirm: &TimeframeIndicators,
        filter: &TimeframeIndicators,
        alignment: f64,
    ) -> Self {
        Self {
            rsi7: confirm.rsi7,
            macd: confirm.macd,
            atr_ratio: filter.atr_ratio,
            volume_ratio: confirm.volume_ratio,
            alignment,
        }
    }
}

/// What a strategy decided for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub symbol: String,
    pub action: Action,
    pub confidence: ConfidenceTier,
    pub signal_strength: f64,
    pub recommended_leverage: f64,
    pub strategy_type: StrategyKind,
    pub reason: String,
    pub warnings: Vec<String>,
    pub key_metrics: StrategyMetrics,
}

impl StrategyResult {
    /// A wait decision with zeroed strength and leverage.
    pub fn wait(
        symbol: &str,
        strategy_type: StrategyKind,
        reason: impl Into<String>,
        key_metrics: StrategyMetrics,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: Action::Wait,
            confidence: ConfidenceTier::Low,
            signal_strength: 0.0,
            recommended_leverage: 0.0,
            strategy_type,
            reason: reason.into(),
            warnings: Vec::new(),
            key_metrics,
        }
    }
}

/// Everything a strategy needs to evaluate one symbol.
pub struct StrategyContext<'a> {
    pub symbol: &'a str,
    pub analysis: &'a RegimeAnalysis,
    pub confirm: &'a TimeframeIndicators,
    pub filter: &'a TimeframeIndicators,
    /// Confirm-frame candles (oldest first) for structural checks.
    pub confirm_candles: &'a [Candle],
    pub max_leverage: f64,
}

/// Stateless router; leverage bound comes from configuration.
pub struct StrategyRouter {
    max_leverage: f64,
}

impl StrategyRouter {
    pub fn new(max_leverage: f64) -> Self {
        Self { max_leverage }
    }

    pub fn route(
        &self,
        symbol: &str,
        analysis: &RegimeAnalysis,
        confirm: &TimeframeIndicators,
        filter: &TimeframeIndicators,
        confirm_candles: &[Candle],
    ) -> StrategyResult {
        let ctx = StrategyContext {
            symbol,
            analysis,
            confirm,
            filter,
            confirm_candles,
            max_leverage: self.max_leverage,
        };

        let metrics =
            StrategyMetrics::from_frames(confirm, filter, analysis.timeframe_alignment.score);

        let result = match analysis.regime {
            MarketRegime::UptrendOversold
            | MarketRegime::UptrendContinuation
            | MarketRegime::UptrendOverbought => {
                trend_following::evaluate(&ctx, crate::types::Side::Long)
            }
            MarketRegime::DowntrendOverbought | MarketRegime::DowntrendContinuation => {
                trend_following::evaluate(&ctx, crate::types::Side::Short)
            }
            MarketRegime::DowntrendOversold => StrategyResult::wait(
                symbol,
                StrategyKind::None,
                "downtrend oversold: short exhausted, no counter-trend entry",
                metrics,
            ),
            MarketRegime::RangingOversold => {
                mean_reversion::evaluate(&ctx, crate::types::Side::Long)
            }
            MarketRegime::RangingOverbought => {
                mean_reversion::evaluate(&ctx, crate::types::Side::Short)
            }
            MarketRegime::RangingNeutral => breakout::evaluate(&ctx),
            MarketRegime::NoClearSignal => {
                StrategyResult::wait(symbol, StrategyKind::None, "no clear signal", metrics)
            }
        };

        debug!(
            symbol,
            regime = %analysis.regime,
            action = %result.action,
            strategy = %result.strategy_type,
            strength = format!("{:.2}", result.signal_strength),
            leverage = format!("{:.1}", result.recommended_leverage),
            reason = %result.reason,
            "strategy routed"
        );

        result
    }
}
