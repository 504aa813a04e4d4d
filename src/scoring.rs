// =============================================================================
// Opportunity scorer — one comparable 0–100 number per symbol
// =============================================================================
//
// Breakdown caps: signal strength 30, trend consistency 25, volatility fit
// 20, risk/reward 15, liquidity 10. Wait-actions receive a small regime-based
// floor score with an empty breakdown so the ranking still reflects "almost"
// setups.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::regime::{MarketRegime, RegimeAnalysis};
use crate::strategy::StrategyResult;
use crate::types::{Action, ConfidenceTier};

/// Component contributions to the total score.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// <= 30
    pub signal_strength: f64,
    /// <= 25
    pub trend_consistency: f64,
    /// <= 20
    pub volatility_fit: f64,
    /// <= 15
    pub risk_reward: f64,
    /// <= 10
    pub liquidity: f64,
}

/// A scored opportunity, ready for ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityScore {
    pub symbol: String,
    pub total: u32,
    pub breakdown: ScoreBreakdown,
    pub confidence: ConfidenceTier,
    pub recommendation: String,
}

/// Scorer parameters resolved from configuration.
pub struct OpportunityScorer {
    pub min_score: f64,
    pub max_results: usize,
}

impl OpportunityScorer {
    pub fn new(min_score: f64, max_results: usize) -> Self {
        Self { min_score, max_results }
    }

    /// Score one strategy result against its regime analysis.
    pub fn score(&self, strategy: &StrategyResult, analysis: &RegimeAnalysis) -> OpportunityScore {
        if strategy.action == Action::Wait {
            let floor = wait_floor(analysis.regime);
            return OpportunityScore {
                symbol: strategy.symbol.clone(),
                total: floor,
                breakdown: ScoreBreakdown::default(),
                confidence: confidence_bucket(floor as f64),
                recommendation: format!("wait ({})", strategy.reason),
            };
        }

        let breakdown = ScoreBreakdown {
            signal_strength: 30.0 * strategy.signal_strength.clamp(0.0, 1.0),
            trend_consistency: 25.0 * analysis.timeframe_alignment.score.clamp(0.0, 1.0),
            volatility_fit: 20.0 * volatility_fit(strategy.key_metrics.atr_ratio),
            risk_reward: 15.0
                * risk_reward_factor(analysis.regime, strategy.recommended_leverage),
            liquidity: 10.0 * liquidity_factor(&strategy.symbol),
        };

        let total = (breakdown.signal_strength
            + breakdown.trend_consistency
            + breakdown.volatility_fit
            + breakdown.risk_reward
            + breakdown.liquidity)
            .round()
            .clamp(0.0, 100.0) as u32;

        let confidence = confidence_bucket(total as f64);

        let recommendation = match confidence {
            ConfidenceTier::High => format!("strong {} candidate", strategy.action),
            ConfidenceTier::Medium => format!("acceptable {} candidate", strategy.action),
            ConfidenceTier::Low => "marginal — prefer better setups".to_string(),
        };

        debug!(
            symbol = %strategy.symbol,
            total,
            signal = format!("{:.1}", breakdown.signal_strength),
            consistency = format!("{:.1}", breakdown.trend_consistency),
            vol_fit = format!("{:.1}", breakdown.volatility_fit),
            rr = format!("{:.1}", breakdown.risk_reward),
            liquidity = format!("{:.1}", breakdown.liquidity),
            "opportunity scored"
        );

        OpportunityScore {
            symbol: strategy.symbol.clone(),
            total,
            breakdown,
            confidence,
            recommendation,
        }
    }

    /// Filter by the minimum score, drop symbols with open positions (unless
    /// opted in), sort descending and truncate.
    pub fn rank(
        &self,
        mut scores: Vec<OpportunityScore>,
        open_symbols: &[String],
        include_open_positions: bool,
    ) -> Vec<OpportunityScore> {
        scores.retain(|s| s.total as f64 >= self.min_score);
        if !include_open_positions {
            scores.retain(|s| !open_symbols.iter().any(|o| o == &s.symbol));
        }
        scores.sort_by(|a, b| b.total.cmp(&a.total));
        scores.truncate(self.max_results);
        scores
    }
}

/// Floor score for wait-actions so near-misses still rank above noise.
fn wait_floor(regime: MarketRegime) -> u32 {
    match regime {
        // A missed extreme is worth watching closely.
        MarketRegime::UptrendOversold | MarketRegime::DowntrendOverbought => 55,
        MarketRegime::UptrendContinuation | MarketRegime::DowntrendContinuation => 45,
        MarketRegime::RangingOversold
        | MarketRegime::RangingOverbought
        | MarketRegime::RangingNeutral => 30,
        _ => 0,
    }
}

/// 1.0 inside the comfortable [0.8, 1.2] band, tapering to a 0.3 floor.
fn volatility_fit(atr_ratio: f64) -> f64 {
    if (0.8..=1.2).contains(&atr_ratio) {
        1.0
    } else if atr_ratio < 0.8 {
        (1.0 - (0.8 - atr_ratio)).max(0.3)
    } else {
        (1.0 - (atr_ratio - 1.2)).max(0.3)
    }
}

/// Regime-driven risk/reward expectation, damped when leverage leaves [3, 5].
fn risk_reward_factor(regime: MarketRegime, leverage: f64) -> f64 {
    let base = match regime {
        MarketRegime::UptrendOversold | MarketRegime::DowntrendOverbought => 0.9,
        MarketRegime::UptrendContinuation | MarketRegime::DowntrendContinuation => 0.7,
        MarketRegime::RangingOversold | MarketRegime::RangingOverbought => 0.8,
        _ => 0.6,
    };
    if (3.0..=5.0).contains(&leverage) {
        base
    } else {
        base * 0.85
    }
}

/// Liquidity tiers: majors, second tier, everything else.
fn liquidity_factor(symbol: &str) -> f64 {
    match symbol {
        "BTC" | "ETH" => 1.0,
        "SOL" | "BNB" | "XRP" => 0.8,
        _ => 0.6,
    }
}

fn confidence_bucket(total: f64) -> ConfidenceTier {
    if total >= 75.0 {
        ConfidenceTier::High
    } else if total >= 60.0 {
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
    use crate::config::RegimeThresholds;
    use crate::indicators::TimeframeIndicators;
    use crate::regime::RegimeClassifier;
    use crate::strategy::StrategyMetrics;
    use crate::types::StrategyKind;

    fn analysis(regime_rsi: f64) -> RegimeAnalysis {
        let mut primary = TimeframeIndicators::empty();
        primary.close = 100.0;
        primary.ema20 = 105.0;
        primary.ema50 = 100.0;
        primary.macd = 2.0;
        primary.rsi7 = 55.0;
        primary.atr_ratio = 1.0;
        let mut confirm = primary.clone();
        confirm.rsi7 = regime_rsi;
        let filter = primary.clone();
        RegimeClassifier::new(RegimeThresholds::default())
            .classify("ETH", &primary, &confirm, &filter)
    }

    fn entry(symbol: &str, strength: f64, leverage: f64, atr_ratio: f64) -> StrategyResult {
        StrategyResult {
            symbol: symbol.to_string(),
            action: Action::Long,
            confidence: ConfidenceTier::Medium,
            signal_strength: strength,
            recommended_leverage: leverage,
            strategy_type: StrategyKind::TrendFollowing,
            reason: "test".into(),
            warnings: Vec::new(),
            key_metrics: StrategyMetrics {
                rsi7: 40.0,
                macd: 1.0,
                atr_ratio,
                volume_ratio: 1.0,
                alignment: 0.9,
            },
        }
    }

    #[test]
    fn wait_gets_regime_floor() {
        let scorer = OpportunityScorer::new(40.0, 5);
        let a = analysis(15.0); // uptrend_oversold — the missed extreme
        let mut wait = entry("ETH", 0.0, 0.0, 1.0);
        wait.action = Action::Wait;

        let score = scorer.score(&wait, &a);
        assert_eq!(score.total, 55);
        assert_eq!(score.breakdown, ScoreBreakdown::default());
    }

    #[test]
    fn strong_entry_scores_high() {
        let scorer = OpportunityScorer::new(40.0, 5);
        let a = analysis(15.0);
        // strength 0.9, leverage 4 (inside band), perfect vol, major symbol
        let score = scorer.score(&entry("ETH", 0.9, 4.0, 1.0), &a);
        // 27 + 25*align(1.0) + 20 + 13.5 + 10 = 95.5ish with full alignment
        assert!(score.total >= 75, "got {}", score.total);
        assert_eq!(score.confidence, ConfidenceTier::High);
    }

    #[test]
    fn leverage_outside_band_damps_rr() {
        let scorer = OpportunityScorer::new(0.0, 5);
        let a = analysis(15.0);
        let inside = scorer.score(&entry("ETH", 0.5, 4.0, 1.0), &a);
        let outside = scorer.score(&entry("ETH", 0.5, 8.0, 1.0), &a);
        assert!(inside.breakdown.risk_reward > outside.breakdown.risk_reward);
    }

    #[test]
    fn volatility_fit_tapers_with_floor() {
        assert_eq!(volatility_fit(1.0), 1.0);
        assert!((volatility_fit(1.5) - 0.7).abs() < 1e-9);
        assert_eq!(volatility_fit(3.0), 0.3);
        assert_eq!(volatility_fit(0.05), 0.3);
    }

    #[test]
    fn liquidity_tiers() {
        assert_eq!(liquidity_factor("BTC"), 1.0);
        assert_eq!(liquidity_factor("SOL"), 0.8);
        assert_eq!(liquidity_factor("DOGE"), 0.6);
    }

    #[test]
    fn ranking_filters_sorts_truncates() {
        let scorer = OpportunityScorer::new(40.0, 2);
        let mk = |sym: &str, total: u32| OpportunityScore {
            symbol: sym.into(),
            total,
            breakdown: ScoreBreakdown::default(),
            confidence: ConfidenceTier::Low,
            recommendation: String::new(),
        };

        let ranked = scorer.rank(
            vec![mk("A", 80), mk("B", 35), mk("C", 60), mk("D", 70)],
            &["D".to_string()],
            false,
        );
        // B below min_score, D has an open position, top 2 of the rest.
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].symbol, "A");
        assert_eq!(ranked[1].symbol, "C");
    }

    #[test]
    fn include_open_positions_opt_in() {
        let scorer = OpportunityScorer::new(0.0, 10);
        let mk = |sym: &str, total: u32| OpportunityScore {
            symbol: sym.into(),
            total,
            breakdown: ScoreBreakdown::default(),
            confidence: ConfidenceTier::Low,
            recommendation: String::new(),
        };
        let ranked = scorer.rank(vec![mk("D", 70)], &["D".to_string()], true);
        assert_eq!(ranked.len(), 1);
    }
}
