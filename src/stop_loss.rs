// =============================================================================
// Stop-loss engine — ATR and structural synthesis with validation invariants
// =============================================================================
//
// For a prospective (or open) position:
//   ATR stop        entry -/+ atr * multiplier on the loss side
//   Structural stop lowest local low (long) / highest high (short) over the
//                   lookback window, padded by a buffer percentage; discarded
//                   when it lands on the wrong side of entry
//   Hybrid          when both exist, the TIGHTER one (closer to entry) wins
//   Floor           if everything lands on the wrong side, or the distance is
//                   under the configured minimum, the stop is widened to the
//                   min_stop_pct floor with a warning
//
// Invariant: long stops sit strictly below entry, short stops strictly above.
// Trailing recomputation uses the current price as the pivot and only ever
// tightens — the engine never widens a stop.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StopLossParams;
use crate::indicators::atr::{calculate_atr, calculate_atr_pct};
use crate::market::Candle;
use crate::types::Side;

/// How the final stop price was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    Atr,
    SupportResistance,
    Hybrid,
}

/// Volatility bucket derived from ATR as a percentage of price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityLevel {
    Low,
    Medium,
    High,
    Extreme,
}

/// Qualitative read of the stop's environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub is_noisy: bool,
    pub volatility_level: VolatilityLevel,
    pub recommendation: String,
}

/// Intermediate values retained for diagnostics and the agent tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDetails {
    pub atr: f64,
    pub atr_pct: f64,
    pub atr_stop: Option<f64>,
    pub structural_stop: Option<f64>,
    /// The raw lookback extreme behind the structural stop.
    pub structural_level: Option<f64>,
    /// True when the min-distance floor had to take over.
    pub floored: bool,
}

/// Complete stop computation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossResult {
    pub stop_price: f64,
    pub distance_pct: f64,
    pub method: StopMethod,
    pub details: StopDetails,
    /// 0–100; higher is a cleaner, better-placed stop.
    pub quality_score: f64,
    pub risk_assessment: RiskAssessment,
}

/// Outcome of a trailing-stop recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingDecision {
    pub should_update: bool,
    pub new_stop: Option<f64>,
    pub reason: String,
}

/// The engine. Stateless beyond its parameters.
pub struct StopLossEngine {
    params: StopLossParams,
}

impl StopLossEngine {
    pub fn new(params: StopLossParams) -> Self {
        Self { params }
    }

    /// Candles needed for a trustworthy computation.
    pub fn required_candles(&self) -> usize {
        self.params.atr_period.max(self.params.lookback_period) + 1 + 10
    }

    /// Compute the stop for `side` at `entry_price` from the candle history.
    pub fn compute(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        candles: &[Candle],
    ) -> StopLossResult {
        let p = &self.params;

        if entry_price <= 0.0 || !entry_price.is_finite() {
            return degenerate_result(side, entry_price);
        }

        let atr = calculate_atr(candles, p.atr_period).unwrap_or(0.0);
        let atr_pct = calculate_atr_pct(candles, p.atr_period).unwrap_or(0.0);
        let sign = side.sign();

        // ── ATR stop ─────────────────────────────────────────────────────
        let atr_stop = if atr > 0.0 {
            Some(entry_price - sign * atr * p.atr_multiplier)
        } else {
            None
        };

        // ── Structural stop ──────────────────────────────────────────────
        let window = if candles.len() > p.lookback_period {
            &candles[candles.len() - p.lookback_period..]
        } else {
            candles
        };
        let (structural_level, structural_stop) = if window.is_empty() {
            (None, None)
        } else {
            match side {
                Side::Long => {
                    let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
                    let stop = low * (1.0 - p.buffer_pct / 100.0);
                    (Some(low), Some(stop))
                }
                Side::Short => {
                    let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
                    let stop = high * (1.0 + p.buffer_pct / 100.0);
                    (Some(high), Some(stop))
                }
            }
        };

        // Discard a structural stop on the wrong side of entry.
        let structural_stop = structural_stop.filter(|s| loss_side(side, entry_price, *s));
        let atr_stop_valid = atr_stop.filter(|s| loss_side(side, entry_price, *s));

        // ── Hybrid selection: the tighter stop wins ──────────────────────
        let mut floored = false;
        let (mut stop_price, method) = match (atr_stop_valid, structural_stop) {
            (Some(a), Some(s)) => {
                let tighter = match side {
                    Side::Long => a.max(s),
                    Side::Short => a.min(s),
                };
                (tighter, StopMethod::Hybrid)
            }
            (Some(a), None) => (a, StopMethod::Atr),
            (None, Some(s)) => (s, StopMethod::SupportResistance),
            (None, None) => {
                floored = true;
                (floor_stop(side, entry_price, p.min_stop_pct), StopMethod::Atr)
            }
        };

        // ── Min-distance floor ───────────────────────────────────────────
        let distance_pct = percent_distance(entry_price, stop_price);
        if !floored && distance_pct < p.min_stop_pct {
            warn!(
                symbol,
                side = %side,
                stop = stop_price,
                distance_pct = format!("{:.2}", distance_pct),
                floor_pct = p.min_stop_pct,
                "stop inside the minimum-distance floor — widening"
            );
            stop_price = floor_stop(side, entry_price, p.min_stop_pct);
            floored = true;
        }
        let distance_pct = percent_distance(entry_price, stop_price);

        // ── Quality score ────────────────────────────────────────────────
        let mut quality: f64 = 50.0;
        if (1.5..=3.0).contains(&atr_pct) {
            quality += 20.0;
        } else if atr_pct > 0.0 && atr_pct < 1.5 {
            quality += 10.0;
        }
        if (1.5..=3.0).contains(&distance_pct) {
            quality += 20.0;
        } else if distance_pct < 1.5 {
            quality += 10.0;
        }
        if structural_stop.is_some() {
            quality += 10.0;
        }
        let quality_score = quality.clamp(0.0, 100.0);

        let volatility_level = volatility_level(atr_pct);
        let risk_assessment = RiskAssessment {
            is_noisy: atr_pct >= 3.0,
            volatility_level,
            recommendation: match volatility_level {
                VolatilityLevel::Extreme => {
                    "extreme volatility — smaller position or skip".to_string()
                }
                VolatilityLevel::High => "high volatility — reduce size".to_string(),
                VolatilityLevel::Medium => "normal conditions".to_string(),
                VolatilityLevel::Low => "quiet tape — stop may sit close".to_string(),
            },
        };

        debug!(
            symbol,
            side = %side,
            entry = entry_price,
            stop = stop_price,
            method = ?method,
            distance_pct = format!("{:.2}", distance_pct),
            quality = quality_score,
            "stop computed"
        );

        StopLossResult {
            stop_price,
            distance_pct,
            method,
            details: StopDetails {
                atr,
                atr_pct,
                atr_stop,
                structural_stop,
                structural_level,
                floored,
            },
            quality_score,
            risk_assessment,
        }
    }

    /// Open-gate: should a new position be allowed with this stop?
    pub fn should_open_position(&self, result: &StopLossResult) -> (bool, String) {
        if result.distance_pct > self.params.max_stop_pct {
            return (
                false,
                format!(
                    "stop distance {:.2}% exceeds maximum {:.2}%",
                    result.distance_pct, self.params.max_stop_pct
                ),
            );
        }
        if result.risk_assessment.volatility_level == VolatilityLevel::Extreme {
            return (false, "extreme volatility".to_string());
        }
        if result.quality_score < self.params.min_quality_score {
            return (
                false,
                format!(
                    "quality score {:.0} below required {:.0}",
                    result.quality_score, self.params.min_quality_score
                ),
            );
        }
        (true, "stop accepted".to_string())
    }

    /// Recompute the stop using the CURRENT price as the pivot; accept only a
    /// strictly favourable move. The engine never widens stops.
    pub fn propose_trailing(
        &self,
        symbol: &str,
        side: Side,
        current_price: f64,
        current_stop: f64,
        candles: &[Candle],
    ) -> TrailingDecision {
        let recomputed = self.compute(symbol, side, current_price, candles);
        let candidate = recomputed.stop_price;

        let improves = match side {
            Side::Long => candidate > current_stop,
            Side::Short => candidate < current_stop,
        };

        if !improves {
            return TrailingDecision {
                should_update: false,
                new_stop: None,
                reason: format!(
                    "candidate {candidate:.4} does not improve on current stop {current_stop:.4}"
                ),
            };
        }

        // The new stop must still sit on the loss side of the current price.
        if !loss_side(side, current_price, candidate) {
            return TrailingDecision {
                should_update: false,
                new_stop: None,
                reason: format!("candidate {candidate:.4} is on the wrong side of price"),
            };
        }

        TrailingDecision {
            should_update: true,
            new_stop: Some(candidate),
            reason: format!("stop tightened from {current_stop:.4} to {candidate:.4}"),
        }
    }
}

/// True when `stop` lies on the loss side of `entry` for `side`.
fn loss_side(side: Side, entry: f64, stop: f64) -> bool {
    match side {
        Side::Long => stop < entry,
        Side::Short => stop > entry,
    }
}

fn floor_stop(side: Side, entry: f64, min_stop_pct: f64) -> f64 {
    entry * (1.0 - side.sign() * min_stop_pct / 100.0)
}

fn percent_distance(entry: f64, stop: f64) -> f64 {
    ((entry - stop).abs() / entry) * 100.0
}

fn volatility_level(atr_pct: f64) -> VolatilityLevel {
    if atr_pct < 1.5 {
        VolatilityLevel::Low
    } else if atr_pct < 3.0 {
        VolatilityLevel::Medium
    } else if atr_pct < 5.0 {
        VolatilityLevel::High
    } else {
        VolatilityLevel::Extreme
    }
}

fn degenerate_result(side: Side, entry_price: f64) -> StopLossResult {
    StopLossResult {
        stop_price: 0.0,
        distance_pct: 0.0,
        method: StopMethod::Atr,
        details: StopDetails {
            atr: 0.0,
            atr_pct: 0.0,
            atr_stop: None,
            structural_stop: None,
            structural_level: None,
            floored: true,
        },
        quality_score: 0.0,
        risk_assessment: RiskAssessment {
            is_noisy: false,
            volatility_level: VolatilityLevel::Extreme,
            recommendation: format!("unusable entry price {entry_price} for {side}"),
        },
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Candles whose lows follow `lows` with a constant 24-point range and
    /// mid closes. Any walk with steps <= 12 keeps every True Range at 24,
    /// so ATR(14) is exactly 24.
    fn walk_candles(lows: &[f64]) -> Vec<Candle> {
        lows.iter()
            .enumerate()
            .map(|(i, &low)| {
                Candle::new(i as i64 * 60_000, low + 12.0, low + 24.0, low, low + 12.0, 100.0)
            })
            .collect()
    }

    /// The hybrid scenario: ATR 24, lookback low 2940.
    fn scenario_candles() -> Vec<Candle> {
        let mut lows = vec![2988.0; 20];
        lows.extend_from_slice(&[
            2976.0, 2964.0, 2952.0, 2940.0, 2940.0, 2940.0, 2952.0, 2964.0, 2976.0, 2988.0,
        ]);
        lows.extend(std::iter::repeat(2988.0).take(10));
        walk_candles(&lows)
    }

    fn engine() -> StopLossEngine {
        StopLossEngine::new(StopLossParams {
            atr_period: 14,
            atr_multiplier: 2.0,
            lookback_period: 20,
            buffer_pct: 0.5,
            min_stop_pct: 1.0,
            max_stop_pct: 5.0,
            min_quality_score: 40.0,
        })
    }

    #[test]
    fn hybrid_picks_the_tighter_stop() {
        let candles = scenario_candles();
        let result = engine().compute("ETH", Side::Long, 3000.0, &candles);

        // ATR is exactly 24: ATR stop = 3000 - 2*24 = 2952.
        assert!((result.details.atr - 24.0).abs() < 1e-9, "atr = {}", result.details.atr);
        assert!((result.details.atr_stop.unwrap() - 2952.0).abs() < 1e-9);

        // Structural: lookback low 2940 with 0.5% buffer = 2925.3.
        assert!((result.details.structural_level.unwrap() - 2940.0).abs() < 1e-9);
        assert!((result.details.structural_stop.unwrap() - 2925.3).abs() < 1e-9);

        // Hybrid picks the tighter (closer to entry) of the two: 2952.
        assert_eq!(result.method, StopMethod::Hybrid);
        assert!((result.stop_price - 2952.0).abs() < 1e-9);
        assert!((result.distance_pct - 1.6).abs() < 1e-9);
        assert!(result.quality_score >= 80.0, "quality = {}", result.quality_score);
        assert!(!result.details.floored);
    }

    #[test]
    fn long_stop_below_entry_short_above() {
        let candles = scenario_candles();
        let e = engine();
        let long = e.compute("ETH", Side::Long, 3000.0, &candles);
        assert!(long.stop_price < 3000.0);

        let short = e.compute("ETH", Side::Short, 3000.0, &candles);
        assert!(short.stop_price > 3000.0);
    }

    #[test]
    fn zero_candles_fall_back_to_floor() {
        let result = engine().compute("ETH", Side::Long, 3000.0, &[]);
        assert!(result.details.floored);
        // Floor is the 1% minimum: 2970.
        assert!((result.stop_price - 2970.0).abs() < 1e-9);
        assert!((result.distance_pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unusable_entry_price_is_degenerate() {
        let result = engine().compute("ETH", Side::Long, 0.0, &scenario_candles());
        assert_eq!(result.stop_price, 0.0);
        assert_eq!(result.quality_score, 0.0);
        let (ok, _) = engine().should_open_position(&result);
        assert!(!ok);
    }

    #[test]
    fn too_tight_stop_widened_to_floor() {
        // Quiet tape: tiny ATR around a 3000 entry makes the stop hug price.
        let lows: Vec<f64> = vec![2999.0; 40];
        let mut candles = walk_candles(&lows);
        // Compress ranges to 2 points to force a sub-1% distance.
        for c in &mut candles {
            c.high = c.low + 2.0;
            c.open = c.low + 1.0;
            c.close = c.low + 1.0;
        }
        let result = engine().compute("ETH", Side::Long, 3000.0, &candles);
        assert!(result.details.floored);
        assert!((result.distance_pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn open_gate_rejects_wide_stops() {
        let mut result = engine().compute("ETH", Side::Long, 3000.0, &scenario_candles());
        result.distance_pct = 7.0;
        let (ok, reason) = engine().should_open_position(&result);
        assert!(!ok);
        assert!(reason.contains("exceeds"));
    }

    #[test]
    fn open_gate_rejects_extreme_volatility() {
        let mut result = engine().compute("ETH", Side::Long, 3000.0, &scenario_candles());
        result.risk_assessment.volatility_level = VolatilityLevel::Extreme;
        let (ok, reason) = engine().should_open_position(&result);
        assert!(!ok);
        assert!(reason.contains("volatility"));
    }

    #[test]
    fn open_gate_rejects_low_quality() {
        let mut result = engine().compute("ETH", Side::Long, 3000.0, &scenario_candles());
        result.quality_score = 30.0;
        let (ok, reason) = engine().should_open_position(&result);
        assert!(!ok);
        assert!(reason.contains("quality"));
    }

    #[test]
    fn open_gate_accepts_clean_stop() {
        let result = engine().compute("ETH", Side::Long, 3000.0, &scenario_candles());
        let (ok, _) = engine().should_open_position(&result);
        assert!(ok);
    }

    #[test]
    fn trailing_accepts_only_favourable_moves() {
        let candles = scenario_candles();
        let e = engine();

        // Price has advanced to 3100: recomputed stop = max(3100-48, structural)
        // = 3052 — strictly above the current 2990, so accept.
        let decision = e.propose_trailing("ETH", Side::Long, 3100.0, 2990.0, &candles);
        assert!(decision.should_update);
        let new_stop = decision.new_stop.unwrap();
        assert!(new_stop > 2990.0);

        // A later recomputation that lands at or below the ratcheted stop is
        // rejected: the engine never widens.
        let decision = e.propose_trailing("ETH", Side::Long, 3100.0, new_stop, &candles);
        assert!(!decision.should_update);
        assert!(decision.new_stop.is_none());
    }

    #[test]
    fn trailing_short_mirrors() {
        let candles = scenario_candles();
        let e = engine();
        // Short from above; price fell to 2900. Candidate = min(2900+48, high-buffer).
        let decision = e.propose_trailing("ETH", Side::Short, 2900.0, 3010.0, &candles);
        assert!(decision.should_update);
        assert!(decision.new_stop.unwrap() < 3010.0);
    }

    #[test]
    fn volatility_levels() {
        assert_eq!(volatility_level(1.0), VolatilityLevel::Low);
        assert_eq!(volatility_level(2.0), VolatilityLevel::Medium);
        assert_eq!(volatility_level(4.0), VolatilityLevel::High);
        assert_eq!(volatility_level(6.0), VolatilityLevel::Extreme);
    }
}
