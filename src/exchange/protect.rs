// =============================================================================
// Protective-order planning — direction validation, adjustment, quantisation
// =============================================================================
//
// Both adapter variants submit protective stop-loss / take-profit legs from a
// plan built here, so the validation contract is implemented exactly once:
//
//   - Long:  stop < mark < take_profit.  Short: mirrored.
//   - A violating stop is re-derived once at a 1.5 % safety distance from the
//     mark; if the re-derived price is still invalid the operation fails with
//     PriceValidation.
//   - A violating take-profit leg is dropped (the stop must never be lost to
//     a bad TP), and the outcome message says so.
//   - Distances under 0.3 % of the mark warn but do not reject.
//   - Trigger prices are quantised to the contract tick.
// =============================================================================

use tracing::warn;

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::sizing::quantize_to_tick;
use crate::types::{PriceOrderKind, Side};

/// Safety distance used when re-deriving a rejected stop price, percent.
const SAFETY_DISTANCE_PCT: f64 = 1.5;

/// Minimum trigger distance from the mark before we warn, percent.
const MIN_TRIGGER_DISTANCE_PCT: f64 = 0.3;

/// One protective conditional-order leg, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerLeg {
    pub kind: PriceOrderKind,
    /// Quantised trigger price.
    pub trigger_price: f64,
    /// Close quantity — equals the current position quantity.
    pub quantity: f64,
}

/// Fully validated protection plan for one position.
#[derive(Debug, Clone, Default)]
pub struct ProtectionPlan {
    pub stop: Option<TriggerLeg>,
    pub take_profit: Option<TriggerLeg>,
    /// True when the stop had to be re-derived at the safety distance.
    pub stop_adjusted: bool,
    /// Human-readable notes accumulated during planning (warnings, drops).
    pub notes: Vec<String>,
}

/// Whether `price` is on the correct (loss) side of the mark for a stop.
fn stop_direction_ok(side: Side, mark: f64, price: f64) -> bool {
    match side {
        Side::Long => price < mark,
        Side::Short => price > mark,
    }
}

/// Whether `price` is on the correct (profit) side of the mark for a TP.
fn tp_direction_ok(side: Side, mark: f64, price: f64) -> bool {
    match side {
        Side::Long => price > mark,
        Side::Short => price < mark,
    }
}

/// The stop price re-derived at the safety distance from the mark.
fn safety_stop(side: Side, mark: f64) -> f64 {
    mark * (1.0 - side.sign() * SAFETY_DISTANCE_PCT / 100.0)
}

fn distance_pct(mark: f64, price: f64) -> f64 {
    if mark <= 0.0 {
        return 0.0;
    }
    ((price - mark).abs() / mark) * 100.0
}

/// Build a protection plan for the given position.
///
/// # Arguments
/// * `side`     — position direction (the triggers close against it).
/// * `mark`     — current mark price used for direction comparison.
/// * `stop`     — requested stop-loss trigger, if any.
/// * `take_profit` — requested take-profit trigger, if any.
/// * `quantity` — current position quantity (close size for both legs).
/// * `tick_size` — contract tick for trigger quantisation.
pub fn build_protection_plan(
    symbol: &str,
    side: Side,
    mark: f64,
    stop: Option<f64>,
    take_profit: Option<f64>,
    quantity: f64,
    tick_size: f64,
) -> ExchangeResult<ProtectionPlan> {
    if mark <= 0.0 || !mark.is_finite() {
        return Err(ExchangeError::InvalidArgument(format!(
            "{symbol}: mark price {mark} unusable for protective planning"
        )));
    }
    if quantity <= 0.0 {
        return Err(ExchangeError::InvalidArgument(format!(
            "{symbol}: protective close quantity must be positive, got {quantity}"
        )));
    }

    let mut plan = ProtectionPlan::default();

    // ── Stop leg ─────────────────────────────────────────────────────────
    if let Some(requested) = stop {
        let mut price = requested;
        if !stop_direction_ok(side, mark, price) {
            let adjusted = safety_stop(side, mark);
            warn!(
                symbol,
                side = %side,
                requested = price,
                mark,
                adjusted,
                "stop price on wrong side of mark — re-deriving at safety distance"
            );
            if !stop_direction_ok(side, mark, adjusted) {
                return Err(ExchangeError::PriceValidation(format!(
                    "{symbol}: stop {requested} invalid for {side} at mark {mark} and \
                     safety re-derivation {adjusted} is also invalid"
                )));
            }
            price = adjusted;
            plan.stop_adjusted = true;
            plan.notes
                .push(format!("stop re-derived to {adjusted:.8} at safety distance"));
        }

        if distance_pct(mark, price) < MIN_TRIGGER_DISTANCE_PCT {
            warn!(
                symbol,
                trigger = price,
                mark,
                min_pct = MIN_TRIGGER_DISTANCE_PCT,
                "stop trigger within minimum distance of mark"
            );
            plan.notes.push(format!(
                "stop trigger within {MIN_TRIGGER_DISTANCE_PCT}% of mark"
            ));
        }

        plan.stop = Some(TriggerLeg {
            kind: PriceOrderKind::StopLoss,
            trigger_price: quantize_to_tick(price, tick_size),
            quantity,
        });
    }

    // ── Take-profit leg ──────────────────────────────────────────────────
    if let Some(requested) = take_profit {
        if !tp_direction_ok(side, mark, requested) {
            warn!(
                symbol,
                side = %side,
                requested,
                mark,
                "take-profit on wrong side of mark — dropping TP leg"
            );
            plan.notes.push(format!(
                "take_profit {requested} rejected (wrong side of mark {mark}); TP unset"
            ));
        } else {
            if distance_pct(mark, requested) < MIN_TRIGGER_DISTANCE_PCT {
                warn!(
                    symbol,
                    trigger = requested,
                    mark,
                    "take-profit trigger within minimum distance of mark"
                );
                plan.notes.push(format!(
                    "take_profit trigger within {MIN_TRIGGER_DISTANCE_PCT}% of mark"
                ));
            }
            plan.take_profit = Some(TriggerLeg {
                kind: PriceOrderKind::TakeProfit,
                trigger_price: quantize_to_tick(requested, tick_size),
                quantity,
            });
        }
    }

    Ok(plan)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_long_plan() {
        let plan =
            build_protection_plan("ETH", Side::Long, 3000.0, Some(2952.0), Some(3150.0), 2.5, 0.01)
                .unwrap();
        let stop = plan.stop.unwrap();
        assert_eq!(stop.kind, PriceOrderKind::StopLoss);
        assert!((stop.trigger_price - 2952.0).abs() < 1e-9);
        assert_eq!(stop.quantity, 2.5);
        assert!(plan.take_profit.is_some());
        assert!(!plan.stop_adjusted);
    }

    #[test]
    fn wrong_side_stop_is_re_derived() {
        // A "stop" above the mark for a long gets re-derived 1.5 % below mark.
        let plan =
            build_protection_plan("ETH", Side::Long, 3000.0, Some(3100.0), None, 1.0, 0.01)
                .unwrap();
        let stop = plan.stop.unwrap();
        assert!(plan.stop_adjusted);
        assert!((stop.trigger_price - 2955.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_side_stop_short_mirrored() {
        let plan =
            build_protection_plan("ETH", Side::Short, 3000.0, Some(2900.0), None, 1.0, 0.01)
                .unwrap();
        let stop = plan.stop.unwrap();
        assert!(plan.stop_adjusted);
        assert!((stop.trigger_price - 3045.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_side_tp_is_dropped_not_fatal() {
        let plan =
            build_protection_plan("ETH", Side::Long, 3000.0, Some(2950.0), Some(2800.0), 1.0, 0.01)
                .unwrap();
        assert!(plan.stop.is_some());
        assert!(plan.take_profit.is_none());
        assert!(plan.notes.iter().any(|n| n.contains("TP unset")));
    }

    #[test]
    fn near_mark_trigger_warns_but_passes() {
        // 0.1 % away from mark — under the 0.3 % floor.
        let plan =
            build_protection_plan("ETH", Side::Long, 3000.0, Some(2997.0), None, 1.0, 0.01)
                .unwrap();
        assert!(plan.stop.is_some());
        assert!(plan.notes.iter().any(|n| n.contains("minimum distance") || n.contains("% of mark")));
    }

    #[test]
    fn triggers_are_tick_quantised() {
        let plan =
            build_protection_plan("BTC", Side::Long, 60_000.0, Some(59_123.37), None, 1.0, 0.5)
                .unwrap();
        let stop = plan.stop.unwrap();
        assert!((stop.trigger_price - 59_123.5).abs() < 1e-9);
    }

    #[test]
    fn unusable_inputs_rejected() {
        assert!(build_protection_plan("ETH", Side::Long, 0.0, Some(2950.0), None, 1.0, 0.01).is_err());
        assert!(
            build_protection_plan("ETH", Side::Long, 3000.0, Some(2950.0), None, 0.0, 0.01).is_err()
        );
    }
}
