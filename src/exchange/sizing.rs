// =============================================================================
// Sizing & PnL math — the only place that quantises sizes and formats prices
// =============================================================================
//
// Linear (USDT-margined):
//   quantity = floor_to_step(margin * leverage / price, min_size)
//   pnl      = quantity * (exit - entry)            (sign flipped for shorts)
//
// Inverse (coin-margined, integer contracts * quanto multiplier):
//   contracts = floor(margin * leverage / (multiplier * price))
//   pnl       = contracts * multiplier * (exit - entry)   (sign by side)
//
// No caller formats a price by hand; everything goes through format_price.
// =============================================================================

use crate::types::Side;

/// Absorbs float fuzz before flooring (e.g. 0.30000000000000004 / 0.1).
const STEP_EPSILON: f64 = 1e-9;

/// Floor `value` to an integer multiple of `step`. A zero or negative step
/// returns the value unchanged.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    ((value / step) + STEP_EPSILON).floor() * step
}

/// Quantise a price to the contract tick (rounds to the nearest tick).
pub fn quantize_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 || !price.is_finite() {
        return price;
    }
    (price / tick_size).round() * tick_size
}

/// Render a price as the exchange expects it: quantised to the tick, then
/// fixed to `price_decimals` places.
pub fn format_price(price: f64, tick_size: f64, price_decimals: u32) -> String {
    let quantised = quantize_to_tick(price, tick_size);
    format!("{:.*}", price_decimals as usize, quantised)
}

/// Clamp a limit price into the exchange's acceptance band around the mark
/// price (±`band_pct` percent). No-op when no mark is known.
pub fn clamp_price_to_mark(price: f64, mark: Option<f64>, band_pct: f64) -> f64 {
    match mark {
        Some(m) if m > 0.0 => {
            let lo = m * (1.0 - band_pct / 100.0);
            let hi = m * (1.0 + band_pct / 100.0);
            price.clamp(lo, hi)
        }
        _ => price,
    }
}

/// Clamp a quantised size into `[min_size, min(max_size, api_cap)]`.
/// Returns `None` when even the minimum does not fit.
pub fn clamp_order_size(size: f64, min_size: f64, max_size: f64, api_cap: f64) -> Option<f64> {
    let hi = max_size.min(api_cap);
    if size + STEP_EPSILON < min_size || hi < min_size {
        return None;
    }
    Some(size.min(hi))
}

// -----------------------------------------------------------------------------
// Linear variant
// -----------------------------------------------------------------------------

/// Quantity (in base units) purchasable with `margin` USDT at `leverage`,
/// floored to the contract's minimum-size step.
pub fn linear_quantity_from_usdt(margin: f64, price: f64, leverage: f64, min_size: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    floor_to_step((margin * leverage) / price, min_size)
}

/// Signed PnL for the linear variant. `quantity` is always positive.
pub fn linear_pnl(entry: f64, exit: f64, quantity: f64, side: Side) -> f64 {
    side.sign() * quantity * (exit - entry)
}

// -----------------------------------------------------------------------------
// Inverse variant
// -----------------------------------------------------------------------------

/// Integer contract count purchasable with `margin` at `leverage` on a
/// coin-margined contract with the given quanto multiplier.
pub fn inverse_contracts_from_usdt(margin: f64, price: f64, leverage: f64, multiplier: f64) -> f64 {
    if price <= 0.0 || multiplier <= 0.0 {
        return 0.0;
    }
    (((margin * leverage) / (multiplier * price)) + STEP_EPSILON).floor()
}

/// Signed PnL for the inverse variant. `contracts` is always positive.
pub fn inverse_pnl(entry: f64, exit: f64, contracts: f64, multiplier: f64, side: Side) -> f64 {
    side.sign() * contracts * multiplier * (exit - entry)
}
