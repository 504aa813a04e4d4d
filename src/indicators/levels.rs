// =============================================================================
// Structural price levels — recent extremes and local support/resistance
// =============================================================================
//
// A local high is a candle whose high is strictly greater than both immediate
// neighbours on each side; local lows are mirrored. Up to three of the most
// recent extrema are retained, nearest-last.
// =============================================================================

use crate::market::Candle;

/// Maximum number of retained support/resistance levels.
const MAX_LEVELS: usize = 3;

/// Highest high over the trailing `window` candles. 0.0 when empty.
pub fn recent_high(candles: &[Candle], window: usize) -> f64 {
    let t = tail(candles, window);
    if t.is_empty() {
        return 0.0;
    }
    t.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max)
}

/// Lowest low over the trailing `window` candles. 0.0 when empty.
pub fn recent_low(candles: &[Candle], window: usize) -> f64 {
    let t = tail(candles, window);
    if t.is_empty() {
        return 0.0;
    }
    t.iter().map(|c| c.low).fold(f64::INFINITY, f64::min)
}

/// Up to three local-high resistance levels from the trailing `window`
/// candles, most recent last.
pub fn resistance_levels(candles: &[Candle], window: usize) -> Vec<f64> {
    let t = tail(candles, window);
    let mut levels = Vec::new();
    for i in 1..t.len().saturating_sub(1) {
        if t[i].high > t[i - 1].high && t[i].high > t[i + 1].high {
            levels.push(t[i].high);
        }
    }
    trim_levels(levels)
}

/// Up to three local-low support levels from the trailing `window` candles,
/// most recent last.
pub fn support_levels(candles: &[Candle], window: usize) -> Vec<f64> {
    let t = tail(candles, window);
    let mut levels = Vec::new();
    for i in 1..t.len().saturating_sub(1) {
        if t[i].low < t[i - 1].low && t[i].low < t[i + 1].low {
            levels.push(t[i].low);
        }
    }
    trim_levels(levels)
}

fn tail(candles: &[Candle], window: usize) -> &[Candle] {
    if candles.len() <= window {
        candles
    } else {
        &candles[candles.len() - window..]
    }
}

fn trim_levels(mut levels: Vec<f64>) -> Vec<f64> {
    if levels.len() > MAX_LEVELS {
        levels.drain(..levels.len() - MAX_LEVELS);
    }
    levels
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64) -> Candle {
        Candle::new(0, (high + low) / 2.0, high, low, (high + low) / 2.0, 10.0)
    }

    #[test]
    fn empty_input_defaults() {
        assert_eq!(recent_high(&[], 20), 0.0);
        assert_eq!(recent_low(&[], 20), 0.0);
        assert!(resistance_levels(&[], 20).is_empty());
        assert!(support_levels(&[], 20).is_empty());
    }

    #[test]
    fn recent_extremes_respect_window() {
        let mut candles = vec![candle(500.0, 400.0)]; // outside the window
        for _ in 0..20 {
            candles.push(candle(110.0, 90.0));
        }
        assert!((recent_high(&candles, 20) - 110.0).abs() < 1e-9);
        assert!((recent_low(&candles, 20) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn local_extrema_require_strict_neighbours() {
        // highs: 100, 105, 100, 100, 100 — single pivot at 105
        let candles = vec![
            candle(100.0, 95.0),
            candle(105.0, 96.0),
            candle(100.0, 93.0),
            candle(100.0, 94.0),
            candle(100.0, 95.0),
        ];
        let res = resistance_levels(&candles, 20);
        assert_eq!(res, vec![105.0]);

        let sup = support_levels(&candles, 20);
        assert_eq!(sup, vec![93.0]);

        // A plateau is not a strict pivot.
        let flat = vec![
            candle(100.0, 95.0),
            candle(105.0, 94.0),
            candle(105.0, 94.0),
            candle(100.0, 95.0),
        ];
        assert!(resistance_levels(&flat, 20).is_empty());
    }

    #[test]
    fn at_most_three_levels_most_recent_kept() {
        // Alternating saw-tooth creates many pivots.
        let mut candles = Vec::new();
        for i in 0..30 {
            let peak = if i % 2 == 0 { 100.0 + i as f64 } else { 90.0 };
            candles.push(candle(peak, peak - 10.0));
        }
        let res = resistance_levels(&candles, 30);
        assert!(res.len() <= 3);
        // Most recent pivots retained — strictly increasing peaks here.
        assert!(res.windows(2).all(|w| w[0] < w[1]));
    }
}
