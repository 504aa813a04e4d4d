// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle = SMA(period)
// Upper  = Middle + k * stddev
// Lower  = Middle - k * stddev
// Bandwidth = (Upper - Lower) / Middle * 100     (percent of price)
// =============================================================================

/// Bollinger band values for the latest close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width as a percentage of the middle band.
    pub bandwidth: f64,
}

/// Compute Bollinger bands over the trailing `period` closes with `k`
/// standard deviations. Returns `None` on insufficient or non-finite data.
pub fn calculate_bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let mean: f64 = window.iter().sum::<f64>() / period as f64;

    let variance: f64 =
        window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let stddev = variance.sqrt();

    if !mean.is_finite() || !stddev.is_finite() {
        return None;
    }

    let upper = mean + k * stddev;
    let lower = mean - k * stddev;
    let bandwidth = if mean != 0.0 {
        (upper - lower) / mean * 100.0
    } else {
        0.0
    };

    Some(BollingerBands {
        upper,
        middle: mean,
        lower,
        bandwidth,
    })
}

/// Standard 20-period / 2-sigma bands.
pub fn calculate_bollinger_default(closes: &[f64]) -> Option<BollingerBands> {
    calculate_bollinger(closes, 20, 2.0)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0], 20, 2.0).is_none());
        assert!(calculate_bollinger(&[1.0, 2.0], 0, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat_series_collapses() {
        let closes = [50.0; 30];
        let bb = calculate_bollinger_default(&closes).unwrap();
        assert!((bb.upper - 50.0).abs() < 1e-9);
        assert!((bb.middle - 50.0).abs() < 1e-9);
        assert!((bb.lower - 50.0).abs() < 1e-9);
        assert!(bb.bandwidth.abs() < 1e-9);
    }

    #[test]
    fn bollinger_ordering() {
        let closes: Vec<f64> = (0..40)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 5.0)
            .collect();
        let bb = calculate_bollinger_default(&closes).unwrap();
        assert!(bb.lower < bb.middle);
        assert!(bb.middle < bb.upper);
        assert!(bb.bandwidth > 0.0);
    }

    #[test]
    fn bollinger_uses_trailing_window() {
        // Early garbage must not affect the trailing window.
        let mut closes = vec![1000.0; 10];
        closes.extend(std::iter::repeat(100.0).take(20));
        let bb = calculate_bollinger_default(&closes).unwrap();
        assert!((bb.middle - 100.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_nan_returns_none() {
        let mut closes = vec![100.0; 20];
        closes[10] = f64::NAN;
        assert!(calculate_bollinger_default(&closes).is_none());
    }
}
