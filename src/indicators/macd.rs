// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
// MACD line  = EMA(fast) - EMA(slow)           (12 / 26 defaults)
// Signal     = EMA(MACD line, signal_period)    (9 default)
// Histogram  = MACD - Signal
//
// The "turn" classifier looks at the last three histogram values:
//   +1  upward pivot from below zero   (falling-then-rising, pivot < 0)
//   -1  downward pivot from above zero (rising-then-falling, pivot > 0)
//    0  otherwise
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// Latest MACD values plus the histogram series (needed for pivots and
/// divergence checks).
#[derive(Debug, Clone, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub histogram_series: Vec<f64>,
}

/// Compute MACD with the given periods. Returns `None` when there is not
/// enough data for the slow EMA plus the signal EMA.
pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 || fast_period >= slow_period {
        return None;
    }
    if closes.len() < slow_period + signal_period {
        return None;
    }

    let fast = calculate_ema(closes, fast_period);
    let slow = calculate_ema(closes, slow_period);
    if fast.is_empty() || slow.is_empty() {
        return None;
    }

    // Align the two series on their tails: both end at the latest close.
    let len = fast.len().min(slow.len());
    let fast_tail = &fast[fast.len() - len..];
    let slow_tail = &slow[slow.len() - len..];

    let macd_line: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal_period);
    if signal_series.is_empty() {
        return None;
    }

    let hist_len = signal_series.len();
    let macd_tail = &macd_line[macd_line.len() - hist_len..];
    let histogram_series: Vec<f64> = macd_tail
        .iter()
        .zip(signal_series.iter())
        .map(|(m, s)| m - s)
        .collect();

    let macd = *macd_line.last()?;
    let signal = *signal_series.last()?;
    let histogram = *histogram_series.last()?;
    if !macd.is_finite() || !signal.is_finite() || !histogram.is_finite() {
        return None;
    }

    Some(MacdResult {
        macd,
        signal,
        histogram,
        histogram_series,
    })
}

/// Standard 12/26/9 MACD.
pub fn calculate_macd_default(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}

/// Classify the last three histogram values into a turn signal.
pub fn macd_turn(histogram_series: &[f64]) -> i8 {
    let n = histogram_series.len();
    if n < 3 {
        return 0;
    }
    let a = histogram_series[n - 3];
    let b = histogram_series[n - 2];
    let c = histogram_series[n - 1];

    if b < a && b < c && b < 0.0 {
        1 // upward pivot from below zero
    } else if b > a && b > c && b > 0.0 {
        -1 // downward pivot from above zero
    } else {
        0
    }
}
