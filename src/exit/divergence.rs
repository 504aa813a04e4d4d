// =============================================================================
// Divergence detection — price/indicator disagreement over recent candles
// =============================================================================
//
// The last ~20 candles are split into two halves. Bearish divergence (against
// a long): the second half prints a higher price high while the MACD
// histogram peak drops below 95 % of the first half's, or the RSI peak sits
// at least 3 points lower. Bullish is mirrored against shorts at the lows.
//
// The indicator series are derived from the same price history that feeds
// the rest of the pipeline, so this is an approximation of true
// per-candle indicator history.
// =============================================================================

use crate::indicators::macd::calculate_macd_default;
use crate::indicators::rsi::calculate_rsi;
use crate::market::Candle;
use crate::types::Side;

/// Window examined for divergences.
const WINDOW: usize = 20;

/// Histogram shrink factor that counts as divergence.
const MACD_SHRINK: f64 = 0.95;

/// RSI points the second peak must fall short by.
const RSI_POINTS: f64 = 3.0;

/// Minimum strength for a divergence to contribute to a reversal score.
pub const MIN_STRENGTH: u8 = 60;

/// A detected divergence against the position's direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    /// 0-100.
    pub strength: u8,
}

/// MACD-histogram divergence against a position of `side`.
/// For longs this looks for bearish divergence at the highs; for shorts,
/// bullish divergence at the lows.
pub fn detect_macd_divergence(candles: &[Candle], side: Side) -> Option<Divergence> {
    if candles.len() < WINDOW + 26 {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let macd = calculate_macd_default(&closes)?;
    let hist = &macd.histogram_series;
    if hist.len() < WINDOW {
        return None;
    }

    let tail = &candles[candles.len() - WINDOW..];
    let hist_tail = &hist[hist.len() - WINDOW..];
    let (first, second) = tail.split_at(WINDOW / 2);
    let (hist_first, hist_second) = hist_tail.split_at(WINDOW / 2);

    match side {
        Side::Long => {
            let price_high_1 = first.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let price_high_2 = second.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let ind_1 = hist_first.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let ind_2 = hist_second.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            if price_high_2 > price_high_1 && ind_1 > 0.0 && ind_2 < MACD_SHRINK * ind_1 {
                let shrink = 1.0 - (ind_2 / ind_1).max(0.0);
                Some(Divergence {
                    strength: (50.0 + shrink * 500.0).min(100.0).round() as u8,
                })
            } else {
                None
            }
        }
        Side::Short => {
            let price_low_1 = first.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let price_low_2 = second.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let ind_1 = hist_first.iter().copied().fold(f64::INFINITY, f64::min);
            let ind_2 = hist_second.iter().copied().fold(f64::INFINITY, f64::min);

            // Bullish: lower price low while the histogram trough shallows.
            if price_low_2 < price_low_1 && ind_1 < 0.0 && ind_2 > MACD_SHRINK * ind_1 {
                let shrink = 1.0 - (ind_2 / ind_1).max(0.0);
                Some(Divergence {
                    strength: (50.0 + shrink * 500.0).min(100.0).round() as u8,
                })
            } else {
                None
            }
        }
    }
}

/// RSI divergence against a position of `side`, same half-window comparison.
pub fn detect_rsi_divergence(candles: &[Candle], side: Side) -> Option<Divergence> {
    if candles.len() < WINDOW + 15 {
        return None;
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi = calculate_rsi(&closes, 14);
    if rsi.len() < WINDOW {
        return None;
    }

    let tail = &candles[candles.len() - WINDOW..];
    let rsi_tail = &rsi[rsi.len() - WINDOW..];
    let (first, second) = tail.split_at(WINDOW / 2);
    let (rsi_first, rsi_second) = rsi_tail.split_at(WINDOW / 2);

    match side {
        Side::Long => {
            let price_high_1 = first.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let price_high_2 = second.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let rsi_1 = rsi_first.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let rsi_2 = rsi_second.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            if price_high_2 > price_high_1 && rsi_2 <= rsi_1 - RSI_POINTS {
                Some(Divergence {
                    strength: (50.0 + (rsi_1 - rsi_2) * 5.0).min(100.0).round() as u8,
                })
            } else {
                None
            }
        }
        Side::Short => {
            let price_low_1 = first.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let price_low_2 = second.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let rsi_1 = rsi_first.iter().copied().fold(f64::INFINITY, f64::min);
            let rsi_2 = rsi_second.iter().copied().fold(f64::INFINITY, f64::min);

            if price_low_2 < price_low_1 && rsi_2 >= rsi_1 + RSI_POINTS {
                Some(Divergence {
                    strength: (50.0 + (rsi_2 - rsi_1) * 5.0).min(100.0).round() as u8,
                })
            } else {
                None
            }
        }
    }
}
