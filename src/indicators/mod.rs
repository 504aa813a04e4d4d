// =============================================================================
// Indicator pipeline — one timeframe's full indicator snapshot
// =============================================================================
//
// Every numeric field is finite or explicitly defaulted: EMAs default to 0,
// RSI to 50, ATR to 0, and ratio-style fields to 1 when their divisor is
// zero. Candle sequences are oldest-first throughout.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod levels;
pub mod macd;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::market::Candle;

/// Trailing window used for extremes, averages and price change.
const TRAILING_WINDOW: usize = 20;

/// Full indicator snapshot for one `(symbol, interval)` candle sequence.
/// Derived per tick, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeIndicators {
    pub close: f64,
    pub ema20: f64,
    pub ema50: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    /// +1 upward histogram pivot from below zero, -1 mirrored, 0 otherwise.
    pub macd_turn: i8,
    pub rsi7: f64,
    pub rsi14: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub bb_bandwidth: f64,
    pub atr: f64,
    /// Current ATR relative to its recent mean; 1.0 = typical volatility.
    pub atr_ratio: f64,
    pub volume: f64,
    pub avg_volume: f64,
    pub volume_ratio: f64,
    /// Percent change over the trailing 20 closes.
    pub price_change_20: f64,
    /// Percent deviation of the close from EMA20 / EMA50.
    pub deviation_from_ema20: f64,
    pub deviation_from_ema50: f64,
    pub recent_high: f64,
    pub recent_low: f64,
    pub resistance_levels: Vec<f64>,
    pub support_levels: Vec<f64>,
    /// How many candles fed this snapshot.
    pub candle_count: usize,
}

impl TimeframeIndicators {
    /// Neutral snapshot used when no candles are available.
    pub fn empty() -> Self {
        Self {
            close: 0.0,
            ema20: 0.0,
            ema50: 0.0,
            macd: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            macd_turn: 0,
            rsi7: 50.0,
            rsi14: 50.0,
            bb_upper: 0.0,
            bb_middle: 0.0,
            bb_lower: 0.0,
            bb_bandwidth: 0.0,
            atr: 0.0,
            atr_ratio: 1.0,
            volume: 0.0,
            avg_volume: 0.0,
            volume_ratio: 1.0,
            price_change_20: 0.0,
            deviation_from_ema20: 0.0,
            deviation_from_ema50: 0.0,
            recent_high: 0.0,
            recent_low: 0.0,
            resistance_levels: Vec::new(),
            support_levels: Vec::new(),
            candle_count: 0,
        }
    }

    /// Compute the full snapshot from a candle sequence (oldest first).
    /// Zero candles return the neutral defaults without panicking.
    pub fn compute(candles: &[Candle]) -> Self {
        let Some(last) = candles.last() else {
            return Self::empty();
        };

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let close = last.close;

        let ema20 = ema::latest_ema(&closes, 20);
        let ema50 = ema::latest_ema(&closes, 50);

        let (macd_val, macd_signal, macd_histogram, macd_turn) =
            match macd::calculate_macd_default(&closes) {
                Some(m) => {
                    let turn = macd::macd_turn(&m.histogram_series);
                    (m.macd, m.signal, m.histogram, turn)
                }
                None => (0.0, 0.0, 0.0, 0),
            };

        let rsi7 = rsi::latest_rsi(&closes, 7);
        let rsi14 = rsi::latest_rsi(&closes, 14);

        let (bb_upper, bb_middle, bb_lower, bb_bandwidth) =
            match bollinger::calculate_bollinger_default(&closes) {
                Some(bb) => (bb.upper, bb.middle, bb.lower, bb.bandwidth),
                None => (0.0, 0.0, 0.0, 0.0),
            };

        let atr_value = atr::calculate_atr(candles, 14).unwrap_or(0.0);
        let atr_ratio = atr::calculate_atr_ratio(candles, 14);

        let volume = last.volume;
        let window = candles.len().min(TRAILING_WINDOW);
        let avg_volume: f64 = candles[candles.len() - window..]
            .iter()
            .map(|c| c.volume)
            .sum::<f64>()
            / window as f64;
        let volume_ratio = if avg_volume > 0.0 { volume / avg_volume } else { 1.0 };

        let price_change_20 = if candles.len() > TRAILING_WINDOW {
            let past = candles[candles.len() - 1 - TRAILING_WINDOW].close;
            if past != 0.0 {
                (close - past) / past * 100.0
            } else {
                0.0
            }
        } else {
            0.0
        };

        let deviation_from_ema20 = if ema20 != 0.0 { (close - ema20) / ema20 * 100.0 } else { 0.0 };
        let deviation_from_ema50 = if ema50 != 0.0 { (close - ema50) / ema50 * 100.0 } else { 0.0 };

        let snapshot = Self {
            close,
            ema20,
            ema50,
            macd: macd_val,
            macd_signal,
            macd_histogram,
            macd_turn,
            rsi7,
            rsi14,
            bb_upper,
            bb_middle,
            bb_lower,
            bb_bandwidth,
            atr: atr_value,
            atr_ratio,
            volume,
            avg_volume,
            volume_ratio,
            price_change_20,
            deviation_from_ema20,
            deviation_from_ema50,
            recent_high: levels::recent_high(candles, TRAILING_WINDOW),
            recent_low: levels::recent_low(candles, TRAILING_WINDOW),
            resistance_levels: levels::resistance_levels(candles, TRAILING_WINDOW),
            support_levels: levels::support_levels(candles, TRAILING_WINDOW),
            candle_count: candles.len(),
        };

        snapshot.sanitised()
    }

    /// Replace any non-finite field with its documented default.
    fn sanitised(mut self) -> Self {
        fn fin(v: f64, default: f64) -> f64 {
            if v.is_finite() { v } else { default }
        }
        self.close = fin(self.close, 0.0);
        self.ema20 = fin(self.ema20, 0.0);
        self.ema50 = fin(self.ema50, 0.0);
        self.macd = fin(self.macd, 0.0);
        self.macd_signal = fin(self.macd_signal, 0.0);
        self.macd_histogram = fin(self.macd_histogram, 0.0);
        self.rsi7 = fin(self.rsi7, 50.0).clamp(0.0, 100.0);
        self.rsi14 = fin(self.rsi14, 50.0).clamp(0.0, 100.0);
        self.bb_upper = fin(self.bb_upper, 0.0);
        self.bb_middle = fin(self.bb_middle, 0.0);
        self.bb_lower = fin(self.bb_lower, 0.0);
        self.bb_bandwidth = fin(self.bb_bandwidth, 0.0);
        self.atr = fin(self.atr, 0.0);
        self.atr_ratio = fin(self.atr_ratio, 1.0);
        self.volume = fin(self.volume, 0.0);
        self.avg_volume = fin(self.avg_volume, 0.0);
        self.volume_ratio = fin(self.volume_ratio, 1.0);
        self.price_change_20 = fin(self.price_change_20, 0.0);
        self.deviation_from_ema20 = fin(self.deviation_from_ema20, 0.0);
        self.deviation_from_ema50 = fin(self.deviation_from_ema50, 0.0);
        self.recent_high = fin(self.recent_high, 0.0);
        self.recent_low = fin(self.recent_low, 0.0);
        self.resistance_levels.retain(|v| v.is_finite());
        self.support_levels.retain(|v| v.is_finite());
        self
    }
}
