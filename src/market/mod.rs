// =============================================================================
// Market primitives — candles and intervals
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV candle. Sequences are always ordered oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds (UTC).
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// All price fields finite and non-negative, high >= low.
    pub fn is_sane(&self) -> bool {
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        fields.iter().all(|v| v.is_finite() && *v >= 0.0) && self.high >= self.low
    }
}

/// Supported candle intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    /// The wire representation used by the exchange REST APIs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    pub fn seconds(self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M3 => 180,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "3m" => Ok(Self::M3),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(format!("unsupported interval '{other}'")),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_roundtrip() {
        for s in ["1m", "3m", "5m", "15m", "30m", "1h", "4h", "1d"] {
            let iv: Interval = s.parse().unwrap();
            assert_eq!(iv.as_str(), s);
        }
        assert!("2h".parse::<Interval>().is_err());
    }

    #[test]
    fn interval_seconds_ordering() {
        assert!(Interval::M1.seconds() < Interval::M5.seconds());
        assert!(Interval::H4.seconds() < Interval::D1.seconds());
    }

    #[test]
    fn candle_sanity() {
        let good = Candle::new(0, 100.0, 105.0, 95.0, 101.0, 10.0);
        assert!(good.is_sane());

        let inverted = Candle::new(0, 100.0, 95.0, 105.0, 101.0, 10.0);
        assert!(!inverted.is_sane());

        let nan = Candle::new(0, 100.0, f64::NAN, 95.0, 101.0, 10.0);
        assert!(!nan.is_sane());
    }
}
