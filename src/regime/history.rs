// =============================================================================
// Trend-score history — rolling per-symbol score triples
// =============================================================================
//
// The reversal monitor compares the current trend scores against this
// history. Each symbol keeps its last five (primary, confirm, filter)
// triples; a symbol that has not been updated for an hour is expired and
// starts fresh.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::regime::classifier::TrendScores;

/// Maximum retained triples per symbol.
const MAX_HISTORY: usize = 5;

/// A symbol's history expires after an hour without updates.
const EXPIRY: Duration = Duration::from_secs(3600);

struct SymbolHistory {
    scores: Vec<TrendScores>,
    updated_at: Instant,
}

/// Rolling per-symbol trend-score history. Owned by the classifier and shared
/// with the reversal monitor.
pub struct TrendScoreHistory {
    inner: RwLock<HashMap<String, SymbolHistory>>,
}

impl TrendScoreHistory {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Append a triple, evicting the oldest beyond the cap. Resets the
    /// expiry clock.
    pub fn push(&self, symbol: &str, scores: TrendScores) {
        let mut map = self.inner.write();
        let entry = map.entry(symbol.to_string()).or_insert_with(|| SymbolHistory {
            scores: Vec::with_capacity(MAX_HISTORY),
            updated_at: Instant::now(),
        });

        // A stale entry starts a fresh series rather than bridging an hour gap.
        if entry.updated_at.elapsed() > EXPIRY {
            entry.scores.clear();
        }

        entry.scores.push(scores);
        while entry.scores.len() > MAX_HISTORY {
            entry.scores.remove(0);
        }
        entry.updated_at = Instant::now();
    }

    /// The most recent triple, or `None` when absent/expired.
    pub fn latest(&self, symbol: &str) -> Option<TrendScores> {
        self.series(symbol).and_then(|s| s.last().copied())
    }

    /// The triple before the most recent one.
    pub fn previous(&self, symbol: &str) -> Option<TrendScores> {
        let series = self.series(symbol)?;
        if series.len() < 2 {
            return None;
        }
        series.get(series.len() - 2).copied()
    }

    /// Full retained series (oldest first), or `None` when absent/expired.
    pub fn series(&self, symbol: &str) -> Option<Vec<TrendScores>> {
        let map = self.inner.read();
        let entry = map.get(symbol)?;
        if entry.updated_at.elapsed() > EXPIRY {
            return None;
        }
        Some(entry.scores.clone())
    }

    /// Drop a symbol's history (e.g. after its position fully closes).
    pub fn clear(&self, symbol: &str) {
        self.inner.write().remove(symbol);
    }
}

impl Default for TrendScoreHistory {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn triple(p: f64) -> TrendScores {
        TrendScores {
            primary: p,
            confirm: p / 2.0,
            filter: p / 4.0,
        }
    }

    #[test]
    fn push_and_latest() {
        let h = TrendScoreHistory::new();
        assert!(h.latest("ETH").is_none());

        h.push("ETH", triple(10.0));
        h.push("ETH", triple(20.0));
        assert_eq!(h.latest("ETH").unwrap().primary, 20.0);
        assert_eq!(h.previous("ETH").unwrap().primary, 10.0);
    }

    #[test]
    fn capped_at_five() {
        let h = TrendScoreHistory::new();
        for i in 0..8 {
            h.push("ETH", triple(i as f64));
        }
        let series = h.series("ETH").unwrap();
        assert_eq!(series.len(), 5);
        // Oldest evicted: series starts at 3.
        assert_eq!(series[0].primary, 3.0);
        assert_eq!(series[4].primary, 7.0);
    }

    #[test]
    fn symbols_are_independent() {
        let h = TrendScoreHistory::new();
        h.push("ETH", triple(10.0));
        h.push("BTC", triple(-10.0));
        assert_eq!(h.latest("ETH").unwrap().primary, 10.0);
        assert_eq!(h.latest("BTC").unwrap().primary, -10.0);
    }

    #[test]
    fn clear_removes_symbol() {
        let h = TrendScoreHistory::new();
        h.push("ETH", triple(10.0));
        h.clear("ETH");
        assert!(h.latest("ETH").is_none());
    }

    #[test]
    fn previous_requires_two_entries() {
        let h = TrendScoreHistory::new();
        h.push("ETH", triple(1.0));
        assert!(h.previous("ETH").is_none());
    }
}
