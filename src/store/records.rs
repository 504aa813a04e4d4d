// =============================================================================
// Persisted record shapes — rows as the engine sees them
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PriceOrderKind, Side, StrategyKind};

/// An open position as persisted. Unique on `(symbol, side)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub entry_price: f64,
    /// Always positive; direction comes from `side`.
    pub quantity: f64,
    pub leverage: f64,
    pub current_price: f64,
    pub liquidation_price: f64,
    pub unrealised_pnl: f64,
    pub realised_pnl: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_order_id: String,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub market_state: String,
    pub strategy_type: StrategyKind,
    pub signal_strength: f64,
    pub opportunity_score: f64,
    /// Snapshot of the stop at entry; the basis of every R-multiple.
    pub entry_stop_loss: f64,
    pub metadata: serde_json::Value,
}

impl PositionRecord {
    /// The initial risk per unit, `R = |entry - entry_stop_loss|`.
    pub fn r_unit(&self) -> f64 {
        (self.entry_price - self.entry_stop_loss).abs()
    }

    /// Hours this position has been open as of `now`.
    pub fn holding_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_seconds() as f64 / 3600.0
    }

    /// The price at which stage `r_multiple` triggers.
    pub fn r_target(&self, r_multiple: f64) -> f64 {
        self.entry_price + self.side.sign() * r_multiple * self.r_unit()
    }
}

/// Status of a protective price-order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceOrderStatus {
    Active,
    Triggered,
    Cancelled,
}

impl PriceOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Triggered => "triggered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "triggered" => Some(Self::Triggered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A protective stop/take-profit order row. Unique on `order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceOrderRecord {
    pub order_id: String,
    /// The entry order id of the position this order protects.
    pub position_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: PriceOrderKind,
    pub trigger_price: f64,
    /// 0 = market-on-trigger.
    pub order_price: f64,
    pub quantity: f64,
    pub status: PriceOrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a trade opened or closed exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeKind {
    Open,
    Close,
}

impl TradeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            _ => None,
        }
    }
}

/// One executed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: TradeKind,
    pub price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub fee: f64,
    pub pnl: Option<f64>,
    pub r_multiple: Option<f64>,
    pub strategy_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

/// Append-only close event. `processed = false` until the reasoning layer
/// has consumed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseEvent {
    /// Database id; 0 before insertion.
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub close_reason: String,
    pub trigger_type: String,
    pub close_price: f64,
    pub entry_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub fee: f64,
    pub position_order_id: String,
    pub trigger_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

/// One executed staged take-profit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTpRecord {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub stage: u8,
    pub trigger_price: f64,
    pub closed_quantity: f64,
    pub pnl: f64,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Account state at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshotRow {
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
    pub available_cash: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub return_percent: f64,
}

/// Equity-curve point derived from account snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub drawdown_value: f64,
    pub is_new_peak: bool,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn position() -> PositionRecord {
        PositionRecord {
            id: "p1".into(),
            symbol: "ETH".into(),
            exchange: "linear".into(),
            side: Side::Long,
            entry_price: 3000.0,
            quantity: 2.0,
            leverage: 8.0,
            current_price: 3000.0,
            liquidation_price: 2600.0,
            unrealised_pnl: 0.0,
            realised_pnl: 0.0,
            stop_loss: 2952.0,
            take_profit: 3240.0,
            entry_order_id: "o1".into(),
            sl_order_id: None,
            tp_order_id: None,
            opened_at: Utc::now(),
            market_state: "uptrend_continuation".into(),
            strategy_type: StrategyKind::TrendFollowing,
            signal_strength: 0.7,
            opportunity_score: 72.0,
            entry_stop_loss: 2952.0,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn r_unit_and_targets() {
        let p = position();
        assert!((p.r_unit() - 48.0).abs() < 1e-9);
        assert!((p.r_target(1.0) - 3048.0).abs() < 1e-9);
        assert!((p.r_target(3.0) - 3144.0).abs() < 1e-9);

        let mut short = position();
        short.side = Side::Short;
        short.entry_stop_loss = 3048.0;
        assert!((short.r_target(1.0) - 2952.0).abs() < 1e-9);
    }

    #[test]
    fn status_string_round_trips() {
        for s in [PriceOrderStatus::Active, PriceOrderStatus::Triggered, PriceOrderStatus::Cancelled] {
            assert_eq!(PriceOrderStatus::parse(s.as_str()), Some(s));
        }
        for k in [TradeKind::Open, TradeKind::Close] {
            assert_eq!(TradeKind::parse(k.as_str()), Some(k));
        }
    }
}
