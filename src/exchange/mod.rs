// =============================================================================
// Exchange adapter — uniform capability over the two margining variants
// =============================================================================
//
// One trait, two implementations:
//   - Linear  (UsdtFuturesAdapter):  USDT-margined, fractional quantities.
//   - Inverse (CoinFuturesAdapter):  coin-margined, integer contract counts
//     scaled by a per-contract quanto multiplier.
//
// Everything the core consumes is parsed into the typed structs below at this
// boundary; raw exchange payloads only escape through the explicitly untyped
// passthrough calls (`get_my_trades`, `get_order_book`, history queries).
// =============================================================================

pub mod cache;
pub mod http;
pub mod inverse;
pub mod linear;
pub mod protect;
pub mod rate_limit;
pub mod sizing;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::ExchangeResult;
use crate::market::{Candle, Interval};
use crate::types::{ExchangeKind, OrderStatus, PriceOrderKind, Side};

pub use inverse::CoinFuturesAdapter;
pub use linear::UsdtFuturesAdapter;

// =============================================================================
// Data types
// =============================================================================

/// 24 h ticker snapshot, optionally enriched with mark/index prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    /// 24 h change as a percentage.
    pub change_24h: f64,
}

/// Futures account summary in the margin currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub currency: String,
    pub total: f64,
    pub available: f64,
    pub position_margin: f64,
    pub order_margin: f64,
    pub unrealised_pnl: f64,
}

/// One exchange-side position as the exchange reports it.
/// `size` carries sign: positive = long, negative = short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub contract: String,
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: f64,
    pub leverage: f64,
    pub unrealised_pnl: f64,
}

impl PositionView {
    pub fn side(&self) -> Option<Side> {
        if self.size > 0.0 {
            Some(Side::Long)
        } else if self.size < 0.0 {
            Some(Side::Short)
        } else {
            None
        }
    }
}

/// Time-in-force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

impl TimeInForce {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
            Self::Ioc => "IOC",
        }
    }
}

/// An order to submit. `size` carries sign (positive = buy/long exposure).
/// `price = 0` submits a market order with IOC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub contract: String,
    pub size: f64,
    pub price: f64,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order closing `quantity` of a `side` position (reduce-only).
    pub fn market_close(contract: &str, side: Side, quantity: f64) -> Self {
        Self {
            contract: contract.to_string(),
            // Closing a long sells; closing a short buys.
            size: -side.sign() * quantity,
            price: 0.0,
            time_in_force: Some(TimeInForce::Ioc),
            reduce_only: true,
            client_order_id: Some(format!("mrd-close-{}", uuid::Uuid::new_v4().simple())),
        }
    }

    /// Market order opening `quantity` on `side`.
    pub fn market_open(contract: &str, side: Side, quantity: f64) -> Self {
        Self {
            contract: contract.to_string(),
            size: side.sign() * quantity,
            price: 0.0,
            time_in_force: Some(TimeInForce::Ioc),
            reduce_only: false,
            client_order_id: Some(format!("mrd-open-{}", uuid::Uuid::new_v4().simple())),
        }
    }
}

/// A validated order response. Parsed once; downstream never touches strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub contract: String,
    pub status: OrderStatus,
    /// Requested size, signed.
    pub size: f64,
    /// Filled size, signed.
    pub filled_size: f64,
    pub price: f64,
    pub avg_fill_price: Option<f64>,
    pub reduce_only: bool,
}

/// Static contract metadata, cached for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractInfo {
    pub contract: String,
    pub symbol: String,
    pub kind: ExchangeKind,
    /// 1.0 on linear contracts.
    pub quanto_multiplier: f64,
    pub tick_size: f64,
    pub min_order_size: f64,
    pub max_order_size: f64,
    pub price_decimals: u32,
    pub min_leverage: f64,
    pub max_leverage: f64,
}

/// A currently active protective order on the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrderView {
    pub order_id: String,
    pub kind: PriceOrderKind,
    pub trigger_price: f64,
    pub quantity: f64,
}

/// Outcome of `set_position_stop_loss`. Partial protection is reported
/// honestly: a surviving stop leg with a failed TP leg yields
/// `ok = true, tp_order_id = None` and a message saying TP is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossOutcome {
    pub ok: bool,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub message: String,
}

// =============================================================================
// The adapter capability
// =============================================================================

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// `ETH` → exchange contract name. Must round-trip with
    /// [`extract_symbol`].
    fn normalize_symbol(&self, symbol: &str) -> String;

    /// Exchange contract name → user symbol.
    fn extract_symbol(&self, contract: &str) -> String;

    /// Ticker snapshot, cached ~2 s keyed by `(contract, include_mark_price)`.
    async fn ticker(&self, contract: &str, include_mark_price: bool) -> ExchangeResult<Ticker>;

    /// Candles oldest-first.
    async fn candles(&self, contract: &str, interval: Interval, limit: u32)
        -> ExchangeResult<Vec<Candle>>;

    async fn account(&self) -> ExchangeResult<AccountSummary>;

    /// Open positions filtered to the given watch-listed contracts.
    async fn positions(&self, watch_contracts: &[String]) -> ExchangeResult<Vec<PositionView>>;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse>;

    /// May silently no-op when a position already exists.
    async fn set_leverage(&self, contract: &str, leverage: f64) -> ExchangeResult<()>;

    /// Latest funding rate, cached one hour.
    async fn funding_rate(&self, contract: &str) -> ExchangeResult<f64>;

    /// Contract metadata, cached for the process lifetime.
    async fn contract_info(&self, contract: &str) -> ExchangeResult<ContractInfo>;

    async fn get_order(&self, contract: &str, order_id: &str) -> ExchangeResult<OrderResponse>;

    async fn cancel_order(&self, contract: &str, order_id: &str) -> ExchangeResult<()>;

    async fn get_open_orders(&self, contract: Option<&str>) -> ExchangeResult<Vec<OrderResponse>>;

    // Untyped passthroughs — consumed by the agent tools, never by the core.
    async fn get_my_trades(&self, contract: &str, limit: u32) -> ExchangeResult<serde_json::Value>;
    async fn get_order_book(&self, contract: &str, depth: u32) -> ExchangeResult<serde_json::Value>;
    async fn get_position_history(&self, limit: u32) -> ExchangeResult<serde_json::Value>;
    async fn get_settlement_history(&self, limit: u32) -> ExchangeResult<serde_json::Value>;
    async fn get_order_history(&self, contract: Option<&str>, limit: u32)
        -> ExchangeResult<serde_json::Value>;

    /// Replace the position's protective stop / take-profit orders.
    /// Cancels existing protective orders first; validates directions per
    /// [`protect::build_protection_plan`]; never leaves partial protection
    /// unreported.
    async fn set_position_stop_loss(
        &self,
        contract: &str,
        stop: Option<f64>,
        take_profit: Option<f64>,
    ) -> ExchangeResult<StopLossOutcome>;

    /// Cancel every known protective order for the contract. Returns how
    /// many were cancelled; `NotFound` during cancellation counts as gone.
    async fn cancel_position_stop_loss(&self, contract: &str) -> ExchangeResult<u32>;

    /// Currently active protective orders for the contract.
    async fn get_position_stop_orders(&self, contract: &str)
        -> ExchangeResult<Vec<StopOrderView>>;

    // ── Variant math (pure; delegated to `sizing`) ───────────────────────

    /// Unit-normalised quantity purchasable with `margin` at `leverage`.
    fn quantity_from_usdt(&self, info: &ContractInfo, margin: f64, price: f64, leverage: f64)
        -> f64;

    /// Signed PnL for a `quantity` (always positive) and `side`.
    fn pnl(&self, info: &ContractInfo, entry: f64, exit: f64, quantity: f64, side: Side) -> f64;

    /// The one sanctioned price formatter. No caller formats by hand.
    fn format_price(&self, info: &ContractInfo, price: f64) -> String {
        sizing::format_price(price, info.tick_size, info.price_decimals)
    }
}

/// Resolve the adapter variant from configuration at process start.
pub fn build_adapter(settings: &Settings) -> Arc<dyn ExchangeAdapter> {
    match settings.exchange {
        ExchangeKind::Linear => Arc::new(UsdtFuturesAdapter::new(
            &settings.api_key,
            &settings.api_secret,
            settings.use_testnet,
        )),
        ExchangeKind::Inverse => Arc::new(CoinFuturesAdapter::new(
            &settings.api_key,
            &settings.api_secret,
            settings.use_testnet,
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_close_flips_side_sign() {
        let req = OrderRequest::market_close("ETHUSDT", Side::Long, 2.0);
        assert_eq!(req.size, -2.0);
        assert!(req.reduce_only);
        assert_eq!(req.price, 0.0);
        assert_eq!(req.time_in_force, Some(TimeInForce::Ioc));

        let req = OrderRequest::market_close("ETHUSDT", Side::Short, 2.0);
        assert_eq!(req.size, 2.0);
    }

    #[test]
    fn market_open_uses_side_sign() {
        let req = OrderRequest::market_open("ETHUSDT", Side::Short, 3.0);
        assert_eq!(req.size, -3.0);
        assert!(!req.reduce_only);
    }

    #[test]
    fn position_view_side() {
        let mut pv = PositionView {
            contract: "ETHUSDT".into(),
            symbol: "ETH".into(),
            size: 1.5,
            entry_price: 3000.0,
            mark_price: 3010.0,
            liquidation_price: 2500.0,
            leverage: 8.0,
            unrealised_pnl: 15.0,
        };
        assert_eq!(pv.side(), Some(Side::Long));
        pv.size = -1.5;
        assert_eq!(pv.side(), Some(Side::Short));
        pv.size = 0.0;
        assert_eq!(pv.side(), None);
    }
}
