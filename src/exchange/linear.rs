// =============================================================================
// Linear adapter — USDT-margined futures (fapi dialect)
// =============================================================================
//
// Fractional base-unit quantities; PnL in the quote currency. Mark price is a
// separate premium-index request, so `include_mark_price=false` genuinely
// saves a round-trip here.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::cache::TtlCache;
use crate::exchange::http::{parse_str_f64, parse_str_f64_or, Method, RetryPolicy, SignedHttpClient};
use crate::exchange::protect::{build_protection_plan, TriggerLeg};
use crate::exchange::sizing;
use crate::exchange::{
    AccountSummary, ContractInfo, ExchangeAdapter, OrderRequest, OrderResponse, PositionView,
    StopLossOutcome, StopOrderView, Ticker, TimeInForce,
};
use crate::market::{Candle, Interval};
use crate::types::{ExchangeKind, OrderStatus, PriceOrderKind, Side};

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Ticker cache TTL.
const TICKER_TTL: Duration = Duration::from_secs(2);
/// Funding-rate cache TTL.
const FUNDING_TTL: Duration = Duration::from_secs(3600);

/// Market-order quantity accepted by the API regardless of the contract max.
const API_ORDER_QTY_CAP: f64 = 1000.0;

/// Acceptance band for limit prices around the mark, percent.
const PRICE_BAND_PCT: f64 = 1.5;

/// USDT-margined futures adapter.
pub struct UsdtFuturesAdapter {
    http: SignedHttpClient,
    ticker_cache: TtlCache<(String, bool), Ticker>,
    funding_cache: TtlCache<String, f64>,
    contract_cache: TtlCache<String, ContractInfo>,
}

impl UsdtFuturesAdapter {
    pub fn new(api_key: &str, api_secret: &str, use_testnet: bool) -> Self {
        let base = if use_testnet { TESTNET_URL } else { MAINNET_URL };
        debug!(base_url = base, "UsdtFuturesAdapter initialised");
        Self {
            http: SignedHttpClient::new(api_key, api_secret, base, "/fapi/v1/time"),
            ticker_cache: TtlCache::new(Some(TICKER_TTL)),
            funding_cache: TtlCache::new(Some(FUNDING_TTL)),
            contract_cache: TtlCache::new(None),
        }
    }

    /// Premium-index request: mark price, index price, last funding rate.
    async fn premium_index(&self, contract: &str) -> ExchangeResult<(f64, f64, f64)> {
        let body = self
            .http
            .send(
                Method::Get,
                "/fapi/v1/premiumIndex",
                &format!("symbol={contract}"),
                false,
                RetryPolicy::standard(),
            )
            .await?;
        let mark = parse_str_f64(&body["markPrice"])?;
        let index = parse_str_f64_or(&body["indexPrice"], mark);
        let funding = parse_str_f64_or(&body["lastFundingRate"], 0.0);
        Ok((mark, index, funding))
    }

    /// Find the open exchange position for one contract, if any.
    async fn position_for(&self, contract: &str) -> ExchangeResult<Option<PositionView>> {
        let found = self
            .positions(&[contract.to_string()])
            .await?
            .into_iter()
            .next();
        Ok(found)
    }

    /// Submit one protective conditional leg as a trigger-typed market order.
    async fn submit_trigger_leg(
        &self,
        contract: &str,
        position_side: Side,
        leg: &TriggerLeg,
        info: &ContractInfo,
    ) -> ExchangeResult<OrderResponse> {
        let order_type = match leg.kind {
            PriceOrderKind::StopLoss => "STOP_MARKET",
            PriceOrderKind::TakeProfit => "TAKE_PROFIT_MARKET",
        };
        // The trigger closes the position, so it trades against it.
        let close_side = match position_side {
            Side::Long => "SELL",
            Side::Short => "BUY",
        };
        let qty = sizing::floor_to_step(leg.quantity, info.min_order_size);
        let stop_price = self.format_price(info, leg.trigger_price);

        let params = format!(
            "symbol={contract}&side={close_side}&type={order_type}&stopPrice={stop_price}\
             &quantity={qty}&reduceOnly=true&workingType=MARK_PRICE"
        );

        self.http.rate.record_order_sent();
        let body = self
            .http
            .send(Method::Post, "/fapi/v1/order", &params, true, RetryPolicy::protective())
            .await?;
        parse_order(&body, contract)
    }
}

/// Parse a futures order payload into the validated response type.
fn parse_order(body: &serde_json::Value, contract: &str) -> ExchangeResult<OrderResponse> {
    let order_id = body["orderId"]
        .as_u64()
        .map(|v| v.to_string())
        .or_else(|| body["orderId"].as_str().map(String::from))
        .ok_or_else(|| ExchangeError::Malformed(format!("{contract}: order response missing orderId")))?;

    let status = body["status"]
        .as_str()
        .map(OrderStatus::from_exchange)
        .unwrap_or(OrderStatus::Open);

    let sign = match body["side"].as_str() {
        Some("SELL") => -1.0,
        _ => 1.0,
    };

    let avg = parse_str_f64_or(&body["avgPrice"], 0.0);

    Ok(OrderResponse {
        order_id,
        client_order_id: body["clientOrderId"].as_str().map(String::from),
        contract: body["symbol"].as_str().unwrap_or(contract).to_string(),
        status,
        size: sign * parse_str_f64_or(&body["origQty"], 0.0),
        filled_size: sign * parse_str_f64_or(&body["executedQty"], 0.0),
        price: parse_str_f64_or(&body["price"], 0.0),
        avg_fill_price: if avg > 0.0 { Some(avg) } else { None },
        reduce_only: body["reduceOnly"].as_bool().unwrap_or(false),
    })
}

#[async_trait]
impl ExchangeAdapter for UsdtFuturesAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Linear
    }

    fn normalize_symbol(&self, symbol: &str) -> String {
        let s = symbol.trim().to_uppercase();
        if s.ends_with("USDT") {
            s
        } else {
            format!("{s}USDT")
        }
    }

    fn extract_symbol(&self, contract: &str) -> String {
        contract
            .trim()
            .to_uppercase()
            .trim_end_matches("USDT")
            .to_string()
    }

    #[instrument(skip(self), name = "linear::ticker")]
    async fn ticker(&self, contract: &str, include_mark_price: bool) -> ExchangeResult<Ticker> {
        let key = (contract.to_string(), include_mark_price);
        if let Some(cached) = self.ticker_cache.get(&key) {
            return Ok(cached);
        }

        let body = self
            .http
            .send(
                Method::Get,
                "/fapi/v1/ticker/24hr",
                &format!("symbol={contract}"),
                false,
                RetryPolicy::standard(),
            )
            .await?;

        let mut ticker = Ticker {
            last: parse_str_f64(&body["lastPrice"])?,
            mark_price: None,
            index_price: None,
            volume_24h: parse_str_f64_or(&body["volume"], 0.0),
            high_24h: parse_str_f64_or(&body["highPrice"], 0.0),
            low_24h: parse_str_f64_or(&body["lowPrice"], 0.0),
            change_24h: parse_str_f64_or(&body["priceChangePercent"], 0.0),
        };

        // Mark price costs a second request on this dialect, so only fetch
        // it when the caller asked.
        if include_mark_price {
            let (mark, index, _) = self.premium_index(contract).await?;
            ticker.mark_price = Some(mark);
            ticker.index_price = Some(index);
        }

        self.ticker_cache.insert(key, ticker.clone());
        Ok(ticker)
    }

    #[instrument(skip(self), name = "linear::candles")]
    async fn candles(
        &self,
        contract: &str,
        interval: Interval,
        limit: u32,
    ) -> ExchangeResult<Vec<Candle>> {
        let body = self
            .http
            .send(
                Method::Get,
                "/fapi/v1/klines",
                &format!("symbol={contract}&interval={}&limit={limit}", interval.as_str()),
                false,
                RetryPolicy::standard(),
            )
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| ExchangeError::Malformed("kline entry is not an array".into()))?;
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                parse_str_f64(&arr[1])?,
                parse_str_f64(&arr[2])?,
                parse_str_f64(&arr[3])?,
                parse_str_f64(&arr[4])?,
                parse_str_f64(&arr[5])?,
            ));
        }

        debug!(contract, interval = %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "linear::account")]
    async fn account(&self) -> ExchangeResult<AccountSummary> {
        let body = self
            .http
            .send(Method::Get, "/fapi/v2/account", "", true, RetryPolicy::standard())
            .await?;

        Ok(AccountSummary {
            currency: "USDT".to_string(),
            total: parse_str_f64_or(&body["totalWalletBalance"], 0.0),
            available: parse_str_f64_or(&body["availableBalance"], 0.0),
            position_margin: parse_str_f64_or(&body["totalPositionInitialMargin"], 0.0),
            order_margin: parse_str_f64_or(&body["totalOpenOrderInitialMargin"], 0.0),
            unrealised_pnl: parse_str_f64_or(&body["totalUnrealizedProfit"], 0.0),
        })
    }

    #[instrument(skip(self, watch_contracts), name = "linear::positions")]
    async fn positions(&self, watch_contracts: &[String]) -> ExchangeResult<Vec<PositionView>> {
        let body = self
            .http
            .send(Method::Get, "/fapi/v2/positionRisk", "", true, RetryPolicy::standard())
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("positionRisk response is not an array".into()))?;

        let mut views = Vec::new();
        for p in raw {
            let contract = p["symbol"].as_str().unwrap_or_default().to_string();
            if !watch_contracts.iter().any(|c| c == &contract) {
                continue;
            }
            let size = parse_str_f64_or(&p["positionAmt"], 0.0);
            if size == 0.0 {
                continue;
            }
            views.push(PositionView {
                symbol: self.extract_symbol(&contract),
                contract,
                size,
                entry_price: parse_str_f64_or(&p["entryPrice"], 0.0),
                mark_price: parse_str_f64_or(&p["markPrice"], 0.0),
                liquidation_price: parse_str_f64_or(&p["liquidationPrice"], 0.0),
                leverage: parse_str_f64_or(&p["leverage"], 1.0),
                unrealised_pnl: parse_str_f64_or(&p["unRealizedProfit"], 0.0),
            });
        }
        Ok(views)
    }

    #[instrument(skip(self, request), name = "linear::place_order", fields(contract = %request.contract))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderResponse> {
        let info = self.contract_info(&request.contract).await?;

        let side = if request.size >= 0.0 { "BUY" } else { "SELL" };
        let qty = sizing::floor_to_step(request.size.abs(), info.min_order_size);
        let qty = sizing::clamp_order_size(
            qty,
            info.min_order_size,
            info.max_order_size,
            API_ORDER_QTY_CAP,
        )
        .ok_or_else(|| {
            ExchangeError::InvalidArgument(format!(
                "{}: quantity {} below contract minimum {}",
                request.contract,
                request.size.abs(),
                info.min_order_size
            ))
        })?;

        let mut params = format!("symbol={}&side={side}&quantity={qty}", request.contract);

        if request.price == 0.0 {
            // Market order, IOC by the exchange's execution model.
            params.push_str("&type=MARKET");
        } else {
            let mark = self
                .ticker(&request.contract, true)
                .await
                .ok()
                .and_then(|t| t.mark_price);
            let clamped = sizing::clamp_price_to_mark(request.price, mark, PRICE_BAND_PCT);
            let price = self.format_price(&info, clamped);
            let tif = request.time_in_force.unwrap_or(TimeInForce::Gtc);
            params.push_str(&format!("&type=LIMIT&price={price}&timeInForce={}", tif.as_str()));
        }

        if request.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if let Some(coid) = &request.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        info!(
            contract = %request.contract,
            side,
            qty,
            price = request.price,
            reduce_only = request.reduce_only,
            "placing order"
        );

        self.http.rate.record_order_sent();
        let body = self
            .http
            .send(Method::Post, "/fapi/v1/order", &params, true, RetryPolicy::standard())
            .await?;
        parse_order(&body, &request.contract)
    }

    #[instrument(skip(self), name = "linear::set_leverage")]
    async fn set_leverage(&self, contract: &str, leverage: f64) -> ExchangeResult<()> {
        let lev = leverage.max(1.0).round() as u32;
        let result = self
            .http
            .send(
                Method::Post,
                "/fapi/v1/leverage",
                &format!("symbol={contract}&leverage={lev}"),
                true,
                RetryPolicy::standard(),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Leverage changes are refused while a position exists; that is
            // an acceptable no-op, not a failure.
            Err(ExchangeError::InvalidArgument(msg)) => {
                debug!(contract, leverage = lev, msg = %msg, "set_leverage no-op");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "linear::funding_rate")]
    async fn funding_rate(&self, contract: &str) -> ExchangeResult<f64> {
        let key = contract.to_string();
        if let Some(rate) = self.funding_cache.get(&key) {
            return Ok(rate);
        }
        let (_, _, funding) = self.premium_index(contract).await?;
        self.funding_cache.insert(key, funding);
        Ok(funding)
    }

    #[instrument(skip(self), name = "linear::contract_info")]
    async fn contract_info(&self, contract: &str) -> ExchangeResult<ContractInfo> {
        let key = contract.to_string();
        if let Some(info) = self.contract_cache.get(&key) {
            return Ok(info);
        }

        let body = self
            .http
            .send(
                Method::Get,
                "/fapi/v1/exchangeInfo",
                &format!("symbol={contract}"),
                false,
                RetryPolicy::standard(),
            )
            .await?;

        let sym = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(contract)))
            .ok_or_else(|| ExchangeError::NotFound(format!("contract {contract} not in exchangeInfo")))?;

        let mut tick_size = 0.01;
        let mut min_qty = 0.001;
        let mut max_qty = 10_000.0;
        if let Some(filters) = sym["filters"].as_array() {
            for f in filters {
                match f["filterType"].as_str() {
                    Some("PRICE_FILTER") => {
                        tick_size = parse_str_f64_or(&f["tickSize"], tick_size);
                    }
                    Some("LOT_SIZE") => {
                        min_qty = parse_str_f64_or(&f["minQty"], min_qty);
                        max_qty = parse_str_f64_or(&f["maxQty"], max_qty);
                    }
                    _ => {}
                }
            }
        }

        let info = ContractInfo {
            contract: contract.to_string(),
            symbol: self.extract_symbol(contract),
            kind: ExchangeKind::Linear,
            quanto_multiplier: 1.0,
            tick_size,
            min_order_size: min_qty,
            max_order_size: max_qty,
            price_decimals: sym["pricePrecision"].as_u64().unwrap_or(2) as u32,
            min_leverage: 1.0,
            max_leverage: 125.0,
        };

        self.contract_cache.insert(key, info.clone());
        Ok(info)
    }

    async fn get_order(&self, contract: &str, order_id: &str) -> ExchangeResult<OrderResponse> {
        let body = self
            .http
            .send(
                Method::Get,
                "/fapi/v1/order",
                &format!("symbol={contract}&orderId={order_id}"),
                true,
                RetryPolicy::standard(),
            )
            .await?;
        parse_order(&body, contract)
    }

    async fn cancel_order(&self, contract: &str, order_id: &str) -> ExchangeResult<()> {
        let result = self
            .http
            .send(
                Method::Delete,
                "/fapi/v1/order",
                &format!("symbol={contract}&orderId={order_id}"),
                true,
                RetryPolicy::standard(),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // Already gone is success for a cancel.
            Err(ExchangeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_open_orders(&self, contract: Option<&str>) -> ExchangeResult<Vec<OrderResponse>> {
        let params = match contract {
            Some(c) => format!("symbol={c}"),
            None => String::new(),
        };
        let body = self
            .http
            .send(Method::Get, "/fapi/v1/openOrders", &params, true, RetryPolicy::standard())
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("openOrders response is not an array".into()))?;

        raw.iter()
            .map(|o| parse_order(o, contract.unwrap_or_default()))
            .collect()
    }

    async fn get_my_trades(&self, contract: &str, limit: u32) -> ExchangeResult<serde_json::Value> {
        self.http
            .send(
                Method::Get,
                "/fapi/v1/userTrades",
                &format!("symbol={contract}&limit={limit}"),
                true,
                RetryPolicy::standard(),
            )
            .await
    }

    async fn get_order_book(&self, contract: &str, depth: u32) -> ExchangeResult<serde_json::Value> {
        self.http
            .send(
                Method::Get,
                "/fapi/v1/depth",
                &format!("symbol={contract}&limit={depth}"),
                false,
                RetryPolicy::standard(),
            )
            .await
    }

    async fn get_position_history(&self, limit: u32) -> ExchangeResult<serde_json::Value> {
        self.http
            .send(
                Method::Get,
                "/fapi/v1/income",
                &format!("incomeType=REALIZED_PNL&limit={limit}"),
                true,
                RetryPolicy::standard(),
            )
            .await
    }

    async fn get_settlement_history(&self, limit: u32) -> ExchangeResult<serde_json::Value> {
        self.http
            .send(
                Method::Get,
                "/fapi/v1/income",
                &format!("incomeType=FUNDING_FEE&limit={limit}"),
                true,
                RetryPolicy::standard(),
            )
            .await
    }

    async fn get_order_history(
        &self,
        contract: Option<&str>,
        limit: u32,
    ) -> ExchangeResult<serde_json::Value> {
        let params = match contract {
            Some(c) => format!("symbol={c}&limit={limit}"),
            None => format!("limit={limit}"),
        };
        self.http
            .send(Method::Get, "/fapi/v1/allOrders", &params, true, RetryPolicy::standard())
            .await
    }

    #[instrument(skip(self), name = "linear::set_position_stop_loss")]
    async fn set_position_stop_loss(
        &self,
        contract: &str,
        stop: Option<f64>,
        take_profit: Option<f64>,
    ) -> ExchangeResult<StopLossOutcome> {
        // Existing protective orders must go first so we never stack them.
        let cancelled = self.cancel_position_stop_loss(contract).await?;
        if cancelled > 0 {
            debug!(contract, cancelled, "existing protective orders cancelled");
        }

        let position = self.position_for(contract).await?.ok_or_else(|| {
            ExchangeError::InvalidArgument(format!("{contract}: no open position to protect"))
        })?;
        let side = position.side().ok_or_else(|| {
            ExchangeError::InvalidArgument(format!("{contract}: position has zero size"))
        })?;

        let ticker = self.ticker(contract, true).await?;
        let mark = ticker.mark_price.unwrap_or(ticker.last);
        let info = self.contract_info(contract).await?;

        let plan = build_protection_plan(
            &position.symbol,
            side,
            mark,
            stop,
            take_profit,
            position.size.abs(),
            info.tick_size,
        )?;

        let mut outcome = StopLossOutcome {
            ok: true,
            sl_order_id: None,
            tp_order_id: None,
            message: plan.notes.join("; "),
        };

        if let Some(leg) = &plan.stop {
            match self.submit_trigger_leg(contract, side, leg, &info).await {
                Ok(resp) => outcome.sl_order_id = Some(resp.order_id),
                Err(e) => {
                    // No protection at all was established — surface the error.
                    warn!(contract, error = %e, "stop leg placement failed");
                    return Err(e);
                }
            }
        }

        if let Some(leg) = &plan.take_profit {
            match self.submit_trigger_leg(contract, side, leg, &info).await {
                Ok(resp) => outcome.tp_order_id = Some(resp.order_id),
                Err(e) => {
                    // The stop leg survives; report partial protection.
                    warn!(contract, error = %e, "take-profit leg failed — stop preserved");
                    outcome.ok = false;
                    let note = format!("stop placed, take_profit unset: {e}");
                    if outcome.message.is_empty() {
                        outcome.message = note;
                    } else {
                        outcome.message = format!("{}; {note}", outcome.message);
                    }
                }
            }
        } else if take_profit.is_some() {
            // Requested TP leg was dropped during planning.
            outcome.ok = false;
        }

        info!(
            contract,
            sl = ?outcome.sl_order_id,
            tp = ?outcome.tp_order_id,
            ok = outcome.ok,
            "protective orders updated"
        );
        Ok(outcome)
    }

    async fn cancel_position_stop_loss(&self, contract: &str) -> ExchangeResult<u32> {
        let orders = self.get_position_stop_orders(contract).await?;
        let mut cancelled = 0;
        for order in orders {
            self.cancel_order(contract, &order.order_id).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn get_position_stop_orders(
        &self,
        contract: &str,
    ) -> ExchangeResult<Vec<StopOrderView>> {
        let body = self
            .http
            .send(
                Method::Get,
                "/fapi/v1/openOrders",
                &format!("symbol={contract}"),
                true,
                RetryPolicy::standard(),
            )
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("openOrders response is not an array".into()))?;

        let mut views = Vec::new();
        for o in raw {
            let kind = match o["type"].as_str() {
                Some("STOP_MARKET") | Some("STOP") => PriceOrderKind::StopLoss,
                Some("TAKE_PROFIT_MARKET") | Some("TAKE_PROFIT") => PriceOrderKind::TakeProfit,
                _ => continue,
            };
            let order_id = match o["orderId"].as_u64() {
                Some(id) => id.to_string(),
                None => continue,
            };
            views.push(StopOrderView {
                order_id,
                kind,
                trigger_price: parse_str_f64_or(&o["stopPrice"], 0.0),
                quantity: parse_str_f64_or(&o["origQty"], 0.0),
            });
        }
        Ok(views)
    }

    fn quantity_from_usdt(
        &self,
        info: &ContractInfo,
        margin: f64,
        price: f64,
        leverage: f64,
    ) -> f64 {
        sizing::linear_quantity_from_usdt(margin, price, leverage, info.min_order_size)
    }

    fn pnl(&self, _info: &ContractInfo, entry: f64, exit: f64, quantity: f64, side: Side) -> f64 {
        sizing::linear_pnl(entry, exit, quantity, side)
    }
}

impl std::fmt::Debug for UsdtFuturesAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsdtFuturesAdapter")
            .field("http", &self.http)
            .finish()
    }
}
