// =============================================================================
// Trading engine — periodic tick, monitor loop, and the open-position flow
// =============================================================================
//
// Two timers drive everything:
//
//   trading tick   (every trading_interval_minutes) — account snapshot and
//     equity curve, reconciliation against the exchange, trailing stops and
//     holding-time force-closes, then the opportunity scan that may open one
//     new position.
//
//   monitor loop   (every price_order_check_interval seconds) — per open
//     position: mark refresh, staged take-profits, the reversal monitor, and
//     stop re-registration for positions whose protective orders are missing.
//
// A tick that overruns its interval is cancelled to preserve cadence; any
// already-persisted work stands. Failures never abort the scheduler — every
// error inside the loops degrades to a structured log line.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::EngineError;
use crate::exchange::{build_adapter, ExchangeAdapter, OrderRequest};
use crate::exit::{PartialTpExecutor, ReversalMonitor};
use crate::indicators::TimeframeIndicators;
use crate::market::Candle;
use crate::regime::{RegimeAnalysis, RegimeClassifier};
use crate::scoring::{OpportunityScore, OpportunityScorer};
use crate::stop_loss::StopLossEngine;
use crate::store::lock::holder_identity;
use crate::store::records::{
    AccountSnapshotRow, CloseEvent, PositionRecord, PriceOrderRecord, PriceOrderStatus, TradeKind,
    TradeRecord,
};
use crate::store::Store;
use crate::strategy::{StrategyResult, StrategyRouter};
use crate::types::{Action, OrderStatus, PriceOrderKind, Side};

/// Candles fetched per timeframe during evaluation.
const EVAL_CANDLE_LIMIT: u32 = 100;

/// Fill-poll attempts after submitting an entry order.
const FILL_POLL_ATTEMPTS: u32 = 3;
const FILL_POLL_DELAY: Duration = Duration::from_secs(1);

/// One symbol's full evaluation output.
pub struct SymbolEvaluation {
    pub symbol: String,
    pub analysis: RegimeAnalysis,
    pub strategy: StrategyResult,
    pub score: OpportunityScore,
    pub confirm_candles: Vec<Candle>,
}

/// The assembled engine. All collaborators are passed in explicitly; nothing
/// here reads configuration or reaches for globals after construction.
pub struct TradingEngine {
    pub settings: Settings,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub store: Store,
    pub classifier: Arc<RegimeClassifier>,
    pub router: StrategyRouter,
    pub scorer: OpportunityScorer,
    pub stop_engine: StopLossEngine,
    pub partial_tp: PartialTpExecutor,
    pub reversal: ReversalMonitor,
    pub holder: String,
}

impl TradingEngine {
    /// Wire every subsystem from validated settings.
    pub fn new(settings: Settings) -> Result<Self, EngineError> {
        let store = Store::open(&settings.database_path)?;
        let adapter = build_adapter(&settings);
        let classifier = Arc::new(RegimeClassifier::new(settings.regime.clone()));
        let holder = holder_identity();

        let partial_tp = PartialTpExecutor::new(
            store.clone(),
            adapter.clone(),
            settings.partial_tp.clone(),
            holder.clone(),
        );
        let reversal = ReversalMonitor::new(
            store.clone(),
            adapter.clone(),
            classifier.clone(),
            settings.trading_strategy,
            holder.clone(),
            "monitor",
        );

        Ok(Self {
            router: StrategyRouter::new(settings.max_leverage),
            scorer: OpportunityScorer::new(
                settings.min_opportunity_score,
                settings.max_opportunities_to_show,
            ),
            stop_engine: StopLossEngine::new(settings.stop_loss.clone()),
            partial_tp,
            reversal,
            classifier,
            adapter,
            store,
            holder,
            settings,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run until ctrl-c. Spawns the trading tick and the monitor loop, then
    /// drains gracefully: locks released, a final equity point flushed.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.startup_checks().await?;

        let tick_interval = Duration::from_secs(self.settings.trading_interval_minutes * 60);
        let monitor_interval = Duration::from_secs(self.settings.price_order_check_interval_secs);

        let tick_engine = self.clone();
        let tick_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                // Cancel a tick that overruns its own interval.
                match tokio::time::timeout(tick_interval, tick_engine.trading_tick()).await {
                    Ok(()) => {}
                    Err(_) => warn!(
                        interval_secs = tick_interval.as_secs(),
                        "trading tick overran its interval — cancelled"
                    ),
                }
            }
        });

        let monitor_engine = self.clone();
        let monitor_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor_interval);
            loop {
                ticker.tick().await;
                match tokio::time::timeout(monitor_interval, monitor_engine.monitor_tick()).await {
                    Ok(()) => {}
                    Err(_) => warn!("monitor pass overran its interval — cancelled"),
                }
            }
        });

        info!(
            tick_minutes = self.settings.trading_interval_minutes,
            monitor_secs = self.settings.price_order_check_interval_secs,
            "trading loops running — ctrl-c to stop"
        );

        tokio::signal::ctrl_c().await?;
        warn!("shutdown signal received — draining");

        tick_task.abort();
        monitor_task.abort();

        if let Err(e) = self.store.release_all_locks(&self.holder) {
            warn!(error = %e, "failed to release locks on shutdown");
        }
        if let Err(e) = self.account_snapshot().await {
            warn!(error = %e, "final equity flush failed");
        }

        info!("shutdown complete");
        Ok(())
    }

    /// Fail fast on bad credentials; repair store/exchange drift left behind
    /// by a previous run.
    async fn startup_checks(&self) -> anyhow::Result<()> {
        // An authentication failure surfaces immediately rather than from
        // inside the first tick.
        let account = self.adapter.account().await?;
        info!(
            currency = %account.currency,
            total = account.total,
            available = account.available,
            "exchange account reachable"
        );

        // Orphan price-orders: active rows with no open position. Their
        // exchange-side counterparts are cancelled best-effort.
        let orphans = self.store.orphan_price_orders()?;
        for orphan in orphans {
            let contract = self.adapter.normalize_symbol(&orphan.symbol);
            if let Err(e) = self.adapter.cancel_order(&contract, &orphan.order_id).await {
                warn!(
                    order_id = %orphan.order_id,
                    error = %e,
                    "failed to cancel orphan order on exchange"
                );
            }
        }

        // Phantom positions: store rows without an exchange counterpart.
        let contracts = self.watch_contracts();
        match self.adapter.positions(&contracts).await {
            Ok(exchange_positions) => {
                for stored in self.store.get_open_positions()? {
                    let exists = exchange_positions.iter().any(|p| {
                        p.symbol == stored.symbol && p.side() == Some(stored.side)
                    });
                    if !exists {
                        warn!(
                            symbol = %stored.symbol,
                            side = %stored.side,
                            "phantom position: store row has no exchange counterpart — operator reconciliation required"
                        );
                    }
                }
            }
            Err(e) => warn!(error = %e, "startup position reconciliation skipped"),
        }

        Ok(())
    }

    fn watch_contracts(&self) -> Vec<String> {
        self.settings
            .symbols
            .iter()
            .map(|s| self.adapter.normalize_symbol(s))
            .collect()
    }

    // =========================================================================
    // Trading tick
    // =========================================================================

    pub async fn trading_tick(&self) {
        debug!("trading tick start");

        // 1. Account snapshot + equity curve + drawdown gates.
        let drawdown_pct = match self.account_snapshot().await {
            Ok(dd) => dd,
            Err(e) => {
                error!(error = %e, "account snapshot failed — skipping tick");
                return;
            }
        };

        if drawdown_pct >= self.settings.drawdown.warning_pct {
            warn!(
                drawdown_pct = format!("{:.2}", drawdown_pct),
                threshold = self.settings.drawdown.warning_pct,
                "account drawdown past warning threshold"
            );
        }
        let no_new_positions = self.settings.drawdown.enable_no_new_position
            && drawdown_pct >= self.settings.drawdown.no_new_position_pct;

        // 2. Reconcile exchange positions with the store.
        self.reconcile_positions().await;

        // 3. Manage every open position (trailing stop, holding time).
        let open = match self.store.get_open_positions() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "open-position query failed");
                return;
            }
        };
        for position in &open {
            self.manage_position(position).await;
        }

        // 4. Budget new entries.
        let budget = self.settings.max_positions.saturating_sub(open.len());
        if budget == 0 {
            debug!(open = open.len(), "position budget exhausted");
            return;
        }
        if no_new_positions {
            warn!("drawdown kill-switch active — no new positions this tick");
            return;
        }

        // 5. Evaluate the watch-list concurrently and open the top survivor.
        let open_symbols: Vec<String> = open.iter().map(|p| p.symbol.clone()).collect();
        let evaluations = self.evaluate_watchlist().await;

        let mut scored: Vec<&SymbolEvaluation> = evaluations
            .iter()
            .filter(|e| e.strategy.action != Action::Wait)
            .collect();
        scored.sort_by(|a, b| b.score.total.cmp(&a.score.total));

        let ranked_symbols = self.scorer.rank(
            scored.iter().map(|e| e.score.clone()).collect(),
            &open_symbols,
            false,
        );

        let Some(best) = ranked_symbols.first() else {
            debug!("no opportunity cleared the score threshold");
            return;
        };
        let Some(evaluation) = evaluations.iter().find(|e| e.symbol == best.symbol) else {
            return;
        };

        info!(
            symbol = %best.symbol,
            score = best.total,
            action = %evaluation.strategy.action,
            strategy = %evaluation.strategy.strategy_type,
            "top opportunity selected"
        );

        if let Err(e) = self.open_position(evaluation).await {
            error!(symbol = %best.symbol, error = %e, "position open failed");
        }
    }

    /// Evaluate every watch-list symbol concurrently. Request concurrency is
    /// bounded by the adapter's in-flight semaphore.
    pub async fn evaluate_watchlist(&self) -> Vec<SymbolEvaluation> {
        let futures = self
            .settings
            .symbols
            .iter()
            .map(|symbol| self.evaluate_symbol(symbol.clone()));
        join_all(futures).await.into_iter().flatten().collect()
    }

    /// Full pipeline for one symbol: candles → indicators → regime →
    /// strategy → score.
    pub async fn evaluate_symbol(&self, symbol: String) -> Option<SymbolEvaluation> {
        let contract = self.adapter.normalize_symbol(&symbol);
        let (primary_iv, confirm_iv, filter_iv) = self.settings.trading_strategy.timeframes();

        let (primary_candles, confirm_candles, filter_candles) = tokio::join!(
            self.adapter.candles(&contract, primary_iv, EVAL_CANDLE_LIMIT),
            self.adapter.candles(&contract, confirm_iv, EVAL_CANDLE_LIMIT),
            self.adapter.candles(&contract, filter_iv, EVAL_CANDLE_LIMIT),
        );

        let (primary_candles, confirm_candles, filter_candles) =
            match (primary_candles, confirm_candles, filter_candles) {
                (Ok(p), Ok(c), Ok(f)) => (p, c, f),
                (p, c, f) => {
                    let err = [p.err(), c.err(), f.err()]
                        .into_iter()
                        .flatten()
                        .next()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    warn!(symbol, error = %err, "candle fetch failed — skipping symbol");
                    return None;
                }
            };

        let primary = TimeframeIndicators::compute(&primary_candles);
        let confirm = TimeframeIndicators::compute(&confirm_candles);
        let filter = TimeframeIndicators::compute(&filter_candles);

        let analysis = self.classifier.classify(&symbol, &primary, &confirm, &filter);
        let strategy = self
            .router
            .route(&symbol, &analysis, &confirm, &filter, &confirm_candles);
        let score = self.scorer.score(&strategy, &analysis);

        Some(SymbolEvaluation {
            symbol,
            analysis,
            strategy,
            score,
            confirm_candles,
        })
    }

    // =========================================================================
    // Open flow
    // =========================================================================

    /// Validate the stop, size, open, protect, persist — compensating on the
    /// way out when a late step fails.
    pub async fn open_position(&self, evaluation: &SymbolEvaluation) -> anyhow::Result<()> {
        let symbol = &evaluation.symbol;
        let Some(side) = evaluation.strategy.action.side() else {
            anyhow::bail!("open requested for a wait action");
        };
        let contract = self.adapter.normalize_symbol(symbol);

        let ticker = self.adapter.ticker(&contract, true).await?;
        let reference_price = ticker.mark_price.unwrap_or(ticker.last);

        // ── Stop validation gate ─────────────────────────────────────────
        let stop = self
            .stop_engine
            .compute(symbol, side, reference_price, &evaluation.confirm_candles);
        if self.settings.enable_stop_loss_filter {
            let (ok, reason) = self.stop_engine.should_open_position(&stop);
            if !ok {
                info!(symbol, reason = %reason, "open rejected by stop gate");
                return Ok(());
            }
        }

        // ── Sizing ───────────────────────────────────────────────────────
        let account = self.adapter.account().await?;
        let budget_slots = self
            .settings
            .max_positions
            .saturating_sub(self.store.get_open_positions()?.len())
            .max(1);
        let margin = account.available / budget_slots as f64;
        let leverage = evaluation
            .strategy
            .recommended_leverage
            .min(self.settings.max_leverage);

        let info = self.adapter.contract_info(&contract).await?;
        let quantity = self
            .adapter
            .quantity_from_usdt(&info, margin, reference_price, leverage);
        if quantity < info.min_order_size {
            info!(
                symbol,
                quantity,
                min = info.min_order_size,
                "sized quantity below contract minimum — skipping open"
            );
            return Ok(());
        }

        self.adapter.set_leverage(&contract, leverage).await?;

        // ── Entry ────────────────────────────────────────────────────────
        let request = OrderRequest::market_open(&contract, side, quantity);
        let order = self.adapter.place_order(&request).await?;
        let fill = self.await_fill(&contract, &order.order_id).await;
        let entry_price = fill.unwrap_or(reference_price);

        // Recompute the stop at the actual fill before registering it.
        let stop = self
            .stop_engine
            .compute(symbol, side, entry_price, &evaluation.confirm_candles);
        let extreme_tp = entry_price
            + side.sign() * self.settings.partial_tp.extreme_r * (entry_price - stop.stop_price).abs();

        // ── Protective orders (bare state on persistent failure) ─────────
        let protection = match self
            .adapter
            .set_position_stop_loss(&contract, Some(stop.stop_price), Some(extreme_tp))
            .await
        {
            Ok(p) => Some(p),
            Err(e) => {
                error!(
                    symbol,
                    error = %e,
                    "protective orders failed after retries — position opens BARE; monitor will re-attempt"
                );
                None
            }
        };

        // ── Persist ──────────────────────────────────────────────────────
        let now = Utc::now();
        let (sl_order_id, tp_order_id) = match &protection {
            Some(p) => (p.sl_order_id.clone(), p.tp_order_id.clone()),
            None => (None, None),
        };

        let position = PositionRecord {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            exchange: self.adapter.kind().to_string(),
            side,
            entry_price,
            quantity,
            leverage,
            current_price: entry_price,
            liquidation_price: 0.0,
            unrealised_pnl: 0.0,
            realised_pnl: 0.0,
            stop_loss: stop.stop_price,
            take_profit: extreme_tp,
            entry_order_id: order.order_id.clone(),
            sl_order_id: sl_order_id.clone(),
            tp_order_id: tp_order_id.clone(),
            opened_at: now,
            market_state: evaluation.analysis.regime.to_string(),
            strategy_type: evaluation.strategy.strategy_type,
            signal_strength: evaluation.strategy.signal_strength,
            opportunity_score: evaluation.score.total as f64,
            entry_stop_loss: stop.stop_price,
            metadata: serde_json::json!({
                "stop_method": stop.method,
                "quality_score": stop.quality_score,
                "reason": evaluation.strategy.reason,
            }),
        };

        let entry_trade = TradeRecord {
            order_id: order.order_id.clone(),
            symbol: symbol.clone(),
            side,
            kind: TradeKind::Open,
            price: entry_price,
            quantity,
            leverage,
            fee: 0.0,
            pnl: None,
            r_multiple: None,
            strategy_name: Some(evaluation.strategy.strategy_type.to_string()),
            timestamp: now,
            status: "filled".to_string(),
        };

        let mut price_orders = Vec::new();
        if let Some(id) = &sl_order_id {
            price_orders.push(protective_row(
                id,
                &order.order_id,
                symbol,
                side,
                PriceOrderKind::StopLoss,
                stop.stop_price,
                quantity,
                now,
            ));
        }
        if let Some(id) = &tp_order_id {
            price_orders.push(protective_row(
                id,
                &order.order_id,
                symbol,
                side,
                PriceOrderKind::TakeProfit,
                extreme_tp,
                quantity,
                now,
            ));
        }

        if let Err(e) = self
            .store
            .open_position_tx(&position, &entry_trade, &price_orders)
        {
            // Compensation: the store rolled back; remove whatever the
            // exchange already holds so nothing runs unprotected and untracked.
            error!(symbol, error = %e, "position persist failed — compensating exchange state");
            if let Err(e2) = self.adapter.cancel_position_stop_loss(&contract).await {
                warn!(symbol, error = %e2, "compensation: protective cancel failed");
            }
            return Err(e.into());
        }

        info!(
            symbol,
            side = %side,
            entry_price,
            quantity,
            leverage,
            stop = stop.stop_price,
            take_profit = extreme_tp,
            quality = stop.quality_score,
            bare = protection.is_none(),
            "position opened"
        );
        Ok(())
    }

    /// Poll the entry order for a fill price.
    async fn await_fill(&self, contract: &str, order_id: &str) -> Option<f64> {
        for _ in 0..FILL_POLL_ATTEMPTS {
            match self.adapter.get_order(contract, order_id).await {
                Ok(order) if order.status == OrderStatus::Filled => {
                    return order.avg_fill_price;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(contract, order_id, error = %e, "fill poll failed");
                }
            }
            tokio::time::sleep(FILL_POLL_DELAY).await;
        }
        warn!(contract, order_id, "fill not confirmed — falling back to reference price");
        None
    }

    // =========================================================================
    // Per-position management (trailing stop, holding time)
    // =========================================================================

    async fn manage_position(&self, position: &PositionRecord) {
        // Holding-time force close comes first; an expired position should
        // not have its stop massaged.
        let held = position.holding_hours(Utc::now());
        if held >= self.settings.max_holding_hours as f64 {
            warn!(
                symbol = %position.symbol,
                held_hours = format!("{:.1}", held),
                max = self.settings.max_holding_hours,
                "maximum holding time exceeded — force closing"
            );
            self.force_close(position, "max_holding_time").await;
            return;
        }

        if !self.settings.enable_trailing_stop_loss {
            return;
        }

        let contract = self.adapter.normalize_symbol(&position.symbol);
        let (_, confirm_iv, _) = self.settings.trading_strategy.timeframes();
        let candles = match self.adapter.candles(&contract, confirm_iv, EVAL_CANDLE_LIMIT).await {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "trailing candle fetch failed");
                return;
            }
        };
        let price = match self.adapter.ticker(&contract, true).await {
            Ok(t) => t.mark_price.unwrap_or(t.last),
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "trailing ticker fetch failed");
                return;
            }
        };

        let decision = self.stop_engine.propose_trailing(
            &position.symbol,
            position.side,
            price,
            position.stop_loss,
            &candles,
        );
        if !decision.should_update {
            debug!(symbol = %position.symbol, reason = %decision.reason, "trailing update rejected");
            return;
        }
        let Some(new_stop) = decision.new_stop else { return };

        match self
            .adapter
            .set_position_stop_loss(
                &contract,
                Some(new_stop),
                (position.take_profit > 0.0).then_some(position.take_profit),
            )
            .await
        {
            Ok(outcome) => {
                if let Err(e) = self.store.update_position_stop(
                    &position.symbol,
                    position.side,
                    new_stop,
                    outcome.sl_order_id.as_deref(),
                ) {
                    warn!(symbol = %position.symbol, error = %e, "trailing stop row update failed");
                }
                info!(
                    symbol = %position.symbol,
                    old_stop = position.stop_loss,
                    new_stop,
                    "trailing stop advanced"
                );
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "trailing stop registration failed");
            }
        }
    }

    /// Market-close the full remaining quantity outside the staged machinery.
    async fn force_close(&self, position: &PositionRecord, reason: &str) {
        let contract = self.adapter.normalize_symbol(&position.symbol);
        let request = OrderRequest::market_close(&contract, position.side, position.quantity);

        let order = match self.adapter.place_order(&request).await {
            Ok(o) => o,
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "force close order failed");
                return;
            }
        };

        let info = match self.adapter.contract_info(&contract).await {
            Ok(i) => i,
            Err(e) => {
                error!(symbol = %position.symbol, error = %e, "contract info unavailable during force close");
                return;
            }
        };
        let fill_price = order.avg_fill_price.unwrap_or(position.current_price);
        let pnl = self.adapter.pnl(
            &info,
            position.entry_price,
            fill_price,
            position.quantity,
            position.side,
        );
        let now = Utc::now();

        let close_result = self.store.close_position_tx(
            &position.symbol,
            position.side,
            &CloseEvent {
                id: 0,
                symbol: position.symbol.clone(),
                side: position.side,
                close_reason: reason.to_string(),
                trigger_type: "scheduler".to_string(),
                close_price: fill_price,
                entry_price: position.entry_price,
                quantity: position.quantity,
                leverage: position.leverage,
                pnl,
                pnl_percent: if position.entry_price > 0.0 {
                    position.side.sign() * (fill_price - position.entry_price)
                        / position.entry_price
                        * 100.0
                } else {
                    0.0
                },
                fee: 0.0,
                position_order_id: position.entry_order_id.clone(),
                trigger_order_id: Some(order.order_id.clone()),
                created_at: now,
                processed: false,
            },
            &TradeRecord {
                order_id: order.order_id,
                symbol: position.symbol.clone(),
                side: position.side,
                kind: TradeKind::Close,
                price: fill_price,
                quantity: position.quantity,
                leverage: position.leverage,
                fee: 0.0,
                pnl: Some(pnl),
                r_multiple: (position.r_unit() > 0.0).then(|| {
                    position.side.sign() * (fill_price - position.entry_price) / position.r_unit()
                }),
                strategy_name: Some(position.strategy_type.to_string()),
                timestamp: now,
                status: "filled".to_string(),
            },
        );
        if let Err(e) = close_result {
            error!(symbol = %position.symbol, error = %e, "force close persist failed");
            return;
        }

        if let Err(e) = self.adapter.cancel_position_stop_loss(&contract).await {
            warn!(symbol = %position.symbol, error = %e, "protective cancel failed after force close");
        }

        info!(
            symbol = %position.symbol,
            reason,
            fill_price,
            pnl = format!("{:.4}", pnl),
            "position force closed"
        );
    }

    // =========================================================================
    // Monitor tick — staged TPs, reversal checks, bare-stop repair
    // =========================================================================

    pub async fn monitor_tick(&self) {
        let open = match self.store.get_open_positions() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "monitor: open-position query failed");
                return;
            }
        };
        if open.is_empty() {
            debug!("monitor: no open positions");
            return;
        }

        for position in &open {
            let contract = self.adapter.normalize_symbol(&position.symbol);

            let price = match self.adapter.ticker(&contract, true).await {
                Ok(t) => t.mark_price.unwrap_or(t.last),
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "monitor ticker fetch failed");
                    continue;
                }
            };

            // Mark refresh for dashboards and holding math.
            let info = match self.adapter.contract_info(&contract).await {
                Ok(i) => i,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "monitor contract info failed");
                    continue;
                }
            };
            let unrealised = self.adapter.pnl(
                &info,
                position.entry_price,
                price,
                position.quantity,
                position.side,
            );
            if let Err(e) = self.store.update_position_mark(
                &position.symbol,
                position.side,
                price,
                unrealised,
            ) {
                warn!(symbol = %position.symbol, error = %e, "mark update failed");
            }

            // Bare-position repair: a position without a registered stop gets
            // its protection re-attempted before anything else runs.
            if position.sl_order_id.is_none() {
                self.repair_bare_position(position, &contract).await;
            }

            // Staged take-profits.
            for outcome in self.partial_tp.process_position(position, price).await {
                debug!(symbol = %position.symbol, outcome = ?outcome, "partial-TP outcome");
            }

            // Reversal monitor runs on the (possibly reduced) position.
            match self.store.get_position(&position.symbol, position.side) {
                Ok(Some(live)) => {
                    let assessment = self.reversal.process_position(&live).await;
                    if let Some(a) = assessment {
                        debug!(symbol = %live.symbol, score = a.score, tier = ?a.tier, "reversal pass complete");
                    }
                }
                Ok(None) => {} // fully closed meanwhile
                Err(e) => warn!(symbol = %position.symbol, error = %e, "monitor refetch failed"),
            }
        }
    }

    async fn repair_bare_position(&self, position: &PositionRecord, contract: &str) {
        warn!(
            symbol = %position.symbol,
            "bare position detected — re-attempting protective stop registration"
        );
        match self
            .adapter
            .set_position_stop_loss(
                contract,
                Some(position.stop_loss),
                (position.take_profit > 0.0).then_some(position.take_profit),
            )
            .await
        {
            Ok(outcome) => {
                if let Err(e) = self.store.update_protective_order_ids(
                    &position.symbol,
                    position.side,
                    outcome.sl_order_id.as_deref(),
                    outcome.tp_order_id.as_deref(),
                ) {
                    warn!(symbol = %position.symbol, error = %e, "bare repair row update failed");
                }
                info!(symbol = %position.symbol, "bare position re-protected");
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "bare repair failed — will retry next pass");
            }
        }
    }

    // =========================================================================
    // Reconciliation & account snapshots
    // =========================================================================

    /// The exchange is authoritative for existence, the store for metadata.
    async fn reconcile_positions(&self) {
        let contracts = self.watch_contracts();
        let exchange_positions = match self.adapter.positions(&contracts).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "reconciliation skipped — positions unavailable");
                return;
            }
        };

        let stored = match self.store.get_open_positions() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "reconciliation skipped — store unavailable");
                return;
            }
        };

        // Store rows the exchange no longer knows: the position was closed
        // out-of-band (stop hit, manual close). Record and remove.
        for position in &stored {
            let on_exchange = exchange_positions
                .iter()
                .any(|p| p.symbol == position.symbol && p.side() == Some(position.side));
            if on_exchange {
                continue;
            }

            warn!(
                symbol = %position.symbol,
                side = %position.side,
                "position gone on exchange — recording external close"
            );
            let now = Utc::now();
            let close_price = position.current_price;
            let result = self.store.close_position_tx(
                &position.symbol,
                position.side,
                &CloseEvent {
                    id: 0,
                    symbol: position.symbol.clone(),
                    side: position.side,
                    close_reason: "external_close_reconciled".to_string(),
                    trigger_type: "reconcile".to_string(),
                    close_price,
                    entry_price: position.entry_price,
                    quantity: position.quantity,
                    leverage: position.leverage,
                    pnl: position.unrealised_pnl,
                    pnl_percent: 0.0,
                    fee: 0.0,
                    position_order_id: position.entry_order_id.clone(),
                    trigger_order_id: None,
                    created_at: now,
                    processed: false,
                },
                &TradeRecord {
                    order_id: format!("reconcile-{}", Uuid::new_v4().simple()),
                    symbol: position.symbol.clone(),
                    side: position.side,
                    kind: TradeKind::Close,
                    price: close_price,
                    quantity: position.quantity,
                    leverage: position.leverage,
                    fee: 0.0,
                    pnl: Some(position.unrealised_pnl),
                    r_multiple: None,
                    strategy_name: Some(position.strategy_type.to_string()),
                    timestamp: now,
                    status: "reconciled".to_string(),
                },
            );
            if let Err(e) = result {
                error!(symbol = %position.symbol, error = %e, "external close persist failed");
            }
        }

        // Exchange positions the store does not track are surfaced only; an
        // operator (or the agent) opened them outside this engine.
        for exchange_pos in &exchange_positions {
            let tracked = stored.iter().any(|p| {
                p.symbol == exchange_pos.symbol && Some(p.side) == exchange_pos.side()
            });
            if !tracked {
                warn!(
                    symbol = %exchange_pos.symbol,
                    size = exchange_pos.size,
                    "untracked exchange position — not managed by this engine"
                );
            }
        }
    }

    /// Snapshot the account and extend the equity curve. Returns the current
    /// drawdown percentage.
    async fn account_snapshot(&self) -> anyhow::Result<f64> {
        let account = self.adapter.account().await?;
        let now = Utc::now();

        let return_percent = if self.settings.initial_balance > 0.0 {
            (account.total - self.settings.initial_balance) / self.settings.initial_balance * 100.0
        } else {
            0.0
        };

        self.store.record_account_snapshot(&AccountSnapshotRow {
            timestamp: now,
            total_value: account.total,
            available_cash: account.available,
            unrealized_pnl: account.unrealised_pnl,
            realized_pnl: 0.0,
            return_percent,
        })?;

        let point = self.store.append_equity_point(now, account.total)?;
        if point.is_new_peak {
            debug!(equity = point.equity, "new equity peak");
        }
        Ok(point.drawdown_pct)
    }
}

/// Build the store row for one freshly placed protective order.
#[allow(clippy::too_many_arguments)]
fn protective_row(
    order_id: &str,
    position_order_id: &str,
    symbol: &str,
    side: Side,
    kind: PriceOrderKind,
    trigger_price: f64,
    quantity: f64,
    now: chrono::DateTime<Utc>,
) -> PriceOrderRecord {
    PriceOrderRecord {
        order_id: order_id.to_string(),
        position_order_id: position_order_id.to_string(),
        symbol: symbol.to_string(),
        side,
        kind,
        trigger_price,
        order_price: 0.0,
        quantity,
        status: PriceOrderStatus::Active,
        created_at: now,
        updated_at: now,
    }
}
