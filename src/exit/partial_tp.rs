// =============================================================================
// Partial take-profit executor — R-multiple staged state machine
// =============================================================================
//
// Stages trigger at entry ± n·R, where R = |entry - entry_stop_loss|. Each
// stage closes a configured fraction of the REMAINING quantity with a
// reduce-only market order, records the partial-TP row / close trade / close
// event, and migrates the protective stop:
//
//   after stage 1 — stop to entry (break-even)
//   after stage 2 — stop to entry ± 1·R (risk-free runner)
//   after stage 3 — the runner rides the trailing stop only
//
// Multiple schedulers may race on the same position, so each stage executes
// under the distributed lock `partial_tp_{symbol}_{side}_stage{n}` and a
// 30-second recent-close guard; a second caller observes either the held
// lock or the recorded history row and skips.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::PartialTpParams;
use crate::exchange::{ExchangeAdapter, OrderRequest};
use crate::store::lock::{partial_tp_key, RECENT_CLOSE_WINDOW_SECS};
use crate::store::records::{CloseEvent, PartialTpRecord, PositionRecord, TradeKind, TradeRecord};
use crate::store::Store;
use crate::types::Side;

/// Close reasons that arm the recent-close duplicate guard.
const GUARD_REASONS: [&str; 2] = ["partial_close", "reversal"];

/// Outcome of evaluating one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Stage executed: `(stage, closed_quantity, pnl)`.
    Executed {
        stage: u8,
        closed_quantity: f64,
        pnl: f64,
    },
    /// Stage not executed for a stated reason (lock, history, guard, dust).
    Skipped(String),
    /// Price has not reached the stage target.
    NotTriggered,
}

/// A stage that is currently executable, as reported to the agent tools.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecutableStage {
    pub stage: u8,
    pub r_multiple: f64,
    pub fraction: f64,
    pub target_price: f64,
}

pub struct PartialTpExecutor {
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    params: PartialTpParams,
    holder: String,
}

impl PartialTpExecutor {
    pub fn new(
        store: Store,
        adapter: Arc<dyn ExchangeAdapter>,
        params: PartialTpParams,
        holder: String,
    ) -> Self {
        Self {
            store,
            adapter,
            params,
            holder,
        }
    }

    /// Stages whose targets the current price has reached and which have not
    /// yet executed this position lifetime. Read-only.
    pub fn executable_stages(
        &self,
        position: &PositionRecord,
        current_price: f64,
    ) -> Vec<ExecutableStage> {
        let r = position.r_unit();
        if r <= 0.0 {
            return Vec::new();
        }

        let executed = self
            .store
            .executed_stages_since(&position.symbol, position.side, position.opened_at)
            .unwrap_or_default();

        self.params
            .stages
            .iter()
            .enumerate()
            .filter_map(|(idx, stage)| {
                let stage_no = (idx + 1) as u8;
                if executed.contains(&stage_no) {
                    return None;
                }
                let target = position.r_target(stage.r_multiple);
                let reached = match position.side {
                    Side::Long => current_price >= target,
                    Side::Short => current_price <= target,
                };
                reached.then_some(ExecutableStage {
                    stage: stage_no,
                    r_multiple: stage.r_multiple,
                    fraction: stage.fraction,
                    target_price: target,
                })
            })
            .collect()
    }

    /// Evaluate and execute every triggered stage for one position, lowest
    /// stage first. Stages execute strictly in order: a failure or skip of
    /// stage n leaves n+1 for the next pass.
    pub async fn process_position(
        &self,
        position: &PositionRecord,
        current_price: f64,
    ) -> Vec<StageOutcome> {
        let mut outcomes = Vec::new();

        if position.r_unit() <= 0.0 {
            outcomes.push(StageOutcome::Skipped(
                "entry stop equals entry — R undefined".to_string(),
            ));
            return outcomes;
        }

        for stage in self.executable_stages(position, current_price) {
            let outcome = self.execute_stage(position, &stage).await;
            let stop = !matches!(outcome, StageOutcome::Executed { .. });
            outcomes.push(outcome);
            if stop {
                break;
            }
        }

        outcomes
    }

    /// Execute a single stage by number, as requested by the agent tools.
    pub async fn execute_stage_by_number(
        &self,
        position: &PositionRecord,
        stage_no: u8,
        current_price: f64,
    ) -> StageOutcome {
        let Some(stage_cfg) = self.params.stages.get(stage_no.saturating_sub(1) as usize) else {
            return StageOutcome::Skipped(format!("stage {stage_no} not configured"));
        };

        // Earlier stages must have executed first.
        let executed = self
            .store
            .executed_stages_since(&position.symbol, position.side, position.opened_at)
            .unwrap_or_default();
        for earlier in 1..stage_no {
            if !executed.contains(&earlier) {
                return StageOutcome::Skipped(format!(
                    "stage {stage_no} requested before stage {earlier} executed"
                ));
            }
        }

        let target = position.r_target(stage_cfg.r_multiple);
        let reached = match position.side {
            Side::Long => current_price >= target,
            Side::Short => current_price <= target,
        };
        if !reached {
            return StageOutcome::NotTriggered;
        }

        self.execute_stage(
            position,
            &ExecutableStage {
                stage: stage_no,
                r_multiple: stage_cfg.r_multiple,
                fraction: stage_cfg.fraction,
                target_price: target,
            },
        )
        .await
    }

    async fn execute_stage(
        &self,
        position: &PositionRecord,
        stage: &ExecutableStage,
    ) -> StageOutcome {
        let symbol = &position.symbol;
        let side = position.side;

        // Crash-recovery guard: any partial_close/reversal close in the last
        // 30 s means another scheduler (or a restarted one) just acted here.
        match self
            .store
            .has_recent_close(symbol, side, RECENT_CLOSE_WINDOW_SECS, &GUARD_REASONS)
        {
            Ok(true) => {
                return StageOutcome::Skipped("recent close within guard window".to_string())
            }
            Ok(false) => {}
            Err(e) => return StageOutcome::Skipped(format!("recent-close guard failed: {e}")),
        }

        let key = partial_tp_key(symbol, side, stage.stage);
        match self.store.try_acquire_lock(&key, &self.holder) {
            Ok(true) => {}
            Ok(false) => {
                debug!(symbol, stage = stage.stage, "stage lock held elsewhere — skipping");
                return StageOutcome::Skipped("lock contention".to_string());
            }
            Err(e) => return StageOutcome::Skipped(format!("lock acquisition failed: {e}")),
        }

        // The lock is held from here; release on every path.
        let outcome = self.execute_stage_locked(position, stage).await;
        if let Err(e) = self.store.release_lock(&key, &self.holder) {
            warn!(key, error = %e, "failed to release stage lock");
        }
        outcome
    }

    async fn execute_stage_locked(
        &self,
        position: &PositionRecord,
        stage: &ExecutableStage,
    ) -> StageOutcome {
        let symbol = &position.symbol;
        let side = position.side;

        // Re-verify under the lock: the position may have closed, or the
        // stage may have been recorded by the racer that held the lock first.
        let live = match self.store.get_position(symbol, side) {
            Ok(Some(p)) => p,
            Ok(None) => return StageOutcome::Skipped("position no longer exists".to_string()),
            Err(e) => return StageOutcome::Skipped(format!("position lookup failed: {e}")),
        };
        match self
            .store
            .has_partial_tp_since(symbol, side, stage.stage, live.opened_at)
        {
            Ok(true) => {
                return StageOutcome::Skipped(format!("stage {} already recorded", stage.stage))
            }
            Ok(false) => {}
            Err(e) => return StageOutcome::Skipped(format!("history lookup failed: {e}")),
        }

        // Quantise the stage quantity; dust stages are dropped with a reason.
        let contract = self.adapter.normalize_symbol(symbol);
        let info = match self.adapter.contract_info(&contract).await {
            Ok(i) => i,
            Err(e) => return StageOutcome::Skipped(format!("contract info unavailable: {e}")),
        };
        let raw_qty = live.quantity * stage.fraction;
        let close_qty = crate::exchange::sizing::floor_to_step(raw_qty, info.min_order_size);
        if close_qty < info.min_order_size {
            info!(
                symbol,
                stage = stage.stage,
                raw_qty,
                min = info.min_order_size,
                "stage quantity below contract minimum — dropping stage"
            );
            return StageOutcome::Skipped(format!(
                "stage {} quantity {raw_qty:.8} below contract minimum",
                stage.stage
            ));
        }

        // Reduce-only market close of the staged quantity.
        let request = OrderRequest::market_close(&contract, side, close_qty);
        let order = match self.adapter.place_order(&request).await {
            Ok(o) => o,
            Err(e) => {
                warn!(symbol, stage = stage.stage, error = %e, "stage close order failed");
                return StageOutcome::Skipped(format!("close order failed: {e}"));
            }
        };

        let fill_price = order.avg_fill_price.unwrap_or(stage.target_price);
        let pnl = self
            .adapter
            .pnl(&info, live.entry_price, fill_price, close_qty, side);
        let now = Utc::now();

        // Persist the stage. Failures here are logged loudly but do not undo
        // the exchange close — the recent-close guard covers the gap.
        if let Err(e) = self.store.insert_partial_tp(&PartialTpRecord {
            id: 0,
            symbol: symbol.clone(),
            side,
            stage: stage.stage,
            trigger_price: stage.target_price,
            closed_quantity: close_qty,
            pnl,
            order_id: order.order_id.clone(),
            timestamp: now,
        }) {
            warn!(symbol, stage = stage.stage, error = %e, "partial-TP row insert failed");
        }
        if let Err(e) = self.store.apply_partial_close(symbol, side, close_qty, pnl) {
            warn!(symbol, error = %e, "position quantity update failed");
        }
        if let Err(e) = self.store.insert_trade(&TradeRecord {
            order_id: order.order_id.clone(),
            symbol: symbol.clone(),
            side,
            kind: TradeKind::Close,
            price: fill_price,
            quantity: close_qty,
            leverage: live.leverage,
            fee: 0.0,
            pnl: Some(pnl),
            r_multiple: Some(stage.r_multiple),
            strategy_name: Some(live.strategy_type.to_string()),
            timestamp: now,
            status: "filled".to_string(),
        }) {
            warn!(symbol, error = %e, "partial close trade insert failed");
        }
        if let Err(e) = self.store.insert_close_event(&CloseEvent {
            id: 0,
            symbol: symbol.clone(),
            side,
            close_reason: format!("partial_close_stage{}", stage.stage),
            trigger_type: "r_multiple".to_string(),
            close_price: fill_price,
            entry_price: live.entry_price,
            quantity: close_qty,
            leverage: live.leverage,
            pnl,
            pnl_percent: if live.entry_price > 0.0 {
                side.sign() * (fill_price - live.entry_price) / live.entry_price * 100.0
            } else {
                0.0
            },
            fee: 0.0,
            position_order_id: live.entry_order_id.clone(),
            trigger_order_id: Some(order.order_id.clone()),
            created_at: now,
            processed: false,
        }) {
            warn!(symbol, error = %e, "partial close event insert failed");
        }

        // ── Stop migration ───────────────────────────────────────────────
        let new_stop = match stage.stage {
            1 => Some(live.entry_price),
            2 => Some(live.r_target(1.0)),
            _ => None, // stage 3: the runner rides the trailing stop
        };
        if let Some(stop) = new_stop {
            match self
                .adapter
                .set_position_stop_loss(&contract, Some(stop), take_profit_of(&live))
                .await
            {
                Ok(outcome) => {
                    if let Err(e) = self.store.update_position_stop(
                        symbol,
                        side,
                        stop,
                        outcome.sl_order_id.as_deref(),
                    ) {
                        warn!(symbol, error = %e, "stop migration row update failed");
                    }
                    info!(
                        symbol,
                        stage = stage.stage,
                        new_stop = stop,
                        "stop migrated after staged take-profit"
                    );
                }
                Err(e) => {
                    warn!(
                        symbol,
                        stage = stage.stage,
                        error = %e,
                        "stop migration failed — monitor will re-attempt"
                    );
                }
            }
        }

        info!(
            symbol,
            side = %side,
            stage = stage.stage,
            closed_quantity = close_qty,
            pnl = format!("{:.4}", pnl),
            fill_price,
            "staged take-profit executed"
        );

        StageOutcome::Executed {
            stage: stage.stage,
            closed_quantity: close_qty,
            pnl,
        }
    }
}

/// The position's standing take-profit, when one is registered.
fn take_profit_of(position: &PositionRecord) -> Option<f64> {
    (position.take_profit > 0.0).then_some(position.take_profit)
}

// =============================================================================
// Unit Tests — pure stage-selection logic (no exchange involved)
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::PositionRecord;
    use crate::types::StrategyKind;

    fn position(side: Side) -> PositionRecord {
        let (entry, stop) = match side {
            Side::Long => (3000.0, 2952.0),
            Side::Short => (3000.0, 3048.0),
        };
        PositionRecord {
            id: "p1".into(),
            symbol: "ETH".into(),
            exchange: "linear".into(),
            side,
            entry_price: entry,
            quantity: 2.0,
            leverage: 8.0,
            current_price: entry,
            liquidation_price: 0.0,
            unrealised_pnl: 0.0,
            realised_pnl: 0.0,
            stop_loss: stop,
            take_profit: 3240.0,
            entry_order_id: "entry-ETH".into(),
            sl_order_id: None,
            tp_order_id: None,
            opened_at: Utc::now(),
            market_state: "uptrend_continuation".into(),
            strategy_type: StrategyKind::TrendFollowing,
            signal_strength: 0.7,
            opportunity_score: 72.0,
            entry_stop_loss: stop,
            metadata: serde_json::Value::Null,
        }
    }

    struct NoopAdapter;

    #[async_trait::async_trait]
    impl ExchangeAdapter for NoopAdapter {
        fn kind(&self) -> crate::types::ExchangeKind {
            crate::types::ExchangeKind::Linear
        }
        fn normalize_symbol(&self, symbol: &str) -> String {
            format!("{symbol}USDT")
        }
        fn extract_symbol(&self, contract: &str) -> String {
            contract.trim_end_matches("USDT").to_string()
        }
        async fn ticker(
            &self,
            _: &str,
            _: bool,
        ) -> crate::error::ExchangeResult<crate::exchange::Ticker> {
            unimplemented!("not used in these tests")
        }
        async fn candles(
            &self,
            _: &str,
            _: crate::market::Interval,
            _: u32,
        ) -> crate::error::ExchangeResult<Vec<crate::market::Candle>> {
            unimplemented!()
        }
        async fn account(
            &self,
        ) -> crate::error::ExchangeResult<crate::exchange::AccountSummary> {
            unimplemented!()
        }
        async fn positions(
            &self,
            _: &[String],
        ) -> crate::error::ExchangeResult<Vec<crate::exchange::PositionView>> {
            unimplemented!()
        }
        async fn place_order(
            &self,
            _: &OrderRequest,
        ) -> crate::error::ExchangeResult<crate::exchange::OrderResponse> {
            unimplemented!()
        }
        async fn set_leverage(&self, _: &str, _: f64) -> crate::error::ExchangeResult<()> {
            unimplemented!()
        }
        async fn funding_rate(&self, _: &str) -> crate::error::ExchangeResult<f64> {
            unimplemented!()
        }
        async fn contract_info(
            &self,
            _: &str,
        ) -> crate::error::ExchangeResult<crate::exchange::ContractInfo> {
            unimplemented!()
        }
        async fn get_order(
            &self,
            _: &str,
            _: &str,
        ) -> crate::error::ExchangeResult<crate::exchange::OrderResponse> {
            unimplemented!()
        }
        async fn cancel_order(&self, _: &str, _: &str) -> crate::error::ExchangeResult<()> {
            unimplemented!()
        }
        async fn get_open_orders(
            &self,
            _: Option<&str>,
        ) -> crate::error::ExchangeResult<Vec<crate::exchange::OrderResponse>> {
            unimplemented!()
        }
        async fn get_my_trades(
            &self,
            _: &str,
            _: u32,
        ) -> crate::error::ExchangeResult<serde_json::Value> {
            unimplemented!()
        }
        async fn get_order_book(
            &self,
            _: &str,
            _: u32,
        ) -> crate::error::ExchangeResult<serde_json::Value> {
            unimplemented!()
        }
        async fn get_position_history(
            &self,
            _: u32,
        ) -> crate::error::ExchangeResult<serde_json::Value> {
            unimplemented!()
        }
        async fn get_settlement_history(
            &self,
            _: u32,
        ) -> crate::error::ExchangeResult<serde_json::Value> {
            unimplemented!()
        }
        async fn get_order_history(
            &self,
            _: Option<&str>,
            _: u32,
        ) -> crate::error::ExchangeResult<serde_json::Value> {
            unimplemented!()
        }
        async fn set_position_stop_loss(
            &self,
            _: &str,
            _: Option<f64>,
            _: Option<f64>,
        ) -> crate::error::ExchangeResult<crate::exchange::StopLossOutcome> {
            unimplemented!()
        }
        async fn cancel_position_stop_loss(
            &self,
            _: &str,
        ) -> crate::error::ExchangeResult<u32> {
            unimplemented!()
        }
        async fn get_position_stop_orders(
            &self,
            _: &str,
        ) -> crate::error::ExchangeResult<Vec<crate::exchange::StopOrderView>> {
            unimplemented!()
        }
        fn quantity_from_usdt(
            &self,
            _: &crate::exchange::ContractInfo,
            _: f64,
            _: f64,
            _: f64,
        ) -> f64 {
            0.0
        }
        fn pnl(
            &self,
            _: &crate::exchange::ContractInfo,
            entry: f64,
            exit: f64,
            quantity: f64,
            side: Side,
        ) -> f64 {
            side.sign() * quantity * (exit - entry)
        }
    }

    fn executor() -> PartialTpExecutor {
        PartialTpExecutor::new(
            Store::open_in_memory().unwrap(),
            Arc::new(NoopAdapter),
            PartialTpParams::default(),
            "test:1".into(),
        )
    }

    #[test]
    fn stage_targets_long() {
        let e = executor();
        let p = position(Side::Long); // R = 48

        // Below stage 1 target: nothing executable.
        assert!(e.executable_stages(&p, 3040.0).is_empty());

        // At 1R = 3048 only stage 1.
        let stages = e.executable_stages(&p, 3048.0);
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, 1);
        assert!((stages[0].target_price - 3048.0).abs() < 1e-9);

        // At 2.5R both stage 1 and 2.
        let stages = e.executable_stages(&p, 3120.0);
        assert_eq!(stages.iter().map(|s| s.stage).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn stage_targets_short_mirrored() {
        let e = executor();
        let p = position(Side::Short); // R = 48, targets below entry

        let stages = e.executable_stages(&p, 2952.0);
        assert_eq!(stages.len(), 1);
        assert!((stages[0].target_price - 2952.0).abs() < 1e-9);

        assert!(e.executable_stages(&p, 2960.0).is_empty());
    }

    #[test]
    fn zero_r_yields_nothing() {
        let e = executor();
        let mut p = position(Side::Long);
        p.entry_stop_loss = p.entry_price; // R = 0 is rejected
        assert!(e.executable_stages(&p, 5000.0).is_empty());
    }

    #[test]
    fn executed_stage_not_offered_again() {
        let e = executor();
        let p = position(Side::Long);

        e.store
            .insert_partial_tp(&PartialTpRecord {
                id: 0,
                symbol: "ETH".into(),
                side: Side::Long,
                stage: 1,
                trigger_price: 3048.0,
                closed_quantity: 0.66,
                pnl: 31.68,
                order_id: "ptp-1".into(),
                timestamp: Utc::now(),
            })
            .unwrap();

        let stages = e.executable_stages(&p, 3200.0);
        assert_eq!(stages.iter().map(|s| s.stage).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn out_of_order_stage_request_refused() {
        let e = executor();
        let p = position(Side::Long);
        // Requesting stage 2 before stage 1 has been recorded.
        let outcome = e.execute_stage_by_number(&p, 2, 3200.0).await;
        assert!(matches!(outcome, StageOutcome::Skipped(ref r) if r.contains("before stage 1")));
    }

    #[tokio::test]
    async fn untriggered_stage_reports_not_triggered() {
        let e = executor();
        let p = position(Side::Long);
        let outcome = e.execute_stage_by_number(&p, 1, 3000.0).await;
        assert_eq!(outcome, StageOutcome::NotTriggered);
    }
}
