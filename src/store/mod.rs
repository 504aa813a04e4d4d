// =============================================================================
// Position / order store — SQLite persistence with transactional boundaries
// =============================================================================
//
// The database is the single source of truth for position metadata and event
// history. Two write boundaries are transactional:
//
//   open_position_tx   — position + open trade + two price-orders, or nothing
//   close_position_tx  — delete position, insert close event + close trade,
//                        mark its price-orders cancelled
//
// Everything else is a single-statement write. Connections run in WAL mode;
// tests use an in-memory database.
// =============================================================================

pub mod lock;
pub mod records;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};
use crate::types::{PriceOrderKind, Side, StrategyKind};

use records::{
    AccountSnapshotRow, CloseEvent, EquityPoint, PartialTpRecord, PositionRecord,
    PriceOrderRecord, PriceOrderStatus, TradeKind, TradeRecord,
};

/// SQLite-backed store. Cheap to clone; the connection is shared.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Create every table the engine persists to.
    pub fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                exchange TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                leverage REAL NOT NULL,
                current_price REAL NOT NULL DEFAULT 0,
                liquidation_price REAL NOT NULL DEFAULT 0,
                unrealised_pnl REAL NOT NULL DEFAULT 0,
                realised_pnl REAL NOT NULL DEFAULT 0,
                stop_loss REAL NOT NULL DEFAULT 0,
                take_profit REAL NOT NULL DEFAULT 0,
                entry_order_id TEXT NOT NULL,
                sl_order_id TEXT,
                tp_order_id TEXT,
                opened_at TEXT NOT NULL,
                market_state TEXT NOT NULL DEFAULT '',
                strategy_type TEXT NOT NULL DEFAULT 'none',
                signal_strength REAL NOT NULL DEFAULT 0,
                opportunity_score REAL NOT NULL DEFAULT 0,
                entry_stop_loss REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                UNIQUE(symbol, side)
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                leverage REAL NOT NULL DEFAULT 1,
                fee REAL NOT NULL DEFAULT 0,
                pnl REAL,
                r_multiple REAL,
                strategy_name TEXT,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'filled'
            );

            CREATE TABLE IF NOT EXISTS price_orders (
                order_id TEXT PRIMARY KEY,
                position_order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                kind TEXT NOT NULL,
                trigger_price REAL NOT NULL,
                order_price REAL NOT NULL DEFAULT 0,
                quantity REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS position_close_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                close_reason TEXT NOT NULL,
                trigger_type TEXT NOT NULL DEFAULT '',
                close_price REAL NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                leverage REAL NOT NULL DEFAULT 1,
                pnl REAL NOT NULL DEFAULT 0,
                pnl_percent REAL NOT NULL DEFAULT 0,
                fee REAL NOT NULL DEFAULT 0,
                position_order_id TEXT NOT NULL DEFAULT '',
                trigger_order_id TEXT,
                created_at TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_close_events_symbol_side_time
                ON position_close_events(symbol, side, created_at);

            CREATE TABLE IF NOT EXISTS partial_take_profit_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                stage INTEGER NOT NULL,
                trigger_price REAL NOT NULL,
                closed_quantity REAL NOT NULL,
                pnl REAL NOT NULL DEFAULT 0,
                order_id TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_partial_tp_symbol_side_stage
                ON partial_take_profit_history(symbol, side, stage);

            CREATE TABLE IF NOT EXISTS account_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                total_value REAL NOT NULL,
                available_cash REAL NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                return_percent REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                equity REAL NOT NULL,
                peak_equity REAL NOT NULL,
                drawdown_pct REAL NOT NULL DEFAULT 0,
                drawdown_value REAL NOT NULL DEFAULT 0,
                is_new_peak INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS system_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Seed the first account row when the history is empty.
    pub fn seed_account(&self, initial_balance: f64) -> StoreResult<()> {
        let conn = self.lock_conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM account_history", [], |r| r.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO account_history
                 (timestamp, total_value, available_cash, unrealized_pnl, realized_pnl, return_percent)
                 VALUES (?1, ?2, ?2, 0, 0, 0)",
                params![Utc::now().to_rfc3339(), initial_balance],
            )?;
            info!(initial_balance, "account history seeded");
        }
        Ok(())
    }

    // =========================================================================
    // Positions — transactional open / close
    // =========================================================================

    /// Atomically persist a freshly opened position: the position row, its
    /// entry trade, and its protective price-orders. All or nothing.
    pub fn open_position_tx(
        &self,
        position: &PositionRecord,
        entry_trade: &TradeRecord,
        price_orders: &[PriceOrderRecord],
    ) -> StoreResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO positions
             (id, symbol, exchange, side, entry_price, quantity, leverage, current_price,
              liquidation_price, unrealised_pnl, realised_pnl, stop_loss, take_profit,
              entry_order_id, sl_order_id, tp_order_id, opened_at, market_state,
              strategy_type, signal_strength, opportunity_score, entry_stop_loss, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
            params![
                position.id,
                position.symbol,
                position.exchange,
                position.side.to_string(),
                position.entry_price,
                position.quantity,
                position.leverage,
                position.current_price,
                position.liquidation_price,
                position.unrealised_pnl,
                position.realised_pnl,
                position.stop_loss,
                position.take_profit,
                position.entry_order_id,
                position.sl_order_id,
                position.tp_order_id,
                position.opened_at.to_rfc3339(),
                position.market_state,
                position.strategy_type.to_string(),
                position.signal_strength,
                position.opportunity_score,
                position.entry_stop_loss,
                position.metadata.to_string(),
            ],
        )?;

        insert_trade_inner(&tx, entry_trade)?;
        for order in price_orders {
            insert_price_order_inner(&tx, order)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Atomically close a position in full: delete the row, append the close
    /// event and close trade, and cancel its price-order rows.
    pub fn close_position_tx(
        &self,
        symbol: &str,
        side: Side,
        event: &CloseEvent,
        close_trade: &TradeRecord,
    ) -> StoreResult<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;

        let deleted = tx.execute(
            "DELETE FROM positions WHERE symbol = ?1 AND side = ?2",
            params![symbol, side.to_string()],
        )?;
        if deleted == 0 {
            return Err(StoreError::Consistency(format!(
                "close of {symbol}/{side} found no position row"
            )));
        }

        insert_close_event_inner(&tx, event)?;
        insert_trade_inner(&tx, close_trade)?;
        tx.execute(
            "UPDATE price_orders SET status = 'cancelled', updated_at = ?3
             WHERE symbol = ?1 AND side = ?2 AND status = 'active'",
            params![symbol, side.to_string(), Utc::now().to_rfc3339()],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_open_positions(&self) -> StoreResult<Vec<PositionRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM positions ORDER BY opened_at")?;
        let rows = stmt
            .query_map([], position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_position(&self, symbol: &str, side: Side) -> StoreResult<Option<PositionRecord>> {
        let conn = self.lock_conn();
        let found = conn
            .query_row(
                "SELECT * FROM positions WHERE symbol = ?1 AND side = ?2",
                params![symbol, side.to_string()],
                position_from_row,
            )
            .optional()?;
        Ok(found)
    }

    /// Shrink quantity and accumulate realised PnL after a partial close.
    pub fn apply_partial_close(
        &self,
        symbol: &str,
        side: Side,
        closed_quantity: f64,
        realised_delta: f64,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE positions
             SET quantity = quantity - ?3, realised_pnl = realised_pnl + ?4
             WHERE symbol = ?1 AND side = ?2",
            params![symbol, side.to_string(), closed_quantity, realised_delta],
        )?;
        if changed == 0 {
            return Err(StoreError::Consistency(format!(
                "partial close of {symbol}/{side} found no position row"
            )));
        }
        Ok(())
    }

    /// Move the stop (and optionally its exchange order id). Never validates
    /// direction — that is the stop engine's job before calling this.
    pub fn update_position_stop(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: f64,
        sl_order_id: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE positions SET stop_loss = ?3, sl_order_id = COALESCE(?4, sl_order_id)
             WHERE symbol = ?1 AND side = ?2",
            params![symbol, side.to_string(), stop_loss, sl_order_id],
        )?;
        Ok(())
    }

    pub fn update_position_mark(
        &self,
        symbol: &str,
        side: Side,
        current_price: f64,
        unrealised_pnl: f64,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE positions SET current_price = ?3, unrealised_pnl = ?4
             WHERE symbol = ?1 AND side = ?2",
            params![symbol, side.to_string(), current_price, unrealised_pnl],
        )?;
        Ok(())
    }

    /// Record the protective order ids after (re)registration.
    pub fn update_protective_order_ids(
        &self,
        symbol: &str,
        side: Side,
        sl_order_id: Option<&str>,
        tp_order_id: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE positions SET sl_order_id = ?3, tp_order_id = ?4
             WHERE symbol = ?1 AND side = ?2",
            params![symbol, side.to_string(), sl_order_id, tp_order_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Trades
    // =========================================================================

    pub fn insert_trade(&self, trade: &TradeRecord) -> StoreResult<()> {
        let conn = self.lock_conn();
        insert_trade_inner(&conn, trade)
    }

    // =========================================================================
    // Price orders
    // =========================================================================

    pub fn insert_price_order(&self, order: &PriceOrderRecord) -> StoreResult<()> {
        let conn = self.lock_conn();
        insert_price_order_inner(&conn, order)
    }

    pub fn set_price_order_status(
        &self,
        order_id: &str,
        status: PriceOrderStatus,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE price_orders SET status = ?2, updated_at = ?3 WHERE order_id = ?1",
            params![order_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Cancel all active price-order rows for a `(symbol, side)` pair.
    pub fn cancel_price_orders(&self, symbol: &str, side: Side) -> StoreResult<u32> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE price_orders SET status = 'cancelled', updated_at = ?3
             WHERE symbol = ?1 AND side = ?2 AND status = 'active'",
            params![symbol, side.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed as u32)
    }

    pub fn active_price_orders(&self, symbol: Option<&str>) -> StoreResult<Vec<PriceOrderRecord>> {
        let conn = self.lock_conn();
        let mut out = Vec::new();
        match symbol {
            Some(sym) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM price_orders WHERE status = 'active' AND symbol = ?1",
                )?;
                let rows = stmt.query_map(params![sym], price_order_from_row)?;
                for r in rows {
                    out.push(r?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM price_orders WHERE status = 'active'")?;
                let rows = stmt.query_map([], price_order_from_row)?;
                for r in rows {
                    out.push(r?);
                }
            }
        }
        Ok(out)
    }

    /// Startup integrity check: active price-orders with no matching open
    /// position. Returned for exchange-side cancellation; their rows are
    /// marked cancelled here.
    pub fn orphan_price_orders(&self) -> StoreResult<Vec<PriceOrderRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM price_orders po WHERE status = 'active' AND NOT EXISTS (
                 SELECT 1 FROM positions p WHERE p.symbol = po.symbol AND p.side = po.side
             )",
        )?;
        let orphans = stmt
            .query_map([], price_order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        for orphan in &orphans {
            warn!(
                order_id = %orphan.order_id,
                symbol = %orphan.symbol,
                "orphan price-order detected — cancelling row"
            );
            conn.execute(
                "UPDATE price_orders SET status = 'cancelled', updated_at = ?2 WHERE order_id = ?1",
                params![orphan.order_id, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(orphans)
    }

    // =========================================================================
    // Close events
    // =========================================================================

    pub fn insert_close_event(&self, event: &CloseEvent) -> StoreResult<i64> {
        let conn = self.lock_conn();
        insert_close_event_inner(&conn, event)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn unprocessed_close_events(&self, limit: u32) -> StoreResult<Vec<CloseEvent>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM position_close_events WHERE processed = 0
             ORDER BY created_at LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], close_event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_close_event_processed(&self, id: i64) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE position_close_events SET processed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Partial take-profit history
    // =========================================================================

    pub fn insert_partial_tp(&self, record: &PartialTpRecord) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO partial_take_profit_history
             (symbol, side, stage, trigger_price, closed_quantity, pnl, order_id, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                record.symbol,
                record.side.to_string(),
                record.stage,
                record.trigger_price,
                record.closed_quantity,
                record.pnl,
                record.order_id,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Has this stage already executed during the current position lifetime?
    pub fn has_partial_tp_since(
        &self,
        symbol: &str,
        side: Side,
        stage: u8,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM partial_take_profit_history
                 WHERE symbol = ?1 AND side = ?2 AND stage = ?3 AND timestamp >= ?4
             )",
            params![symbol, side.to_string(), stage, since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    /// Stages already executed for the position lifetime, ascending.
    pub fn executed_stages_since(
        &self,
        symbol: &str,
        side: Side,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<u8>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT stage FROM partial_take_profit_history
             WHERE symbol = ?1 AND side = ?2 AND timestamp >= ?3 ORDER BY stage",
        )?;
        let rows = stmt
            .query_map(params![symbol, side.to_string(), since.to_rfc3339()], |r| {
                r.get::<_, u8>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Account history & equity curve
    // =========================================================================

    pub fn record_account_snapshot(&self, snap: &AccountSnapshotRow) -> StoreResult<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO account_history
             (timestamp, total_value, available_cash, unrealized_pnl, realized_pnl, return_percent)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                snap.timestamp.to_rfc3339(),
                snap.total_value,
                snap.available_cash,
                snap.unrealized_pnl,
                snap.realized_pnl,
                snap.return_percent,
            ],
        )?;
        Ok(())
    }

    /// Append an equity point, deriving peak/drawdown from the stored peak.
    pub fn append_equity_point(
        &self,
        timestamp: DateTime<Utc>,
        equity: f64,
    ) -> StoreResult<EquityPoint> {
        let conn = self.lock_conn();
        let prev_peak: Option<f64> = conn
            .query_row(
                "SELECT peak_equity FROM equity_curve ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let prev_peak = prev_peak.unwrap_or(equity);
        let is_new_peak = equity > prev_peak;
        let peak = prev_peak.max(equity);
        let drawdown_value = (peak - equity).max(0.0);
        let drawdown_pct = if peak > 0.0 { drawdown_value / peak * 100.0 } else { 0.0 };

        conn.execute(
            "INSERT INTO equity_curve
             (timestamp, equity, peak_equity, drawdown_pct, drawdown_value, is_new_peak)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                timestamp.to_rfc3339(),
                equity,
                peak,
                drawdown_pct,
                drawdown_value,
                is_new_peak,
            ],
        )?;

        Ok(EquityPoint {
            timestamp,
            equity,
            peak_equity: peak,
            drawdown_pct,
            drawdown_value,
            is_new_peak,
        })
    }

    pub fn latest_equity_point(&self) -> StoreResult<Option<EquityPoint>> {
        let conn = self.lock_conn();
        let point = conn
            .query_row(
                "SELECT timestamp, equity, peak_equity, drawdown_pct, drawdown_value, is_new_peak
                 FROM equity_curve ORDER BY id DESC LIMIT 1",
                [],
                |r| {
                    Ok(EquityPoint {
                        timestamp: parse_ts(r.get::<_, String>(0)?),
                        equity: r.get(1)?,
                        peak_equity: r.get(2)?,
                        drawdown_pct: r.get(3)?,
                        drawdown_value: r.get(4)?,
                        is_new_peak: r.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(point)
    }
}

// =============================================================================
// Row mapping & shared inserts
// =============================================================================

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_side(s: String) -> Side {
    Side::parse(&s).unwrap_or(Side::Long)
}

fn parse_strategy(s: &str) -> StrategyKind {
    match s {
        "trend_following" => StrategyKind::TrendFollowing,
        "mean_reversion" => StrategyKind::MeanReversion,
        "breakout" => StrategyKind::Breakout,
        _ => StrategyKind::None,
    }
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRecord> {
    Ok(PositionRecord {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        exchange: row.get("exchange")?,
        side: parse_side(row.get("side")?),
        entry_price: row.get("entry_price")?,
        quantity: row.get("quantity")?,
        leverage: row.get("leverage")?,
        current_price: row.get("current_price")?,
        liquidation_price: row.get("liquidation_price")?,
        unrealised_pnl: row.get("unrealised_pnl")?,
        realised_pnl: row.get("realised_pnl")?,
        stop_loss: row.get("stop_loss")?,
        take_profit: row.get("take_profit")?,
        entry_order_id: row.get("entry_order_id")?,
        sl_order_id: row.get("sl_order_id")?,
        tp_order_id: row.get("tp_order_id")?,
        opened_at: parse_ts(row.get("opened_at")?),
        market_state: row.get("market_state")?,
        strategy_type: parse_strategy(&row.get::<_, String>("strategy_type")?),
        signal_strength: row.get("signal_strength")?,
        opportunity_score: row.get("opportunity_score")?,
        entry_stop_loss: row.get("entry_stop_loss")?,
        metadata: serde_json::from_str(&row.get::<_, String>("metadata")?)
            .unwrap_or(serde_json::Value::Null),
    })
}

fn price_order_from_row(row: &Row<'_>) -> rusqlite::Result<PriceOrderRecord> {
    let kind = match row.get::<_, String>("kind")?.as_str() {
        "take_profit" => PriceOrderKind::TakeProfit,
        _ => PriceOrderKind::StopLoss,
    };
    Ok(PriceOrderRecord {
        order_id: row.get("order_id")?,
        position_order_id: row.get("position_order_id")?,
        symbol: row.get("symbol")?,
        side: parse_side(row.get("side")?),
        kind,
        trigger_price: row.get("trigger_price")?,
        order_price: row.get("order_price")?,
        quantity: row.get("quantity")?,
        status: PriceOrderStatus::parse(&row.get::<_, String>("status")?)
            .unwrap_or(PriceOrderStatus::Cancelled),
        created_at: parse_ts(row.get("created_at")?),
        updated_at: parse_ts(row.get("updated_at")?),
    })
}

fn close_event_from_row(row: &Row<'_>) -> rusqlite::Result<CloseEvent> {
    Ok(CloseEvent {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        side: parse_side(row.get("side")?),
        close_reason: row.get("close_reason")?,
        trigger_type: row.get("trigger_type")?,
        close_price: row.get("close_price")?,
        entry_price: row.get("entry_price")?,
        quantity: row.get("quantity")?,
        leverage: row.get("leverage")?,
        pnl: row.get("pnl")?,
        pnl_percent: row.get("pnl_percent")?,
        fee: row.get("fee")?,
        position_order_id: row.get("position_order_id")?,
        trigger_order_id: row.get("trigger_order_id")?,
        created_at: parse_ts(row.get("created_at")?),
        processed: row.get("processed")?,
    })
}

fn insert_trade_inner(conn: &Connection, trade: &TradeRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO trades
         (order_id, symbol, side, kind, price, quantity, leverage, fee, pnl, r_multiple,
          strategy_name, timestamp, status)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        params![
            trade.order_id,
            trade.symbol,
            trade.side.to_string(),
            trade.kind.as_str(),
            trade.price,
            trade.quantity,
            trade.leverage,
            trade.fee,
            trade.pnl,
            trade.r_multiple,
            trade.strategy_name,
            trade.timestamp.to_rfc3339(),
            trade.status,
        ],
    )?;
    Ok(())
}

fn insert_price_order_inner(conn: &Connection, order: &PriceOrderRecord) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO price_orders
         (order_id, position_order_id, symbol, side, kind, trigger_price, order_price,
          quantity, status, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            order.order_id,
            order.position_order_id,
            order.symbol,
            order.side.to_string(),
            order.kind.to_string(),
            order.trigger_price,
            order.order_price,
            order.quantity,
            order.status.as_str(),
            order.created_at.to_rfc3339(),
            order.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_close_event_inner(conn: &Connection, event: &CloseEvent) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO position_close_events
         (symbol, side, close_reason, trigger_type, close_price, entry_price, quantity,
          leverage, pnl, pnl_percent, fee, position_order_id, trigger_order_id, created_at,
          processed)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        params![
            event.symbol,
            event.side.to_string(),
            event.close_reason,
            event.trigger_type,
            event.close_price,
            event.entry_price,
            event.quantity,
            event.leverage,
            event.pnl,
            event.pnl_percent,
            event.fee,
            event.position_order_id,
            event.trigger_order_id,
            event.created_at.to_rfc3339(),
            event.processed,
        ],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceOrderKind;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn position(symbol: &str, side: Side) -> PositionRecord {
        PositionRecord {
            id: format!("pos-{symbol}-{side}"),
            symbol: symbol.into(),
            exchange: "linear".into(),
            side,
            entry_price: 3000.0,
            quantity: 2.0,
            leverage: 8.0,
            current_price: 3000.0,
            liquidation_price: 2600.0,
            unrealised_pnl: 0.0,
            realised_pnl: 0.0,
            stop_loss: 2952.0,
            take_profit: 3240.0,
            entry_order_id: format!("entry-{symbol}"),
            sl_order_id: Some("sl-1".into()),
            tp_order_id: Some("tp-1".into()),
            opened_at: Utc::now(),
            market_state: "uptrend_continuation".into(),
            strategy_type: StrategyKind::TrendFollowing,
            signal_strength: 0.7,
            opportunity_score: 72.0,
            entry_stop_loss: 2952.0,
            metadata: serde_json::json!({"note": "test"}),
        }
    }

    fn trade(symbol: &str, kind: TradeKind) -> TradeRecord {
        TradeRecord {
            order_id: format!("trade-{symbol}-{}", kind.as_str()),
            symbol: symbol.into(),
            side: Side::Long,
            kind,
            price: 3000.0,
            quantity: 2.0,
            leverage: 8.0,
            fee: 1.2,
            pnl: None,
            r_multiple: None,
            strategy_name: Some("trend_following".into()),
            timestamp: Utc::now(),
            status: "filled".into(),
        }
    }

    fn price_order(symbol: &str, order_id: &str, kind: PriceOrderKind) -> PriceOrderRecord {
        PriceOrderRecord {
            order_id: order_id.into(),
            position_order_id: format!("entry-{symbol}"),
            symbol: symbol.into(),
            side: Side::Long,
            kind,
            trigger_price: 2952.0,
            order_price: 0.0,
            quantity: 2.0,
            status: PriceOrderStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn close_event(symbol: &str, reason: &str) -> CloseEvent {
        CloseEvent {
            id: 0,
            symbol: symbol.into(),
            side: Side::Long,
            close_reason: reason.into(),
            trigger_type: "market".into(),
            close_price: 3050.0,
            entry_price: 3000.0,
            quantity: 2.0,
            leverage: 8.0,
            pnl: 100.0,
            pnl_percent: 1.66,
            fee: 1.0,
            position_order_id: format!("entry-{symbol}"),
            trigger_order_id: None,
            created_at: Utc::now(),
            processed: false,
        }
    }

    #[test]
    fn open_position_tx_persists_everything() {
        let s = store();
        s.open_position_tx(
            &position("ETH", Side::Long),
            &trade("ETH", TradeKind::Open),
            &[
                price_order("ETH", "sl-1", PriceOrderKind::StopLoss),
                price_order("ETH", "tp-1", PriceOrderKind::TakeProfit),
            ],
        )
        .unwrap();

        let open = s.get_open_positions().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "ETH");
        assert_eq!(open[0].strategy_type, StrategyKind::TrendFollowing);
        assert!((open[0].entry_stop_loss - 2952.0).abs() < 1e-9);

        let orders = s.active_price_orders(Some("ETH")).unwrap();
        assert_eq!(orders.len(), 2);
    }

    #[test]
    fn duplicate_symbol_side_rejected() {
        let s = store();
        s.open_position_tx(&position("ETH", Side::Long), &trade("ETH", TradeKind::Open), &[])
            .unwrap();
        let err = s.open_position_tx(
            &{
                let mut p = position("ETH", Side::Long);
                p.id = "other-id".into();
                p
            },
            &trade("ETH", TradeKind::Open),
            &[],
        );
        assert!(err.is_err());
        // Short side on the same symbol remains allowed.
        s.open_position_tx(&position("ETH", Side::Short), &trade("ETH", TradeKind::Open), &[])
            .unwrap();
    }

    #[test]
    fn close_position_tx_full_lifecycle() {
        let s = store();
        s.open_position_tx(
            &position("ETH", Side::Long),
            &trade("ETH", TradeKind::Open),
            &[price_order("ETH", "sl-1", PriceOrderKind::StopLoss)],
        )
        .unwrap();

        s.close_position_tx(
            "ETH",
            Side::Long,
            &close_event("ETH", "reversal_monitor_emergency_by_monitor"),
            &trade("ETH", TradeKind::Close),
        )
        .unwrap();

        assert!(s.get_open_positions().unwrap().is_empty());
        assert!(s.active_price_orders(Some("ETH")).unwrap().is_empty());

        let events = s.unprocessed_close_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].close_reason.contains("reversal"));
    }

    #[test]
    fn close_without_position_is_consistency_error() {
        let s = store();
        let err = s.close_position_tx(
            "ETH",
            Side::Long,
            &close_event("ETH", "manual"),
            &trade("ETH", TradeKind::Close),
        );
        assert!(matches!(err, Err(StoreError::Consistency(_))));
    }

    #[test]
    fn partial_close_updates_quantity_and_pnl() {
        let s = store();
        s.open_position_tx(&position("ETH", Side::Long), &trade("ETH", TradeKind::Open), &[])
            .unwrap();
        s.apply_partial_close("ETH", Side::Long, 0.66, 31.68).unwrap();

        let p = s.get_position("ETH", Side::Long).unwrap().unwrap();
        assert!((p.quantity - 1.34).abs() < 1e-9);
        assert!((p.realised_pnl - 31.68).abs() < 1e-9);
    }

    #[test]
    fn partial_tp_stage_guard() {
        let s = store();
        let opened_at = Utc::now() - chrono::Duration::minutes(5);
        assert!(!s.has_partial_tp_since("ETH", Side::Long, 1, opened_at).unwrap());

        s.insert_partial_tp(&PartialTpRecord {
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

        assert!(s.has_partial_tp_since("ETH", Side::Long, 1, opened_at).unwrap());
        assert!(!s.has_partial_tp_since("ETH", Side::Long, 2, opened_at).unwrap());
        assert_eq!(s.executed_stages_since("ETH", Side::Long, opened_at).unwrap(), vec![1]);

        // A record from a previous lifetime does not count.
        let future = Utc::now() + chrono::Duration::minutes(1);
        assert!(!s.has_partial_tp_since("ETH", Side::Long, 1, future).unwrap());
    }

    #[test]
    fn orphan_price_orders_detected_and_cancelled() {
        let s = store();
        s.insert_price_order(&price_order("ETH", "sl-orphan", PriceOrderKind::StopLoss))
            .unwrap();
        let orphans = s.orphan_price_orders().unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].order_id, "sl-orphan");
        assert!(s.active_price_orders(None).unwrap().is_empty());
        // Idempotent: second run finds nothing.
        assert!(s.orphan_price_orders().unwrap().is_empty());
    }

    #[test]
    fn equity_curve_peak_is_monotonic() {
        let s = store();
        let t = Utc::now();

        let p1 = s.append_equity_point(t, 1000.0).unwrap();
        assert!(!p1.is_new_peak);
        assert_eq!(p1.peak_equity, 1000.0);

        let p2 = s.append_equity_point(t, 1100.0).unwrap();
        assert!(p2.is_new_peak);
        assert_eq!(p2.peak_equity, 1100.0);

        let p3 = s.append_equity_point(t, 900.0).unwrap();
        assert!(!p3.is_new_peak);
        assert_eq!(p3.peak_equity, 1100.0);
        assert!((p3.drawdown_value - 200.0).abs() < 1e-9);
        assert!((p3.drawdown_pct - 200.0 / 1100.0 * 100.0).abs() < 1e-9);

        let latest = s.latest_equity_point().unwrap().unwrap();
        assert_eq!(latest.peak_equity, 1100.0);
    }

    #[test]
    fn account_seed_only_once() {
        let s = store();
        s.seed_account(1000.0).unwrap();
        s.seed_account(2000.0).unwrap();
        let conn = s.lock_conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM account_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
