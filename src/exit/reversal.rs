// =============================================================================
// Reversal monitor — multi-timeframe trend decay scoring + protective close
// =============================================================================
//
// Per open position, each monitor pass:
//   1. refreshes the three-timeframe indicators and trend scores, appending
//      to the rolling history;
//   2. grades each frame against its previous score: weakening (|cur| <
//      0.8·|prev|, severity = (1 - |cur|/|prev|)·100), hard reversal (adverse
//      sign cross or a 40-point adverse jump), or entry into the ranging zone;
//   3. folds the frames and any MACD/RSI divergence into a 0–100 reversal
//      score (primary 40, confirm 25, filter 15, divergences up to 10 each);
//   4. maps the score onto a tier:  <30 hold, 30–50 early warning, 50–70
//      advisory close (signalled, never executed here), >=70 emergency close
//      executed under the `reversal_close_{symbol}_{side}` lock and the
//      30-second recent-close suppressor.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TradingStrategy;
use crate::exchange::{ExchangeAdapter, OrderRequest};
use crate::exit::divergence::{self, MIN_STRENGTH};
use crate::indicators::TimeframeIndicators;
use crate::market::Candle;
use crate::regime::classifier::{calculate_trend_score, TrendScores};
use crate::regime::RegimeClassifier;
use crate::store::lock::{reversal_close_key, RECENT_CLOSE_WINDOW_SECS};
use crate::store::records::{CloseEvent, PositionRecord, TradeKind, TradeRecord};
use crate::store::Store;
use crate::types::Side;

/// Candles fetched per frame for indicator refresh.
const CANDLE_LIMIT: u32 = 100;

/// Weakening below 80 % of the previous magnitude counts.
const WEAKENING_RATIO: f64 = 0.8;

/// Adverse jump size that counts as a hard reversal.
const REVERSAL_JUMP: f64 = 40.0;

/// |score| below this is the ranging zone.
const RANGING_ZONE: f64 = 15.0;

/// Close reasons that arm the recent-close suppressor.
const GUARD_REASONS: [&str; 2] = ["partial_close", "reversal"];

/// What the monitor recommends for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalTier {
    Hold,
    EarlyWarning,
    AdvisoryClose,
    EmergencyClose,
}

impl ReversalTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 70.0 {
            Self::EmergencyClose
        } else if score >= 50.0 {
            Self::AdvisoryClose
        } else if score >= 30.0 {
            Self::EarlyWarning
        } else {
            Self::Hold
        }
    }
}

/// How one frame's trend score moved against the position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameChange {
    pub previous: f64,
    pub current: f64,
    pub weakening: bool,
    /// 0-100, only meaningful when `weakening`.
    pub severity: f64,
    pub reversed: bool,
    pub entered_ranging: bool,
}

/// Full assessment for one position on one pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReversalAssessment {
    pub symbol: String,
    pub side: Side,
    pub score: f64,
    pub tier: ReversalTier,
    pub early_warning: bool,
    pub primary: FrameChange,
    pub confirm: FrameChange,
    pub filter: FrameChange,
    pub macd_divergence: Option<u8>,
    pub rsi_divergence: Option<u8>,
}

// =============================================================================
// Pure scoring
// =============================================================================

/// Grade one frame's score transition for a position of `side`.
pub fn assess_frame(previous: f64, current: f64, side: Side) -> FrameChange {
    let favourable = side.sign();

    // Hard reversal: the score crossed from favourable to adverse, or jumped
    // at least 40 points against the position.
    let crossed = previous * favourable > 0.0 && current * favourable < 0.0;
    let adverse_jump = (previous - current) * favourable >= REVERSAL_JUMP;
    let reversed = crossed || adverse_jump;

    let (weakening, severity) = if previous.abs() > 0.0 && current.abs() < WEAKENING_RATIO * previous.abs()
    {
        (true, ((1.0 - current.abs() / previous.abs()) * 100.0).round())
    } else {
        (false, 0.0)
    };

    FrameChange {
        previous,
        current,
        weakening,
        severity,
        reversed,
        entered_ranging: previous.abs() >= RANGING_ZONE && current.abs() < RANGING_ZONE,
    }
}

fn frame_points(change: &FrameChange, full: f64, weak: f64, ranging: f64) -> f64 {
    if change.reversed {
        full
    } else if change.weakening && change.severity >= 50.0 {
        weak
    } else if change.entered_ranging {
        ranging
    } else {
        0.0
    }
}

/// Fold the three frames and the divergences into the 0–100 reversal score.
pub fn reversal_score(
    primary: &FrameChange,
    confirm: &FrameChange,
    filter: &FrameChange,
    macd_divergence: Option<u8>,
    rsi_divergence: Option<u8>,
) -> f64 {
    let mut score = 0.0;
    score += frame_points(primary, 40.0, 20.0, 12.0);
    score += frame_points(confirm, 25.0, 12.0, 8.0);
    score += frame_points(filter, 15.0, 8.0, 5.0);

    if macd_divergence.is_some_and(|s| s >= MIN_STRENGTH) {
        score += 10.0;
    }
    if rsi_divergence.is_some_and(|s| s >= MIN_STRENGTH) {
        score += 10.0;
    }

    score.clamp(0.0, 100.0)
}

/// Two or more frames weakening past 40 %, two or more reversed, or any
/// divergence at all.
pub fn early_warning(
    primary: &FrameChange,
    confirm: &FrameChange,
    filter: &FrameChange,
    macd_divergence: Option<u8>,
    rsi_divergence: Option<u8>,
) -> bool {
    let frames = [primary, confirm, filter];
    let weakening_hard = frames
        .iter()
        .filter(|f| f.weakening && f.severity > 40.0)
        .count();
    let reversed = frames.iter().filter(|f| f.reversed).count();
    weakening_hard >= 2 || reversed >= 2 || macd_divergence.is_some() || rsi_divergence.is_some()
}

// =============================================================================
// Monitor
// =============================================================================

pub struct ReversalMonitor {
    store: Store,
    adapter: Arc<dyn ExchangeAdapter>,
    classifier: Arc<RegimeClassifier>,
    strategy: TradingStrategy,
    holder: String,
    /// Name recorded in emergency close reasons.
    caller: String,
}

impl ReversalMonitor {
    pub fn new(
        store: Store,
        adapter: Arc<dyn ExchangeAdapter>,
        classifier: Arc<RegimeClassifier>,
        strategy: TradingStrategy,
        holder: String,
        caller: impl Into<String>,
    ) -> Self {
        Self {
            store,
            adapter,
            classifier,
            strategy,
            holder,
            caller: caller.into(),
        }
    }

    /// Assess one position; executes an emergency close when warranted.
    pub async fn process_position(
        &self,
        position: &PositionRecord,
    ) -> Option<ReversalAssessment> {
        let contract = self.adapter.normalize_symbol(&position.symbol);
        let (primary_iv, confirm_iv, filter_iv) = self.strategy.timeframes();

        let primary_candles = self.fetch(&contract, primary_iv).await?;
        let confirm_candles = self.fetch(&contract, confirm_iv).await?;
        let filter_candles = self.fetch(&contract, filter_iv).await?;

        let primary = TimeframeIndicators::compute(&primary_candles);
        let confirm = TimeframeIndicators::compute(&confirm_candles);
        let filter = TimeframeIndicators::compute(&filter_candles);

        let current = TrendScores {
            primary: calculate_trend_score(&primary),
            confirm: calculate_trend_score(&confirm),
            filter: calculate_trend_score(&filter),
        };
        let previous = self.classifier.history.latest(&position.symbol);
        self.classifier.history.push(&position.symbol, current);

        let Some(previous) = previous else {
            debug!(symbol = %position.symbol, "no trend-score history yet — holding");
            return None;
        };

        let assessment = self.assess(position, &previous, &current, &primary_candles);

        match assessment.tier {
            ReversalTier::Hold => {}
            ReversalTier::EarlyWarning => {
                debug!(
                    symbol = %position.symbol,
                    score = assessment.score,
                    "reversal early warning"
                );
            }
            ReversalTier::AdvisoryClose => {
                // Signalled upward (close events / agent layer), never
                // executed by the monitor itself.
                info!(
                    symbol = %position.symbol,
                    side = %position.side,
                    score = assessment.score,
                    "reversal advisory — close recommended"
                );
            }
            ReversalTier::EmergencyClose => {
                self.emergency_close(position, &assessment).await;
            }
        }

        Some(assessment)
    }

    fn assess(
        &self,
        position: &PositionRecord,
        previous: &TrendScores,
        current: &TrendScores,
        primary_candles: &[Candle],
    ) -> ReversalAssessment {
        let side = position.side;
        let primary = assess_frame(previous.primary, current.primary, side);
        let confirm = assess_frame(previous.confirm, current.confirm, side);
        let filter = assess_frame(previous.filter, current.filter, side);

        let macd_div = divergence::detect_macd_divergence(primary_candles, side).map(|d| d.strength);
        let rsi_div = divergence::detect_rsi_divergence(primary_candles, side).map(|d| d.strength);

        let score = reversal_score(&primary, &confirm, &filter, macd_div, rsi_div);
        let tier = ReversalTier::from_score(score);
        let warning = early_warning(&primary, &confirm, &filter, macd_div, rsi_div);

        debug!(
            symbol = %position.symbol,
            side = %side,
            score,
            tier = ?tier,
            primary_prev = previous.primary,
            primary_now = current.primary,
            confirm_prev = previous.confirm,
            confirm_now = current.confirm,
            macd_div = ?macd_div,
            rsi_div = ?rsi_div,
            "reversal assessed"
        );

        ReversalAssessment {
            symbol: position.symbol.clone(),
            side,
            score,
            tier,
            early_warning: warning,
            primary,
            confirm,
            filter,
            macd_divergence: macd_div,
            rsi_divergence: rsi_div,
        }
    }

    /// Market-close the entire remaining quantity under the reversal lock.
    async fn emergency_close(&self, position: &PositionRecord, assessment: &ReversalAssessment) {
        let symbol = &position.symbol;
        let side = position.side;

        match self
            .store
            .has_recent_close(symbol, side, RECENT_CLOSE_WINDOW_SECS, &GUARD_REASONS)
        {
            Ok(true) => {
                debug!(symbol, "recent close within suppressor window — skipping emergency close");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(symbol, error = %e, "recent-close suppressor check failed");
                return;
            }
        }

        let key = reversal_close_key(symbol, side);
        match self.store.try_acquire_lock(&key, &self.holder) {
            Ok(true) => {}
            Ok(false) => {
                debug!(symbol, "reversal close lock held elsewhere — skipping");
                return;
            }
            Err(e) => {
                warn!(symbol, error = %e, "reversal lock acquisition failed");
                return;
            }
        }

        let result = self.emergency_close_locked(position, assessment).await;
        if let Err(e) = self.store.release_lock(&key, &self.holder) {
            warn!(key, error = %e, "failed to release reversal lock");
        }
        if let Err(e) = result {
            // The position stays intact; the next pass re-evaluates.
            warn!(symbol, error = %e, "emergency close failed — position left intact");
        }
    }

    async fn emergency_close_locked(
        &self,
        position: &PositionRecord,
        assessment: &ReversalAssessment,
    ) -> anyhow::Result<()> {
        let symbol = &position.symbol;
        let side = position.side;

        // Re-verify under the lock.
        let live = match self.store.get_position(symbol, side)? {
            Some(p) => p,
            None => return Ok(()),
        };

        let contract = self.adapter.normalize_symbol(symbol);
        let info = self.adapter.contract_info(&contract).await?;
        let request = OrderRequest::market_close(&contract, side, live.quantity);
        let order = self.adapter.place_order(&request).await?;

        let fill_price = order.avg_fill_price.unwrap_or(live.current_price);
        let pnl = self
            .adapter
            .pnl(&info, live.entry_price, fill_price, live.quantity, side);
        let now = Utc::now();

        self.store.close_position_tx(
            symbol,
            side,
            &CloseEvent {
                id: 0,
                symbol: symbol.clone(),
                side,
                close_reason: format!("reversal_monitor_emergency_by_{}", self.caller),
                trigger_type: "reversal_score".to_string(),
                close_price: fill_price,
                entry_price: live.entry_price,
                quantity: live.quantity,
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
            },
            &TradeRecord {
                order_id: order.order_id.clone(),
                symbol: symbol.clone(),
                side,
                kind: TradeKind::Close,
                price: fill_price,
                quantity: live.quantity,
                leverage: live.leverage,
                fee: 0.0,
                pnl: Some(pnl),
                r_multiple: (live.r_unit() > 0.0)
                    .then(|| side.sign() * (fill_price - live.entry_price) / live.r_unit()),
                strategy_name: Some(live.strategy_type.to_string()),
                timestamp: now,
                status: "filled".to_string(),
            },
        )?;

        // Exchange-side protective orders must not survive the position.
        if let Err(e) = self.adapter.cancel_position_stop_loss(&contract).await {
            warn!(symbol, error = %e, "protective order cancellation failed after emergency close");
        }
        self.classifier.history.clear(symbol);

        info!(
            symbol,
            side = %side,
            score = assessment.score,
            fill_price,
            pnl = format!("{:.4}", pnl),
            "reversal emergency close executed"
        );
        Ok(())
    }

    async fn fetch(&self, contract: &str, interval: crate::market::Interval) -> Option<Vec<Candle>> {
        match self.adapter.candles(contract, interval, CANDLE_LIMIT).await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(contract, interval = %interval, error = %e, "candle fetch failed in reversal monitor");
                None
            }
        }
    }
}
