// =============================================================================
// Agent tool surface — the calls the reasoning layer consumes
// =============================================================================
//
// Thin, serialisable request/response wrappers over the engine's subsystems.
// The reasoning layer itself lives outside this crate; these calls are also
// mirrored over the JSON API in `api::rest`.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::TradingEngine;
use crate::exit::partial_tp::ExecutableStage;
use crate::exit::StageOutcome;
use crate::market::Interval;
use crate::scoring::OpportunityScorer;
use crate::stop_loss::{StopLossResult, TrailingDecision};
use crate::types::{Action, ConfidenceTier, Side, StrategyKind};

/// Candles fetched for tool-initiated stop computations.
const TOOL_CANDLE_LIMIT: u32 = 100;

/// Shared context handed to every tool call.
#[derive(Clone)]
pub struct ToolContext {
    pub engine: Arc<TradingEngine>,
}

// =============================================================================
// analyze_opening_opportunities
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzeParams {
    pub symbols: Option<Vec<String>>,
    pub min_score: Option<f64>,
    pub max_results: Option<usize>,
    pub include_open_positions: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpportunityReport {
    pub symbol: String,
    pub score: u32,
    pub action: Action,
    pub strategy_type: StrategyKind,
    pub signal_strength: f64,
    pub recommended_leverage: f64,
    pub regime: String,
    pub confidence: ConfidenceTier,
    pub recommendation: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterInfo {
    pub min_score: f64,
    pub max_results: usize,
    pub include_open_positions: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketSummary {
    pub bullish: usize,
    pub bearish: usize,
    pub neutral: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub total_analyzed: usize,
    pub opportunities_found: usize,
    pub top_opportunities: Vec<OpportunityReport>,
    pub filter_info: FilterInfo,
    pub market_summary: MarketSummary,
    pub timestamp: String,
}

// =============================================================================
// calculate_stop_loss / check_open_position / update_trailing_stop
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct StopLossParams {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub timeframe: Option<Interval>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOpenResponse {
    pub should_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StopLossResult>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailingParams {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub current_price: f64,
    pub current_stop_loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrailingResponse {
    pub should_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_stop_loss: Option<f64>,
    pub reason: String,
}

// =============================================================================
// partial take-profit tools
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SymbolTpOpportunities {
    pub symbol: String,
    pub side: Side,
    pub current_price: f64,
    pub executable_stages: Vec<ExecutableStage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartialTpCheckResponse {
    pub success: bool,
    pub positions: Vec<SymbolTpOpportunities>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartialTpParams {
    pub symbol: String,
    pub stage: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartialTpResponse {
    pub success: bool,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_quantity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
}

// =============================================================================
// Implementation
// =============================================================================

impl ToolContext {
    pub fn new(engine: Arc<TradingEngine>) -> Self {
        Self { engine }
    }

    /// Scan the watch-list (or a provided subset) and rank the openings.
    pub async fn analyze_opening_opportunities(&self, params: AnalyzeParams) -> AnalyzeResponse {
        let engine = &self.engine;
        let symbols = params
            .symbols
            .unwrap_or_else(|| engine.settings.symbols.clone());
        let min_score = params.min_score.unwrap_or(engine.settings.min_opportunity_score);
        let max_results = params
            .max_results
            .unwrap_or(engine.settings.max_opportunities_to_show);
        let include_open = params.include_open_positions.unwrap_or(false);

        let evaluations: Vec<_> = join_all(
            symbols
                .iter()
                .map(|s| engine.evaluate_symbol(s.to_uppercase())),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        let mut summary = MarketSummary {
            bullish: 0,
            bearish: 0,
            neutral: 0,
        };
        for e in &evaluations {
            match e.analysis.regime.bias() {
                1 => summary.bullish += 1,
                -1 => summary.bearish += 1,
                _ => summary.neutral += 1,
            }
        }

        let open_symbols: Vec<String> = engine
            .store
            .get_open_positions()
            .map(|ps| ps.into_iter().map(|p| p.symbol).collect())
            .unwrap_or_default();

        let scorer = OpportunityScorer::new(min_score, max_results);
        let ranked = scorer.rank(
            evaluations.iter().map(|e| e.score.clone()).collect(),
            &open_symbols,
            include_open,
        );

        let top_opportunities: Vec<OpportunityReport> = ranked
            .iter()
            .filter_map(|score| {
                let e = evaluations.iter().find(|e| e.symbol == score.symbol)?;
                Some(OpportunityReport {
                    symbol: e.symbol.clone(),
                    score: score.total,
                    action: e.strategy.action,
                    strategy_type: e.strategy.strategy_type,
                    signal_strength: e.strategy.signal_strength,
                    recommended_leverage: e.strategy.recommended_leverage,
                    regime: e.analysis.regime.to_string(),
                    confidence: score.confidence,
                    recommendation: score.recommendation.clone(),
                    reason: e.strategy.reason.clone(),
                })
            })
            .collect();

        info!(
            analyzed = evaluations.len(),
            found = top_opportunities.len(),
            min_score,
            "opening opportunities analyzed"
        );

        AnalyzeResponse {
            success: true,
            total_analyzed: evaluations.len(),
            opportunities_found: top_opportunities.len(),
            top_opportunities,
            filter_info: FilterInfo {
                min_score,
                max_results,
                include_open_positions: include_open,
            },
            market_summary: summary,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Compute a stop for a prospective entry.
    pub async fn calculate_stop_loss(&self, params: StopLossParams) -> anyhow::Result<StopLossResult> {
        let engine = &self.engine;
        let contract = engine.adapter.normalize_symbol(&params.symbol);
        let interval = params
            .timeframe
            .unwrap_or_else(|| engine.settings.trading_strategy.timeframes().1);

        let candles = engine
            .adapter
            .candles(&contract, interval, TOOL_CANDLE_LIMIT)
            .await?;
        Ok(engine
            .stop_engine
            .compute(&params.symbol, params.side, params.entry_price, &candles))
    }

    /// The open-gate as a question: should this position be opened at all?
    pub async fn check_open_position(&self, params: StopLossParams) -> CheckOpenResponse {
        match self.calculate_stop_loss(params).await {
            Ok(result) => {
                let (should_open, message) = self.engine.stop_engine.should_open_position(&result);
                CheckOpenResponse {
                    should_open,
                    data: Some(result),
                    message,
                }
            }
            Err(e) => CheckOpenResponse {
                should_open: false,
                data: None,
                message: format!("stop computation failed: {e}"),
            },
        }
    }

    /// Trailing proposal for an open position the agent is reasoning about.
    pub async fn update_trailing_stop(&self, params: TrailingParams) -> TrailingResponse {
        let engine = &self.engine;
        let contract = engine.adapter.normalize_symbol(&params.symbol);
        let (_, confirm_iv, _) = engine.settings.trading_strategy.timeframes();

        let candles = match engine
            .adapter
            .candles(&contract, confirm_iv, TOOL_CANDLE_LIMIT)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                return TrailingResponse {
                    should_update: false,
                    new_stop_loss: None,
                    reason: format!("candle fetch failed: {e}"),
                }
            }
        };

        let decision: TrailingDecision = engine.stop_engine.propose_trailing(
            &params.symbol,
            params.side,
            params.current_price,
            params.current_stop_loss,
            &candles,
        );

        TrailingResponse {
            should_update: decision.should_update,
            new_stop_loss: decision.new_stop,
            reason: decision.reason,
        }
    }

    /// Report, per open position, which staged take-profits are executable
    /// right now.
    pub async fn check_partial_take_profit_opportunity(&self) -> PartialTpCheckResponse {
        let engine = &self.engine;
        let Ok(open) = engine.store.get_open_positions() else {
            return PartialTpCheckResponse {
                success: false,
                positions: Vec::new(),
            };
        };

        let mut positions = Vec::new();
        for position in open {
            let contract = engine.adapter.normalize_symbol(&position.symbol);
            let Ok(ticker) = engine.adapter.ticker(&contract, true).await else {
                continue;
            };
            let price = ticker.mark_price.unwrap_or(ticker.last);
            let stages = engine.partial_tp.executable_stages(&position, price);
            if !stages.is_empty() {
                positions.push(SymbolTpOpportunities {
                    symbol: position.symbol.clone(),
                    side: position.side,
                    current_price: price,
                    executable_stages: stages,
                });
            }
        }

        PartialTpCheckResponse {
            success: true,
            positions,
        }
    }

    /// Execute one staged take-profit at the agent's request.
    pub async fn partial_take_profit(&self, params: PartialTpParams) -> PartialTpResponse {
        let engine = &self.engine;
        let symbol = params.symbol.to_uppercase();

        // Find the open position on either side of this symbol.
        let position = [Side::Long, Side::Short].into_iter().find_map(|side| {
            engine.store.get_position(&symbol, side).ok().flatten()
        });
        let Some(position) = position else {
            return PartialTpResponse {
                success: false,
                outcome: format!("no open position for {symbol}"),
                closed_quantity: None,
                pnl: None,
            };
        };

        let contract = engine.adapter.normalize_symbol(&symbol);
        let price = match engine.adapter.ticker(&contract, true).await {
            Ok(t) => t.mark_price.unwrap_or(t.last),
            Err(e) => {
                return PartialTpResponse {
                    success: false,
                    outcome: format!("ticker unavailable: {e}"),
                    closed_quantity: None,
                    pnl: None,
                }
            }
        };

        match engine
            .partial_tp
            .execute_stage_by_number(&position, params.stage, price)
            .await
        {
            StageOutcome::Executed {
                stage,
                closed_quantity,
                pnl,
            } => PartialTpResponse {
                success: true,
                outcome: format!("stage {stage} executed"),
                closed_quantity: Some(closed_quantity),
                pnl: Some(pnl),
            },
            StageOutcome::Skipped(reason) => PartialTpResponse {
                success: false,
                outcome: format!("skipped: {reason}"),
                closed_quantity: None,
                pnl: None,
            },
            StageOutcome::NotTriggered => PartialTpResponse {
                success: false,
                outcome: "stage target not reached".to_string(),
                closed_quantity: None,
                pnl: None,
            },
        }
    }
}
