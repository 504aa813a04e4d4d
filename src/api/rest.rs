// =============================================================================
// REST surface — JSON mirror of the agent tool calls
// =============================================================================
//
// One POST route per tool under /api/v1/tools/. The reasoning layer is the
// only intended consumer; CORS stays permissive for local tooling.
// =============================================================================

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::tools::{
    AnalyzeParams, PartialTpParams, StopLossParams, ToolContext, TrailingParams,
};

/// Build the tool router.
pub fn router(ctx: ToolContext) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route(
            "/api/v1/tools/analyze_opening_opportunities",
            post(analyze_opening_opportunities),
        )
        .route("/api/v1/tools/calculate_stop_loss", post(calculate_stop_loss))
        .route("/api/v1/tools/check_open_position", post(check_open_position))
        .route("/api/v1/tools/update_trailing_stop", post(update_trailing_stop))
        .route(
            "/api/v1/tools/check_partial_take_profit_opportunity",
            post(check_partial_take_profit_opportunity),
        )
        .route("/api/v1/tools/partial_take_profit", post(partial_take_profit))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn analyze_opening_opportunities(
    State(ctx): State<ToolContext>,
    Json(params): Json<AnalyzeParams>,
) -> Json<serde_json::Value> {
    let response = ctx.analyze_opening_opportunities(params).await;
    Json(json!(response))
}

async fn calculate_stop_loss(
    State(ctx): State<ToolContext>,
    Json(params): Json<StopLossParams>,
) -> Json<serde_json::Value> {
    match ctx.calculate_stop_loss(params).await {
        Ok(result) => Json(json!({ "success": true, "data": result })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

async fn check_open_position(
    State(ctx): State<ToolContext>,
    Json(params): Json<StopLossParams>,
) -> Json<serde_json::Value> {
    Json(json!(ctx.check_open_position(params).await))
}

async fn update_trailing_stop(
    State(ctx): State<ToolContext>,
    Json(params): Json<TrailingParams>,
) -> Json<serde_json::Value> {
    Json(json!(ctx.update_trailing_stop(params).await))
}

async fn check_partial_take_profit_opportunity(
    State(ctx): State<ToolContext>,
) -> Json<serde_json::Value> {
    Json(json!(ctx.check_partial_take_profit_opportunity().await))
}

async fn partial_take_profit(
    State(ctx): State<ToolContext>,
    Json(params): Json<PartialTpParams>,
) -> Json<serde_json::Value> {
    Json(json!(ctx.partial_take_profit(params).await))
}
