use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;

use crate::handlers::payment_handlers;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new()
        // Health
        .route("/health", get(mpesa_health))
        // Payment initiation
        .route("/stk-push", post(payment_handlers::initiate_stk_push))
        // Processor-facing callback (never called by the client)
        .route("/callback", post(payment_handlers::mpesa_callback))
        // Status (GET with query params)
        .route("/status", get(payment_handlers::check_transaction_status))
        .route("/transactions", get(payment_handlers::get_transactions))
        .route("/stats", get(payment_handlers::get_stats))
}

async fn mpesa_health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "mpesa",
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "callback", "transactions", "status"]
    }))
}
