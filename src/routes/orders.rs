use axum::{
    routing::{get, post, put},
    Router,
};

use crate::handlers::order_handlers;
use crate::state::AppState;

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(order_handlers::create_order))
        .route("/:id", get(order_handlers::get_order))
        .route("/user/:user_id", get(order_handlers::get_user_orders))
        .route("/:id/status", put(order_handlers::update_order_status))
}
