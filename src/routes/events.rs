use axum::{routing::get, Router};

use crate::handlers::events_handlers;
use crate::state::AppState;

pub fn event_routes() -> Router<AppState> {
    Router::new().route("/ws", get(events_handlers::endpoint))
}
