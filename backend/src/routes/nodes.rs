use std::sync::Arc;

use axum::{routing::get, Router};

use crate::gateway::ws_handler;
use crate::AppState;

/// GET /ws/node - node session endpoint.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/node", get(ws_handler))
        .with_state(state)
}
