// libs/slot-cell/src/router.rs
use axum::{
    Router,
    routing::{get, post},
};

use shared_database::AppState;

use crate::handlers;

pub fn slot_routes(state: AppState) -> Router {
    Router::new()
        .route("/hold", post(handlers::hold_slot))
        .route("/{slot_id}/release", post(handlers::release_slot))
        .route("/", get(handlers::list_slots))
        .with_state(state)
}
