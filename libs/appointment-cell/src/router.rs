// libs/appointment-cell/src/router.rs
use axum::{
    Router,
    routing::{get, post},
};

use shared_database::AppState;

use crate::handlers;

pub fn appointment_routes(state: AppState) -> Router {
    Router::new()
        .route("/", post(handlers::book_appointment))
        .route("/search", get(handlers::search_appointments))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}/confirm", post(handlers::confirm_appointment))
        .route("/{appointment_id}/transition", post(handlers::transition_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .with_state(state)
}
