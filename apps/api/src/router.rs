use axum::{
    Router,
    routing::get,
};

use appointment_cell::router::appointment_routes;
use shared_database::AppState;
use slot_cell::router::slot_routes;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Slot reservation API is running!" }))
        .nest("/slots", slot_routes(state.clone()))
        .nest("/appointments", appointment_routes(state.clone()))
}
