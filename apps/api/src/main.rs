use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_cell::IntegrityReconciler;
use shared_config::AppConfig;
use shared_database::AppState;
use slot_cell::HoldExpiryReclaimer;

#[tokio::main]
async fn main() {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting slot reservation API server");

    // Load configuration
    let config = AppConfig::from_env();
    if !config.is_configured() {
        warn!("Supabase connection is not fully configured; store calls will fail");
    }
    if !config.has_default_doctor() {
        warn!("DEFAULT_DOCTOR_ID not configured; orphaned records cannot be reassigned");
    }

    // One storage client for the whole process, shared by handlers and
    // background jobs.
    let state = AppState::new(config);

    // Background jobs: hold expiry sweep and integrity reconciliation
    tokio::spawn(
        HoldExpiryReclaimer::with_client(
            Arc::clone(&state.supabase),
            Duration::from_secs(state.config.reclaimer_interval_seconds),
        )
        .run(),
    );
    tokio::spawn(
        IntegrityReconciler::with_client(
            Arc::clone(&state.supabase),
            state.config.default_doctor_id,
            Duration::from_secs(state.config.reconciler_interval_seconds),
        )
        .run(),
    );

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .await
        .unwrap();
}
