pub mod config;
pub mod routes;
pub mod state;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the relay router.
///
/// `/healthz` is added after the trace layer so probes stay out of the
/// access log.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(routes::websocket_handler))
        .layer(TraceLayer::new_for_http())
        .route("/healthz", get(routes::health_check))
        .with_state(state)
}
