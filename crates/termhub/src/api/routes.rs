use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::Level;

use crate::api::handlers;
use crate::api::state::AppState;
use crate::ws::handler::terminal_ws;

/// Build the full application router.
pub fn create_router(state: AppState) -> Router {
    let files_router = termhub_files::routes::fs_routes().with_state(state.files.clone());

    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions))
        .route("/install-requirements", post(handlers::install_requirements))
        .route("/ws/terminal", get(terminal_ws))
        .with_state(state)
        .nest("/fs", files_router)
        .layer(cors_layer())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO)),
        )
}

/// Clients are local tools and editor plugins on arbitrary origins, so CORS
/// is wide open.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
