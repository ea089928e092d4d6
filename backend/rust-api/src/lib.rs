use axum::{
    middleware,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<services::AppState>) -> Router {
    Router::new()
        // Public endpoints (no auth required)
        .route("/health", get(handlers::health_check))
        // Metrics endpoint with Basic Auth protection
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        // Protected endpoints (require JWT)
        .nest(
            "/api/v1/attempts",
            attempt_routes().layer(middleware::from_fn_with_state(
                app_state.clone(),
                middlewares::auth::auth_middleware,
            )),
        )
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn attempt_routes() -> Router<Arc<services::AppState>> {
    Router::new().route(
        "/{id}",
        get(handlers::attempts::attempt_action)
            .patch(handlers::attempts::attempt_action)
            .post(handlers::attempts::attempt_action),
    )
}
