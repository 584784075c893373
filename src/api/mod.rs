//! API layer - HTTP handlers and routing
//!
//! This module contains the HTTP surface of the gate:
//! - The redirect gate middleware, applied to every route
//! - The homepage
//! - Health check
//! - Admin API endpoints (settings, diagnostics, statistics)

pub mod admin;
pub mod home;
pub mod middleware;

use axum::{
    http::{HeaderName, HeaderValue},
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

pub use home::{ClientRedirect, HomeRenderer};
pub use middleware::{ApiError, AppState, RedirectStats, RedirectStatsSnapshot};

/// Build the main API router
pub fn build_api_router(state: AppState) -> Router<AppState> {
    // Admin routes (need the admin token)
    let admin_routes = Router::new()
        .nest("/admin", admin::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state,
            middleware::require_admin,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(admin_routes)
}

/// Headers added to every response, including gate rejections
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "SAMEORIGIN"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("x-robots-tag", "noindex, nofollow"),
    ("x-permitted-cross-domain-policies", "none"),
];

/// Build the complete router with middleware
pub fn build_router(state: AppState) -> Router {
    let home_path = state.gate.home_path.clone();

    let router = Router::new()
        .route(&home_path, get(home::home_page))
        .nest("/api/v1", build_api_router(state.clone()))
        .fallback(not_found)
        // Gate runs for every route; only the homepage is evaluated
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::redirect_gate,
        ));

    SECURITY_HEADERS
        .iter()
        .fold(router, |router, &(name, value)| {
            router.layer(SetResponseHeaderLayer::if_not_present(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            ))
        })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/v1/health - Liveness
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}
