//! Admin API endpoints
//!
//! Handles HTTP requests for gate administration:
//! - Reading and updating the redirect settings
//! - Diagnostics for the caller's own request
//! - Redirect statistics
//!
//! All routes sit behind [`require_admin`](crate::api::middleware::require_admin).

use axum::{
    extract::{Request, State},
    routing::get,
    Json, Router,
};

use crate::api::middleware::{request_context, ApiError, AppState, RedirectStatsSnapshot};
use crate::services::evaluator::DiagnosticReport;
use crate::services::settings::{
    RedirectSettings, SettingsServiceError, SettingsUpdate, UpdateRedirectSettingsInput,
};

/// Build the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings", get(get_settings).put(update_settings))
        .route("/redirect/test", get(test_redirect))
        .route("/redirect/stats", get(redirect_stats))
}

impl From<SettingsServiceError> for ApiError {
    fn from(e: SettingsServiceError) -> Self {
        match e {
            SettingsServiceError::InvalidValue(message) => ApiError::validation_error(message),
            other => ApiError::internal_error(other.to_string()),
        }
    }
}

/// GET /api/v1/admin/settings - Current redirect settings
async fn get_settings(State(state): State<AppState>) -> Result<Json<RedirectSettings>, ApiError> {
    let settings = state.settings_service.redirect_settings().await?;
    Ok(Json(settings))
}

/// PUT /api/v1/admin/settings - Validated partial update
///
/// Invalid IP list entries are dropped and reported in `warnings`.
async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<UpdateRedirectSettingsInput>,
) -> Result<Json<SettingsUpdate>, ApiError> {
    let update = state.settings_service.update_redirect_settings(body).await?;
    Ok(Json(update))
}

/// GET /api/v1/admin/redirect/test - Diagnose the caller's own request
///
/// The request is evaluated as if it targeted the homepage. No rate limit
/// attempt is consumed.
async fn test_redirect(
    State(state): State<AppState>,
    request: Request,
) -> Json<DiagnosticReport> {
    let mut context = request_context(&request, state.gate.trust_proxy_headers);
    context.request_uri = state.evaluator.home_path().to_string();

    let settings = state.settings_service.redirect_settings_or_fail_safe().await;
    Json(state.evaluator.diagnose(&settings, &context).await)
}

/// GET /api/v1/admin/redirect/stats - Gate counters since startup
async fn redirect_stats(State(state): State<AppState>) -> Json<RedirectStatsSnapshot> {
    Json(state.redirect_stats.snapshot())
}
