//! HTTP handlers for the external interfaces.
//!
//! Thin wrappers over the stores and the sync engine: OAuth connect flow,
//! session endpoints, disconnect, and the manual sync trigger. No business
//! logic lives here.

use crate::credentials::{CredentialStore, ProfileSummary};
use crate::provider::OauthClient;
use crate::session::SessionStore;
use crate::sync::{SyncEngine, SyncLog, SyncLogStore, SyncSummary, TriggerType};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<CredentialStore>,
    pub oauth: Arc<OauthClient>,
    pub sync_log: Arc<SyncLogStore>,
    pub engine: Arc<SyncEngine>,
}

/// Builds the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/url", get(authorize_url))
        .route("/api/oauth/callback", post(oauth_callback))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/refresh", post(refresh_session))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/disconnect", post(disconnect))
        .route("/api/sync", post(trigger_sync))
        .route("/api/sync/latest", get(latest_sync))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Deserialize)]
struct AuthUrlParams {
    redirect_uri: String,
}

#[derive(Serialize)]
struct AuthUrlResponse {
    url: String,
    state: String,
}

/// GET /api/auth/url - Authorization URL for the connect flow
async fn authorize_url(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthUrlParams>,
) -> Json<AuthUrlResponse> {
    let oauth_state = Uuid::new_v4().to_string();
    let url = state.oauth.authorize_url(&oauth_state, &params.redirect_uri);

    Json(AuthUrlResponse {
        url,
        state: oauth_state,
    })
}

#[derive(Deserialize)]
struct CallbackRequest {
    principal_id: String,
    code: String,
    redirect_uri: String,
}

#[derive(Serialize)]
struct CallbackResponse {
    session_id: String,
    profile: ProfileSummary,
    expires_in: i64,
}

/// POST /api/oauth/callback - Complete the OAuth connect flow
///
/// Exchanges the authorization code, caches the principal's profile, stores
/// encrypted credentials and opens a session.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, AppError> {
    let tokens = state
        .oauth
        .exchange_code(&body.code, &body.redirect_uri)
        .await
        .map_err(|e| {
            warn!(principal = %body.principal_id, error = %e, "Code exchange failed");
            AppError::BadGateway(format!("Code exchange failed: {}", e))
        })?;

    let (remote_subject_id, profile) =
        state.oauth.fetch_profile(&tokens.access_token).await.map_err(|e| {
            warn!(principal = %body.principal_id, error = %e, "Profile fetch failed");
            AppError::BadGateway(format!("Profile fetch failed: {}", e))
        })?;

    state
        .credentials
        .put(
            &body.principal_id,
            Some(&remote_subject_id),
            &tokens,
            Some(&profile),
        )
        .map_err(internal)?;

    let session_id = state.sessions.create(&body.principal_id).map_err(internal)?;

    info!(principal = %body.principal_id, "Account connected");

    Ok(Json(CallbackResponse {
        session_id,
        profile,
        expires_in: tokens.expires_in_secs,
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<ProfileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// GET /api/auth/status - Connection status for the session's principal
async fn auth_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, AppError> {
    let principal_id = authenticate(&state, &headers)?;

    let record = state.credentials.get(&principal_id).map_err(internal)?;

    Ok(Json(match record {
        Some(record) => StatusResponse {
            connected: true,
            profile: record.profile,
            expires_at: Some(record.expires_at),
        },
        None => StatusResponse {
            connected: false,
            profile: None,
            expires_at: None,
        },
    }))
}

#[derive(Serialize)]
struct RefreshResponse {
    session_id: String,
}

/// POST /api/auth/refresh - Replace the session with a fresh one
async fn refresh_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, AppError> {
    let session_id = extract_bearer_token(&headers)?;

    let new_id = state
        .sessions
        .refresh(&session_id)
        .map_err(internal)?
        .ok_or_else(|| AppError::Unauthorized("Session expired or unknown".to_string()))?;

    Ok(Json(RefreshResponse { session_id: new_id }))
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

/// POST /api/auth/logout - Delete the session
async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let session_id = extract_bearer_token(&headers)?;
    state.sessions.delete(&session_id).map_err(internal)?;

    Ok(Json(SuccessResponse { success: true }))
}

/// POST /api/auth/disconnect - Remove credentials and every session
///
/// Credential deletion and the session cascade are application-level; the
/// cascade fails soft so a session-index problem cannot leave the principal
/// half-disconnected with live credentials.
async fn disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, AppError> {
    let principal_id = authenticate(&state, &headers)?;

    state.credentials.delete(&principal_id).map_err(internal)?;
    let removed = state.sessions.delete_all_for_principal(&principal_id);

    info!(principal = %principal_id, sessions_removed = removed, "Account disconnected");

    Ok(Json(SuccessResponse { success: true }))
}

/// POST /api/sync - Manual sync trigger, session required
async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SyncSummary>, AppError> {
    let principal_id = authenticate(&state, &headers)?;
    info!(principal = %principal_id, "Manual sync triggered");

    let summary = state
        .engine
        .run(TriggerType::Manual)
        .await
        .map_err(internal)?;

    Ok(Json(summary))
}

/// GET /api/sync/latest - Most recent sync log, session required
async fn latest_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SyncLog>, AppError> {
    authenticate(&state, &headers)?;

    let log = state
        .sync_log
        .latest(1)
        .map_err(internal)?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound("No sync runs recorded".to_string()))?;

    Ok(Json(log))
}

/// Resolves the bearer session to a principal id, applying lazy expiry.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let session_id = extract_bearer_token(headers)?;

    state
        .sessions
        .validate(&session_id)
        .map_err(internal)?
        .ok_or_else(|| AppError::Unauthorized("Session expired or unknown".to_string()))
}

/// Extracts the token from an "Authorization: Bearer <token>" header.
fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::Unauthorized("Authorization header missing".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid authorization header".to_string()))?;

    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();

    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AppError::Unauthorized(
            "Expected 'Bearer <token>' authorization".to_string(),
        ));
    }

    Ok(token.to_string())
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
enum AppError {
    Unauthorized(String),
    NotFound(String),
    BadGateway(String),
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

fn internal<E: std::fmt::Display>(e: E) -> AppError {
    warn!(error = %e, "Internal error");
    AppError::InternalServerError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc-123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc-123");

        // Case-insensitive scheme
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "bearer abc-123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc-123");
    }

    #[test]
    fn test_extract_bearer_token_rejects_bad_headers() {
        // Missing header
        assert!(extract_bearer_token(&HeaderMap::new()).is_err());

        // Wrong scheme
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_err());

        // Empty token
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_err());
    }
}
