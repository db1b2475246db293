//! The five HTTP endpoints: session create/lookup, ICE config, the
//! authenticated-principal probe, and admin user CRUD.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use sendie_core::{Policy, Session};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::Principal;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    let router = Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/ice-servers", get(ice_servers))
        .route("/auth/me", get(auth_me))
        .route("/admin/users", get(list_admin_users))
        .route("/admin/users/{id}", post(add_admin_user))
        .route("/admin/users/{id}", delete(remove_admin_user));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(metrics));

    router
}

#[cfg(feature = "prometheus")]
async fn metrics() -> Result<Vec<u8>, ApiError> {
    crate::metrics::render().map_err(|_| ApiError::InvalidArgument("failed to render metrics"))
}

enum ApiError {
    NotFound,
    Forbidden,
    RateLimited(Duration),
    InvalidArgument(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response(),
            Self::Forbidden => (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" }))).into_response(),
            Self::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response(),
            Self::RateLimited(retry_after) => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "rate limit exceeded", "retry_after_ms": retry_after.as_millis() })))
                        .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
        }
    }
}

#[derive(Deserialize, Default)]
struct CreateSessionRequest {
    #[serde(default)]
    max_peers: Option<usize>,
}

#[derive(Serialize)]
struct SessionCreated {
    id: String,
    max_peers: usize,
    expires_at: u64,
    absolute_expires_at: u64,
}

impl From<Session> for SessionCreated {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            max_peers: session.max_peers,
            expires_at: session.expires_at,
            absolute_expires_at: session.absolute_expires_at,
        }
    }
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    principal: Principal,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<Json<SessionCreated>, ApiError> {
    if !principal.is_allowed(&state.allow_list) {
        return Err(ApiError::Forbidden);
    }

    let check = state.rate_limiter.check(Policy::SessionCreate, &addr.ip().to_string());
    if !check.allowed {
        return Err(ApiError::RateLimited(check.retry_after.unwrap_or_default()));
    }

    let creator_user_id = principal.user_id.expect("is_allowed implies an authenticated principal");
    let max_peers = body.and_then(|Json(req)| req.max_peers).unwrap_or(10);
    let session = state.sessions.create(creator_user_id, max_peers);
    crate::metrics::Metrics::session_created();

    Ok(Json(session.into()))
}

#[derive(Serialize)]
struct SessionSummary {
    peer_count: usize,
    max_peers: usize,
    is_locked: bool,
}

async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<SessionSummary>, ApiError> {
    if !sendie_core::ids::has_token_shape(&id) {
        return Err(ApiError::NotFound);
    }

    let session = state.sessions.get(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(SessionSummary { peer_count: session.peers.len(), max_peers: session.max_peers, is_locked: session.is_locked }))
}

async fn ice_servers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!(state.config.ice_servers))
}

#[derive(Serialize)]
struct AuthMe {
    user_id: Option<String>,
    is_admin: bool,
    is_allowed: bool,
}

async fn auth_me(State(state): State<Arc<AppState>>, principal: Principal) -> Json<AuthMe> {
    Json(AuthMe {
        is_admin: principal.is_admin(&state.allow_list),
        is_allowed: principal.is_allowed(&state.allow_list),
        user_id: principal.user_id,
    })
}

async fn list_admin_users(State(state): State<Arc<AppState>>, principal: Principal) -> Result<Json<serde_json::Value>, ApiError> {
    if !principal.is_admin(&state.allow_list) {
        return Err(ApiError::Forbidden);
    }

    Ok(Json(json!({
        "users": state.allow_list.list_users(),
        "admins": state.allow_list.list_admins(),
    })))
}

/// 17-19 decimal digits: the current upstream identity provider's ID shape.
fn has_provider_id_shape(id: &str) -> bool {
    (17..=19).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_digit())
}

async fn add_admin_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    principal: Principal,
) -> Result<StatusCode, ApiError> {
    if !principal.is_admin(&state.allow_list) {
        return Err(ApiError::Forbidden);
    }
    if !has_provider_id_shape(&id) {
        return Err(ApiError::InvalidArgument("user id must be 17-19 decimal digits"));
    }

    let by_admin_id = principal.user_id.expect("is_admin implies an authenticated principal");
    state.allow_list.add(&id, &by_admin_id);
    Ok(StatusCode::OK)
}

async fn remove_admin_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    principal: Principal,
) -> Result<StatusCode, ApiError> {
    if !principal.is_admin(&state.allow_list) {
        return Err(ApiError::Forbidden);
    }

    let by_admin_id = principal.user_id.expect("is_admin implies an authenticated principal");
    if state.allow_list.remove(&id, &by_admin_id) {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_shape_accepts_17_to_19_digits() {
        assert!(has_provider_id_shape(&"1".repeat(17)));
        assert!(has_provider_id_shape(&"1".repeat(19)));
        assert!(!has_provider_id_shape(&"1".repeat(16)));
        assert!(!has_provider_id_shape(&"1".repeat(20)));
        assert!(!has_provider_id_shape("12345678901234abc"));
    }
}
