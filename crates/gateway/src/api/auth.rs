//! API authentication middleware and caller identity.
//!
//! Authentication itself lives in the fronting layer: the resolved user id
//! arrives in a header (default `x-user-id`). The gateway optionally gates
//! the API behind a bearer token whose SHA-256 digest is computed **once at
//! startup**; presenting the admin bearer token marks the caller as
//! administrator for ownership checks.

use axum::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Axum middleware that enforces bearer-token authentication on protected
/// routes. Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // `api_token_hash` is `None` in dev mode (no token configured).
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = bearer_token(req.headers());

    // The admin token also passes the API gate.
    let provided_hash = Sha256::digest(provided.as_bytes());
    let api_ok = bool::from(provided_hash.ct_eq(expected_hash.as_slice()));
    let admin_ok = state
        .admin_token_hash
        .as_ref()
        .map(|h| bool::from(provided_hash.ct_eq(h.as_slice())))
        .unwrap_or(false);

    if !api_ok && !admin_ok {
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API token" })),
        )
            .into_response();
    }

    next.run(req).await
}

fn bearer_token(headers: &axum::http::HeaderMap) -> &str {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
}

/// The resolved caller: user id from the configured header, admin flag
/// from the admin bearer token.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Option<String>,
    pub is_admin: bool,
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(state.config.auth.user_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .filter(|s| !s.is_empty());

        let is_admin = match &state.admin_token_hash {
            Some(expected) => {
                let provided = bearer_token(&parts.headers);
                let provided_hash = Sha256::digest(provided.as_bytes());
                bool::from(provided_hash.ct_eq(expected.as_slice()))
            }
            None => false,
        };

        Ok(Caller { user_id, is_admin })
    }
}
