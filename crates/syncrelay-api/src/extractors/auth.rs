//! `AuthUser` extractor: pulls the JWT from the Authorization header and validates it.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;

use syncrelay_auth::Claims;
use syncrelay_core::error::AppError;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated caller available in handlers.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Token subject.
    pub user_id: String,
    /// Validated claims.
    pub claims: Claims,
}

impl AuthUser {
    /// Validate `token` against the configured secret.
    pub fn from_token(state: &AppState, token: &str) -> Result<Self, AppError> {
        let claims = state.jwt_decoder.decode_access_token(token)?;
        Ok(Self {
            user_id: claims.user_id().to_string(),
            claims,
        })
    }
}

/// Bearer token from the `Authorization` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if !parts.headers.contains_key("authorization") {
            return Err(AppError::unauthorized("Missing Authorization header").into());
        }
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::unauthorized("Invalid Authorization header format"))?;

        Ok(Self::from_token(state, token)?)
    }
}
