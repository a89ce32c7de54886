//! Authentication middleware.
//!
//! Extracts a Bearer token. Without `AUTH_SECRET` any token (or none) is
//! accepted; with it, the token must match.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The bearer token, `anonymous` when auth is disabled
    #[allow(dead_code)]
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let secret = state.config.auth_secret.as_deref();
        match (auth_header, secret) {
            (Some(header), _) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ").to_string();
                if token.is_empty() {
                    return Err(AppError::Unauthorized("Empty bearer token"));
                }
                if secret.is_some_and(|secret| secret != token) {
                    return Err(AppError::Unauthorized("Invalid token"));
                }
                Ok(AuthUser { token })
            }
            (Some(_), _) => Err(AppError::Unauthorized("Invalid authorization header format")),
            (None, None) => Ok(AuthUser {
                token: "anonymous".to_string(),
            }),
            (None, Some(_)) => Err(AppError::Unauthorized("Missing authorization header")),
        }
    }
}
