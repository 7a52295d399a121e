//! Bearer token extraction and role checks.
//!
//! The caller's role comes from the verified access token claims, so a role
//! change only applies once the client holds a freshly minted token.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    api::error::{ApiError, ApiResult},
    session::{SessionError, TokenIssuer},
};

/// Authenticated caller derived from a verified access token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub role: String,
}

/// Pull the token out of `Authorization: Bearer <token>`.
#[must_use]
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Verify the bearer token, returning 401 when it is missing or invalid.
///
/// # Errors
/// Returns 401 for a missing, expired or forged token.
pub fn require_auth(headers: &HeaderMap, tokens: &TokenIssuer) -> ApiResult<Principal> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(ApiError::unauthorized("token not provided"));
    };
    let claims = tokens.verify(&token).map_err(|err| {
        debug!("rejected bearer token: {err}");
        ApiError::from(SessionError::InvalidAccessToken)
    })?;
    Ok(Principal {
        user_id: claims.sub,
        email: claims.email,
        username: claims.unique_name,
        role: claims.role,
    })
}

/// Verify the bearer token and require one of `allowed` roles.
///
/// # Errors
/// Returns 401 without a valid token and 403 when the role is not allowed.
pub fn require_roles(
    headers: &HeaderMap,
    tokens: &TokenIssuer,
    allowed: &[&str],
) -> ApiResult<Principal> {
    let principal = require_auth(headers, tokens)?;
    if !allowed.contains(&principal.role.as_str()) {
        warn!(
            user_id = %principal.user_id,
            role = %principal.role,
            required = ?allowed,
            "access forbidden"
        );
        return Err(SessionError::Unauthorized.into());
    }
    Ok(principal)
}
