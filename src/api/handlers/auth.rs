//! Credential endpoints: register, login, rotation, logout and validation.

use axum::{extract::Extension, http::HeaderMap, http::StatusCode, Json};
use std::sync::Arc;
use tracing::instrument;

use super::{
    principal::{extract_bearer_token, require_auth},
    types::{
        LoginRequest, LogoutRequest, MessageResponse, RefreshTokenRequest, RegisterRequest,
        RevokeTokenRequest, SessionResponse, UserResponse,
    },
};
use crate::{
    api::error::{ApiError, ApiResult, ErrorResponse},
    session::{Registration, SessionService},
};

const LOGIN_MESSAGE: &str = "Login successful";
const REGISTER_MESSAGE: &str = "Registration successful";

fn missing_payload() -> ApiError {
    ApiError::bad_request("Missing payload")
}

#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User created and signed in", body = SessionResponse),
        (status = 400, description = "Missing or invalid fields", body = ErrorResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn register(
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<RegisterRequest>>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let Some(Json(request)) = payload else {
        return Err(missing_payload());
    };
    let issued = service
        .register(Registration {
            username: request.username,
            email: request.email,
            phone: request.phone,
            password: request.password,
            role: request.role,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::from_issued(issued, Some(REGISTER_MESSAGE))),
    ))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in; previous refresh tokens revoked", body = SessionResponse),
        (status = 401, description = "Invalid email or password", body = ErrorResponse),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<LoginRequest>>,
) -> ApiResult<Json<SessionResponse>> {
    let Some(Json(request)) = payload else {
        return Err(missing_payload());
    };
    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("email and password are required"));
    }
    let issued = service.login(&request.email, &request.password).await?;
    Ok(Json(SessionResponse::from_issued(issued, Some(LOGIN_MESSAGE))))
}

#[utoipa::path(
    post,
    path = "/auth/refresh-token",
    request_body = RefreshTokenRequest,
    responses(
        (status = 200, description = "New access token issued", body = SessionResponse),
        (status = 401, description = "Refresh or access token rejected", body = ErrorResponse),
        (status = 404, description = "User no longer exists", body = ErrorResponse),
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn refresh_token(
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<RefreshTokenRequest>>,
) -> ApiResult<Json<SessionResponse>> {
    let Some(Json(request)) = payload else {
        return Err(missing_payload());
    };
    let issued = service
        .rotate(&request.access_token, &request.refresh_token)
        .await?;
    Ok(Json(SessionResponse::from_issued(issued, None)))
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Refresh token(s) revoked", body = MessageResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<LogoutRequest>>,
) -> ApiResult<Json<MessageResponse>> {
    let principal = require_auth(&headers, &service.tokens())?;
    let refresh_token = payload.and_then(|Json(request)| request.refresh_token);
    service
        .logout(principal.user_id, refresh_token.as_deref())
        .await?;
    Ok(Json(MessageResponse::ok("Logged out")))
}

#[utoipa::path(
    post,
    path = "/auth/revoke-token",
    request_body = RevokeTokenRequest,
    responses(
        (status = 200, description = "Refresh token revoked", body = MessageResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
        (status = 404, description = "Token not found", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn revoke_token(
    headers: HeaderMap,
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<RevokeTokenRequest>>,
) -> ApiResult<Json<MessageResponse>> {
    let principal = require_auth(&headers, &service.tokens())?;
    let Some(Json(request)) = payload else {
        return Err(missing_payload());
    };
    if request.refresh_token.trim().is_empty() {
        return Err(ApiError::bad_request("refreshToken is required"));
    }
    service
        .revoke_token(principal.user_id, &request.refresh_token)
        .await?;
    Ok(Json(MessageResponse::ok("Token revoked")))
}

#[utoipa::path(
    post,
    path = "/auth/validate-token",
    responses(
        (status = 200, description = "Token is valid", body = UserResponse),
        (status = 401, description = "Token missing or invalid", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn validate_token(
    headers: HeaderMap,
    service: Extension<Arc<SessionService>>,
) -> ApiResult<Json<UserResponse>> {
    let Some(token) = extract_bearer_token(&headers) else {
        return Err(ApiError::unauthorized("token not provided"));
    };
    let user = service.validate(&token).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}
