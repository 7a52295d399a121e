//! Password recovery endpoints.

use axum::{extract::Extension, Json};
use std::sync::Arc;
use tracing::instrument;

use super::types::{
    ForgotPasswordRequest, MessageResponse, ResetPasswordRequest, VerifyResetCodeRequest,
};
use crate::{
    api::error::{ApiError, ApiResult, ErrorResponse},
    session::{PasswordReset, SessionService},
};

#[utoipa::path(
    post,
    path = "/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Reset code sent if the account exists", body = MessageResponse),
        (status = 400, description = "Email missing", body = ErrorResponse),
    ),
    tag = "recovery"
)]
#[instrument(skip_all)]
pub async fn forgot_password(
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> ApiResult<Json<MessageResponse>> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::bad_request("Missing payload"));
    };
    let message = service.forgot_password(&request.email).await?;
    Ok(Json(MessageResponse::ok(message)))
}

#[utoipa::path(
    post,
    path = "/auth/verify-reset-code",
    request_body = VerifyResetCodeRequest,
    responses(
        (status = 200, description = "Code is valid", body = MessageResponse),
        (status = 400, description = "Wrong, expired or exhausted code", body = ErrorResponse),
        (status = 404, description = "Unknown email", body = ErrorResponse),
    ),
    tag = "recovery"
)]
#[instrument(skip_all)]
pub async fn verify_reset_code(
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<VerifyResetCodeRequest>>,
) -> ApiResult<Json<MessageResponse>> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::bad_request("Missing payload"));
    };
    service
        .verify_reset_code(&request.email, &request.code)
        .await?;
    Ok(Json(MessageResponse::ok("Code is valid")))
}

#[utoipa::path(
    post,
    path = "/auth/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password changed; sessions revoked", body = MessageResponse),
        (status = 400, description = "Validation failed or bad code", body = ErrorResponse),
        (status = 404, description = "Unknown email", body = ErrorResponse),
    ),
    tag = "recovery"
)]
#[instrument(skip_all)]
pub async fn reset_password(
    service: Extension<Arc<SessionService>>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> ApiResult<Json<MessageResponse>> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::bad_request("Missing payload"));
    };
    service
        .reset_password(PasswordReset {
            email: request.email,
            code: request.code,
            new_password: request.new_password,
            confirm_password: request.confirm_password,
        })
        .await?;
    Ok(Json(MessageResponse::ok("Password has been reset")))
}
