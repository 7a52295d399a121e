//! Administrative endpoints. All of them require the `admin` role.

use axum::{
    extract::{Extension, Path},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    principal::require_roles,
    types::{CleanupResponse, MessageResponse, UpdateRoleRequest, UserResponse},
};
use crate::{
    api::error::{ApiError, ApiResult, ErrorResponse},
    session::{identity::ROLE_ADMIN, SessionService},
};

#[utoipa::path(
    post,
    path = "/admin/users/{id}/revoke-sessions",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "Refresh tokens revoked and clients notified", body = MessageResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
#[instrument(skip_all, fields(%id))]
pub async fn revoke_sessions(
    headers: HeaderMap,
    service: Extension<Arc<SessionService>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MessageResponse>> {
    let admin = require_roles(&headers, &service.tokens(), &[ROLE_ADMIN])?;
    let user = service.revoke_sessions(id).await?;
    info!(admin_id = %admin.user_id, "admin revoked user sessions");
    Ok(Json(MessageResponse::ok(format!(
        "All sessions of {} have been revoked",
        user.username
    ))))
}

#[utoipa::path(
    put,
    path = "/admin/users/{id}/role",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role updated", body = UserResponse),
        (status = 400, description = "Unknown role", body = ErrorResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
        (status = 404, description = "User not found", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
#[instrument(skip_all, fields(%id))]
pub async fn update_role(
    headers: HeaderMap,
    service: Extension<Arc<SessionService>>,
    Path(id): Path<Uuid>,
    payload: Option<Json<UpdateRoleRequest>>,
) -> ApiResult<Json<UserResponse>> {
    require_roles(&headers, &service.tokens(), &[ROLE_ADMIN])?;
    let Some(Json(request)) = payload else {
        return Err(ApiError::bad_request("Missing payload"));
    };
    let user = service.update_role(id, &request.role).await?;
    Ok(Json(UserResponse {
        success: true,
        user,
    }))
}

#[utoipa::path(
    post,
    path = "/admin/cleanup-expired-tokens",
    responses(
        (status = 200, description = "Expired and revoked refresh tokens deleted", body = CleanupResponse),
        (status = 403, description = "Caller is not an admin", body = ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
#[instrument(skip_all)]
pub async fn cleanup_expired_tokens(
    headers: HeaderMap,
    service: Extension<Arc<SessionService>>,
) -> ApiResult<Json<CleanupResponse>> {
    require_roles(&headers, &service.tokens(), &[ROLE_ADMIN])?;
    let removed = service.cleanup_tokens().await?;
    Ok(Json(CleanupResponse {
        success: true,
        message: format!("Removed {removed} expired or revoked tokens"),
        removed,
    }))
}
