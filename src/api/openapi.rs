use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    openapi::Components,
    Modify, OpenApi,
};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::api::handlers::{admin, auth, health, recovery, session_events};

#[derive(OpenApi)]
#[openapi(
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Sign-in, rotation and logout"),
        (name = "recovery", description = "Password reset codes"),
        (name = "session-events", description = "Server-sent revocation notices"),
        (name = "admin", description = "Administrative session control"),
        (name = "health", description = "Liveness"),
    )
)]
struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Components::new);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Router whose routes also drive the `OpenAPI` document. New endpoints go
/// here via `.routes(routes!(...))`.
pub(crate) fn api_router() -> OpenApiRouter {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(health::health))
        .routes(routes!(auth::register))
        .routes(routes!(auth::login))
        .routes(routes!(auth::refresh_token))
        .routes(routes!(auth::logout))
        .routes(routes!(auth::revoke_token))
        .routes(routes!(auth::validate_token))
        .routes(routes!(recovery::forgot_password))
        .routes(routes!(recovery::verify_reset_code))
        .routes(routes!(recovery::reset_password))
        .routes(routes!(session_events::session_events))
        .routes(routes!(admin::revoke_sessions))
        .routes(routes!(admin::update_role))
        .routes(routes!(admin::cleanup_expired_tokens))
}
