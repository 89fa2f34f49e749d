//! OpenAPI documentation for the `/api/*` endpoints, served at `/api-docs/openapi.json`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::api;

/// Security scheme for the trusted user header set by the auth proxy.
struct UserHeaderAddon;

impl Modify for UserHeaderAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "X-GymVision-User".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-gymvision-user",
                    "UUID of the authenticated user. Set by the auth proxy in front of this service; \
                     clients never send it directly.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    servers(
        (url = "/api", description = "GymVision API")
    ),
    modifiers(&UserHeaderAddon),
    paths(
        api::handlers::recognition::recognize_exercise,
        api::handlers::quota::get_quota,
        api::handlers::catalog::list_exercises,
        api::handlers::catalog::get_exercise,
    ),
    components(
        schemas(
            api::models::recognition::RecognitionRequest,
            api::models::recognition::RecognitionResponse,
            api::models::recognition::ImageErrorResponse,
            api::models::quota::QuotaResponse,
            api::models::catalog::ExerciseListResponse,
            crate::catalog::CatalogEntry,
        )
    ),
    tags(
        (name = "recognition", description = "Exercise recognition from photos"),
        (name = "quota", description = "Monthly recognition credits"),
        (name = "exercises", description = "Canonical exercise catalog"),
    ),
    info(
        title = "GymVision API",
        description = "Credit-metered exercise recognition",
    )
)]
pub struct ApiDoc;
