use crate::{AppState, api::models::quota::QuotaResponse, auth::CurrentUser, errors::Result};
use axum::{extract::State, response::Json};

/// Get the current user's recognition quota
#[utoipa::path(
    get,
    path = "/quota",
    tag = "quota",
    summary = "Get the current user's recognition quota",
    description = "Credits left this month. Reports a fresh allowance when the month has rolled over, \
                   without writing anything.",
    responses(
        (status = 200, description = "Current balance", body = QuotaResponse),
        (status = 401, description = "Missing or invalid user header"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-GymVision-User" = [])
    )
)]
pub async fn get_quota(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<QuotaResponse>> {
    let balance = state.pipeline.ledger().peek(current_user.id).await?;
    Ok(Json(balance.into()))
}
