use crate::{
    AppState,
    api::models::catalog::ExerciseListResponse,
    catalog::CatalogEntry,
    errors::{Error, Result},
};
use axum::{
    extract::{Path, State},
    response::Json,
};

/// List the canonical exercises
#[utoipa::path(
    get,
    path = "/exercises",
    tag = "exercises",
    summary = "List the canonical exercises",
    description = "Every label recognition can return, with the synonyms it accepts and the muscle groups \
                   worked. Workout history and gym analytics group by these labels.",
    responses(
        (status = 200, description = "Exercise catalog", body = ExerciseListResponse),
    )
)]
pub async fn list_exercises(State(state): State<AppState>) -> Json<ExerciseListResponse> {
    Json(ExerciseListResponse {
        exercises: state.catalog.entries().to_vec(),
    })
}

/// Look up one exercise by name
#[utoipa::path(
    get,
    path = "/exercises/{name}",
    tag = "exercises",
    summary = "Look up one exercise by name",
    description = "Resolve a label or any of its synonyms to the canonical entry. Matching ignores case, \
                   punctuation and spacing, but is otherwise exact.",
    params(
        ("name" = String, Path, description = "Exercise label or synonym", example = "lat pull down"),
    ),
    responses(
        (status = 200, description = "Canonical exercise", body = CatalogEntry),
        (status = 404, description = "No exercise by that name"),
    )
)]
pub async fn get_exercise(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<CatalogEntry>> {
    state.catalog.lookup(&name).cloned().map(Json).ok_or_else(|| Error::NotFound {
        resource: "Exercise".to_string(),
        id: name,
    })
}
