use crate::catalog::CatalogEntry;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExerciseListResponse {
    /// Every canonical exercise, in catalog order
    pub exercises: Vec<CatalogEntry>,
}
