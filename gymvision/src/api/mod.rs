//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//!
//! # API Structure
//!
//! - **Recognition** (`POST /api/recognize-exercise`): photo in, canonical exercise out, one credit
//! - **Quota** (`GET /api/quota`): the caller's remaining credits for this month
//! - **Exercises** (`GET /api/exercises`): the canonical exercise vocabulary
//!
//! All endpoints are documented with `utoipa`; the OpenAPI document is served at
//! `/api-docs/openapi.json`.

pub mod handlers;
pub mod models;
