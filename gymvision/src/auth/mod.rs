//! Request authentication.
//!
//! Users sign in through the upstream auth proxy, never through this service. The proxy forwards
//! the authenticated user's UUID in a trusted header (`auth.user_header`, default
//! `x-gymvision-user`), and [`CurrentUser`] reads it. Requests without a well-formed header are
//! rejected with 401 before any handler logic runs.
//!
//! The header must be stripped from client traffic by the proxy; this service trusts it as-is.

use crate::{
    AppState,
    errors::{Error, Result},
    types::{UserId, abbrev_uuid},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};
use utoipa::ToSchema;
use uuid::Uuid;

/// The authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CurrentUser {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
}

fn user_from_header(parts: &Parts, header_name: &str) -> Result<CurrentUser> {
    let value = parts.headers.get(header_name).ok_or_else(|| Error::Unauthenticated {
        message: Some(format!("Missing {header_name} header")),
    })?;

    let id = value
        .to_str()
        .ok()
        .map(str::trim)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| Error::Unauthenticated {
            message: Some(format!("Invalid {header_name} header: expected a user UUID")),
        })?;

    Ok(CurrentUser { id })
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let user = user_from_header(parts, &state.config.auth.user_header)?;
        trace!(user = %abbrev_uuid(&user.id), "Authenticated via proxy header");
        Ok(user)
    }
}
