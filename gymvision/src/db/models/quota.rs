//! Database models for quota accounts and reservations.

use crate::types::{ReservationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Reservation status enum stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Committed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
        }
    }
}

/// A row of `quota_accounts`
#[derive(Debug, Clone, FromRow)]
pub struct QuotaAccountDBResponse {
    pub user_id: UserId,
    pub credits_remaining: i32,
    pub last_reset_period: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Database request for recording a new reservation
#[derive(Debug, Clone)]
pub struct ReservationCreateDBRequest {
    pub id: ReservationId,
    pub user_id: UserId,
    pub amount: i32,
    pub period: String,
}

/// A row of `quota_reservations`
#[derive(Debug, Clone, FromRow)]
pub struct ReservationDBResponse {
    pub id: ReservationId,
    pub user_id: UserId,
    pub amount: i32,
    pub period: String,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
