//! PostgreSQL implementation of [`QuotaStore`].
//!
//! `reserve` runs three statements in one transaction:
//!
//! 1. upsert the account, resetting it if its period is behind (takes the row lock)
//! 2. conditional decrement `WHERE credits_remaining >= amount`
//! 3. insert the reservation record
//!
//! Step 2 is itself a single atomic check-and-decrement, so correctness does not depend on the
//! row lock from step 1; the lock only keeps concurrent resets and decrements for one user in
//! order. Users never contend with each other.

use super::{BillingPeriod, QuotaAccount, ReservationToken, ReserveOutcome, Resolution, Result};
use crate::db::errors::DbError;
use crate::db::handlers::QuotaAccounts;
use crate::db::models::quota::{QuotaAccountDBResponse, ReservationCreateDBRequest, ReservationStatus};
use crate::types::{ReservationId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PostgresQuotaStore {
    pool: PgPool,
}

impl PostgresQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl TryFrom<QuotaAccountDBResponse> for QuotaAccount {
    type Error = DbError;

    fn try_from(row: QuotaAccountDBResponse) -> std::result::Result<Self, Self::Error> {
        let last_reset_period = row
            .last_reset_period
            .parse::<BillingPeriod>()
            .map_err(|e| DbError::Other(e.into()))?;
        Ok(Self {
            user_id: row.user_id,
            credits_remaining: row.credits_remaining,
            last_reset_period,
        })
    }
}

#[async_trait]
impl super::QuotaStore for PostgresQuotaStore {
    async fn reserve(&self, user_id: UserId, amount: i32, period: BillingPeriod, allowance: i32) -> Result<ReserveOutcome> {
        let period_str = period.to_string();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut repo = QuotaAccounts::new(&mut tx);

        repo.ensure_current_period(user_id, &period_str, allowance).await?;

        let Some(account) = repo.try_decrement(user_id, amount).await? else {
            let credits_remaining = repo.get(user_id).await?.map(|a| a.credits_remaining).unwrap_or(0);
            // Keep the reset from step 1; nothing else was written
            tx.commit().await.map_err(DbError::from)?;
            return Ok(ReserveOutcome::Exhausted { credits_remaining });
        };

        let reservation = repo
            .create_reservation(&ReservationCreateDBRequest {
                id: Uuid::new_v4(),
                user_id,
                amount,
                period: period_str,
            })
            .await?;

        tx.commit().await.map_err(DbError::from)?;

        Ok(ReserveOutcome::Reserved(ReservationToken {
            id: reservation.id,
            user_id,
            amount,
            period,
            credits_remaining: account.credits_remaining,
        }))
    }

    async fn commit(&self, reservation_id: ReservationId) -> Result<Resolution> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = QuotaAccounts::new(&mut conn);

        let resolved = repo.resolve_reservation(reservation_id, ReservationStatus::Committed).await?;
        Ok(if resolved.is_some() {
            Resolution::Applied
        } else {
            Resolution::AlreadyResolved
        })
    }

    async fn release(&self, reservation_id: ReservationId) -> Result<Resolution> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut repo = QuotaAccounts::new(&mut tx);

        let Some(reservation) = repo.resolve_reservation(reservation_id, ReservationStatus::Released).await? else {
            return Ok(Resolution::AlreadyResolved);
        };
        repo.credit(reservation.user_id, reservation.amount, &reservation.period).await?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(Resolution::Applied)
    }

    async fn account(&self, user_id: UserId) -> Result<Option<QuotaAccount>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = QuotaAccounts::new(&mut conn);

        let account = repo.get(user_id).await?.map(QuotaAccount::try_from).transpose()?;
        Ok(account)
    }

    async fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<ReservationId>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let mut repo = QuotaAccounts::new(&mut conn);

        Ok(repo.list_stale_reservations(older_than).await?)
    }
}
