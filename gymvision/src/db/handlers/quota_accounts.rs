use crate::{
    db::{
        errors::Result,
        models::quota::{QuotaAccountDBResponse, ReservationCreateDBRequest, ReservationDBResponse, ReservationStatus},
    },
    types::{ReservationId, UserId},
};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

const ACCOUNT_COLUMNS: &str = "user_id, credits_remaining, last_reset_period, created_at, updated_at";
const RESERVATION_COLUMNS: &str = "id, user_id, amount, period, status, created_at, resolved_at";

/// Repository for the `quota_accounts` and `quota_reservations` tables.
///
/// Every mutating method is a single statement. Callers that need several of them to take effect
/// together (reserve = reset + decrement + record) run them on a transaction.
pub struct QuotaAccounts<'c> {
    db: &'c mut PgConnection,
}

impl<'c> QuotaAccounts<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Create the account if missing, or reset it to `allowance` if its period is older than `period`.
    ///
    /// Periods are `YYYY-MM` strings, so lexical order is chronological order. An account whose
    /// period is already current (or ahead, with a skewed clock) is left untouched, which makes
    /// this idempotent within a period.
    #[instrument(skip(self), err)]
    pub async fn ensure_current_period(&mut self, user_id: UserId, period: &str, allowance: i32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_accounts (user_id, credits_remaining, last_reset_period)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET credits_remaining = EXCLUDED.credits_remaining,
                last_reset_period = EXCLUDED.last_reset_period,
                updated_at = NOW()
            WHERE quota_accounts.last_reset_period < EXCLUDED.last_reset_period
            "#,
        )
        .bind(user_id)
        .bind(allowance)
        .bind(period)
        .execute(&mut *self.db)
        .await?;

        Ok(())
    }

    /// Atomically take `amount` credits if at least that many remain.
    ///
    /// Returns the post-decrement account, or `None` when the balance was too low. The check and
    /// the decrement are one conditional UPDATE, so concurrent callers cannot both pass the check.
    #[instrument(skip(self), err)]
    pub async fn try_decrement(&mut self, user_id: UserId, amount: i32) -> Result<Option<QuotaAccountDBResponse>> {
        let sql = format!(
            r#"
            UPDATE quota_accounts
            SET credits_remaining = credits_remaining - $2, updated_at = NOW()
            WHERE user_id = $1 AND credits_remaining >= $2
            RETURNING {ACCOUNT_COLUMNS}
            "#
        );
        let account = sqlx::query_as::<_, QuotaAccountDBResponse>(&sql)
            .bind(user_id)
            .bind(amount)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(account)
    }

    /// Return `amount` credits to the account, but only while it is still in `period`.
    ///
    /// Once the period has rolled over the balance has been reset to a fresh allowance, and a
    /// refund from the previous month must not top it up. Returns whether the credit was applied.
    #[instrument(skip(self), err)]
    pub async fn credit(&mut self, user_id: UserId, amount: i32, period: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE quota_accounts
            SET credits_remaining = credits_remaining + $2, updated_at = NOW()
            WHERE user_id = $1 AND last_reset_period = $3
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(period)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Read an account without modifying it
    #[instrument(skip(self), err)]
    pub async fn get(&mut self, user_id: UserId) -> Result<Option<QuotaAccountDBResponse>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM quota_accounts WHERE user_id = $1");
        let account = sqlx::query_as::<_, QuotaAccountDBResponse>(&sql)
            .bind(user_id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(account)
    }

    #[instrument(skip(self), err)]
    pub async fn create_reservation(&mut self, request: &ReservationCreateDBRequest) -> Result<ReservationDBResponse> {
        let sql = format!(
            r#"
            INSERT INTO quota_reservations (id, user_id, amount, period, status)
            VALUES ($1, $2, $3, $4, 'reserved')
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let reservation = sqlx::query_as::<_, ReservationDBResponse>(&sql)
            .bind(request.id)
            .bind(request.user_id)
            .bind(request.amount)
            .bind(&request.period)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(reservation)
    }

    /// Move a reservation out of `reserved` into `to`.
    ///
    /// Returns `None` if the reservation does not exist or was already resolved; at most one
    /// caller ever observes `Some` for a given reservation.
    #[instrument(skip(self), err)]
    pub async fn resolve_reservation(&mut self, id: ReservationId, to: ReservationStatus) -> Result<Option<ReservationDBResponse>> {
        let sql = format!(
            r#"
            UPDATE quota_reservations
            SET status = $2, resolved_at = NOW()
            WHERE id = $1 AND status = 'reserved'
            RETURNING {RESERVATION_COLUMNS}
            "#
        );
        let reservation = sqlx::query_as::<_, ReservationDBResponse>(&sql)
            .bind(id)
            .bind(to.as_str())
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(reservation)
    }

    /// IDs of reservations still unresolved that were created before `older_than`
    #[instrument(skip(self), err)]
    pub async fn list_stale_reservations(&mut self, older_than: DateTime<Utc>) -> Result<Vec<ReservationId>> {
        let ids = sqlx::query_scalar::<_, ReservationId>(
            r#"
            SELECT id FROM quota_reservations
            WHERE status = 'reserved' AND created_at < $1
            ORDER BY created_at
            "#,
        )
        .bind(older_than)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(ids)
    }
}
