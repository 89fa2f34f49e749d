//! In-memory implementation of [`QuotaStore`].
//!
//! All state lives behind a single mutex, which makes every operation trivially atomic. Suitable
//! for tests and single-process development deployments; nothing survives a restart.

use super::{BillingPeriod, Clock, QuotaAccount, ReservationToken, ReserveOutcome, Resolution, Result, SystemClock};
use crate::db::models::quota::ReservationStatus;
use crate::types::{ReservationId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredReservation {
    user_id: UserId,
    amount: i32,
    period: BillingPeriod,
    status: ReservationStatus,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<UserId, QuotaAccount>,
    reservations: HashMap<ReservationId, StoredReservation>,
}

pub struct InMemoryQuotaStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` to timestamp reservations (for stale-reservation sweeps)
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    /// Seed an account directly, bypassing the reserve protocol
    pub fn insert_account(&self, user_id: UserId, credits_remaining: i32, last_reset_period: BillingPeriod) {
        self.lock().accounts.insert(
            user_id,
            QuotaAccount {
                user_id,
                credits_remaining,
                last_reset_period,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-updated: every mutation below
        // completes before any fallible step.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, reservation_id: ReservationId, to: ReservationStatus) -> Resolution {
        let mut state = self.lock();
        let State { accounts, reservations } = &mut *state;

        let Some(reservation) = reservations.get_mut(&reservation_id) else {
            return Resolution::AlreadyResolved;
        };
        if reservation.status != ReservationStatus::Reserved {
            return Resolution::AlreadyResolved;
        }
        reservation.status = to;

        if to == ReservationStatus::Released
            && let Some(account) = accounts.get_mut(&reservation.user_id)
            && account.last_reset_period == reservation.period
        {
            account.credits_remaining += reservation.amount;
        }
        Resolution::Applied
    }
}

#[async_trait]
impl super::QuotaStore for InMemoryQuotaStore {
    async fn reserve(&self, user_id: UserId, amount: i32, period: BillingPeriod, allowance: i32) -> Result<ReserveOutcome> {
        let created_at = self.clock.now();
        let mut state = self.lock();

        let account = state.accounts.entry(user_id).or_insert(QuotaAccount {
            user_id,
            credits_remaining: allowance,
            last_reset_period: period,
        });
        if account.last_reset_period < period {
            account.credits_remaining = allowance;
            account.last_reset_period = period;
        }

        if account.credits_remaining < amount {
            return Ok(ReserveOutcome::Exhausted {
                credits_remaining: account.credits_remaining,
            });
        }
        account.credits_remaining -= amount;
        let credits_remaining = account.credits_remaining;

        let id = Uuid::new_v4();
        state.reservations.insert(
            id,
            StoredReservation {
                user_id,
                amount,
                period,
                status: ReservationStatus::Reserved,
                created_at,
            },
        );

        Ok(ReserveOutcome::Reserved(ReservationToken {
            id,
            user_id,
            amount,
            period,
            credits_remaining,
        }))
    }

    async fn commit(&self, reservation_id: ReservationId) -> Result<Resolution> {
        Ok(self.resolve(reservation_id, ReservationStatus::Committed))
    }

    async fn release(&self, reservation_id: ReservationId) -> Result<Resolution> {
        Ok(self.resolve(reservation_id, ReservationStatus::Released))
    }

    async fn account(&self, user_id: UserId) -> Result<Option<QuotaAccount>> {
        Ok(self.lock().accounts.get(&user_id).cloned())
    }

    async fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<ReservationId>> {
        let state = self.lock();
        let mut stale: Vec<_> = state
            .reservations
            .iter()
            .filter(|(_, r)| r.status == ReservationStatus::Reserved && r.created_at < older_than)
            .map(|(id, r)| (r.created_at, *id))
            .collect();
        stale.sort();
        Ok(stale.into_iter().map(|(_, id)| id).collect())
    }
}
