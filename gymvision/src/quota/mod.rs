//! Per-user monthly recognition quota.
//!
//! The [`QuotaLedger`] hands out [`ReservationToken`]s against a user's monthly credit balance.
//! A reservation is taken before the expensive classifier call and resolved immediately after it:
//!
//! ```text
//! reserve ──► (classifier call) ──┬──► commit   (credit consumed)
//!                                 └──► release  (credit returned)
//! ```
//!
//! The decrement happens at reserve time, inside the same atomic step as the balance check, so
//! two concurrent requests for a user with one credit left can never both succeed. `commit` then
//! only finalizes the reservation record; `release` puts the credit back.
//!
//! # Lazy monthly reset
//!
//! There is no background timer. Every `reserve` first compares the account's
//! `last_reset_period` with the current [`BillingPeriod`] and, if the account is behind, resets
//! the balance to the monthly allowance before evaluating the reservation. [`QuotaLedger::peek`]
//! applies the same rule to what it reports but never writes.
//!
//! # Storage
//!
//! Storage is behind the [`QuotaStore`] trait:
//!
//! - [`postgres::PostgresQuotaStore`]: durable storage, one transaction per operation
//! - [`in_memory::InMemoryQuotaStore`]: single-process storage for development and tests

pub mod in_memory;
pub mod postgres;

use crate::{
    db::errors::DbError,
    types::{ReservationId, UserId, abbrev_uuid},
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// A billing month, rendered as `YYYY-MM`.
///
/// Ordering is chronological, and matches the lexical order of the rendered form that storage
/// compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingPeriod {
    year: i32,
    month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((1..=12).contains(&month) && (0..=9999).contains(&year)).then_some(Self { year, month })
    }

    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Error)]
#[error("invalid billing period '{0}', expected YYYY-MM")]
pub struct InvalidPeriod(pub String);

impl FromStr for BillingPeriod {
    type Err = InvalidPeriod;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || InvalidPeriod(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl Serialize for BillingPeriod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BillingPeriod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Source of "now" for period computation
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A provisional hold of `amount` credits for `user_id` in `period`.
///
/// Must be resolved with [`QuotaLedger::commit`] or [`QuotaLedger::release`]. Both consume the
/// token, so a single holder cannot resolve it twice; storage enforces the same rule across
/// processes.
#[must_use = "a reservation must be committed or released"]
#[derive(Debug, PartialEq, Eq)]
pub struct ReservationToken {
    pub id: ReservationId,
    pub user_id: UserId,
    pub amount: i32,
    pub period: BillingPeriod,
    /// Balance immediately after this reservation was taken
    pub credits_remaining: i32,
}

/// A quota account as stored, before any lazy reset is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaAccount {
    pub user_id: UserId,
    pub credits_remaining: i32,
    pub last_reset_period: BillingPeriod,
}

/// What `peek` reports: the balance the user would reserve against right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaBalance {
    pub credits_remaining: i32,
    pub monthly_allowance: i32,
    pub period: BillingPeriod,
}

/// Result of a store-level reservation attempt
#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(ReservationToken),
    /// Balance (after any reset) was below the requested amount
    Exhausted { credits_remaining: i32 },
}

/// Whether a resolve call changed anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This call moved the reservation out of `reserved`
    Applied,
    /// The reservation was already resolved (or never existed); nothing changed
    AlreadyResolved,
}

#[derive(Debug, Error)]
pub enum QuotaError {
    /// Balance after lazy reset is below the requested amount. Not transient; never retried.
    #[error("monthly quota exhausted ({credits_remaining} credits remaining)")]
    Exhausted { credits_remaining: i32 },

    #[error("reservation amount must be positive, got {0}")]
    InvalidAmount(i32),

    #[error(transparent)]
    Storage(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

/// Persistence for quota accounts.
///
/// Implementations must make `reserve` atomic per user: the lazy reset, the balance check, the
/// decrement and the reservation record either all happen or none do, and concurrent calls for the
/// same user behave as if serialized. No cross-user locking is required.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn reserve(&self, user_id: UserId, amount: i32, period: BillingPeriod, allowance: i32) -> Result<ReserveOutcome>;

    /// Finalize a reservation. Never changes the balance.
    async fn commit(&self, reservation_id: ReservationId) -> Result<Resolution>;

    /// Cancel a reservation and return its credits, unless its period has already rolled over.
    async fn release(&self, reservation_id: ReservationId) -> Result<Resolution>;

    /// Read an account as stored. Must not write.
    async fn account(&self, user_id: UserId) -> Result<Option<QuotaAccount>>;

    /// IDs of unresolved reservations created before `older_than`
    async fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<ReservationId>>;
}

/// The quota ledger: lazy monthly reset plus reserve / commit / release / peek.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    monthly_allowance: i32,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>, monthly_allowance: i32) -> Self {
        Self {
            store,
            clock,
            monthly_allowance,
        }
    }

    pub fn monthly_allowance(&self) -> i32 {
        self.monthly_allowance
    }

    pub fn current_period(&self) -> BillingPeriod {
        BillingPeriod::containing(self.clock.now())
    }

    /// Reserve `amount` credits for `user_id`, creating the account on first use.
    #[instrument(skip(self), fields(user = %abbrev_uuid(&user_id)), err(level = "debug"))]
    pub async fn reserve(&self, user_id: UserId, amount: i32) -> Result<ReservationToken> {
        if amount <= 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }

        let period = self.current_period();
        match self.store.reserve(user_id, amount, period, self.monthly_allowance).await? {
            ReserveOutcome::Reserved(token) => {
                debug!(
                    reservation = %abbrev_uuid(&token.id),
                    credits_remaining = token.credits_remaining,
                    "Quota reserved"
                );
                crate::metrics::record_quota_event("reserved");
                Ok(token)
            }
            ReserveOutcome::Exhausted { credits_remaining } => {
                info!(credits_remaining, %period, "Quota exhausted");
                crate::metrics::record_quota_event("exhausted");
                Err(QuotaError::Exhausted { credits_remaining })
            }
        }
    }

    /// Finalize a reservation. The credit was already taken at reserve time.
    #[instrument(skip(self, token), fields(reservation = %abbrev_uuid(&token.id)), err)]
    pub async fn commit(&self, token: ReservationToken) -> Result<()> {
        if self.store.commit(token.id).await? == Resolution::AlreadyResolved {
            warn!("Commit of a reservation that was already resolved");
        }
        crate::metrics::record_quota_event("committed");
        Ok(())
    }

    /// Return the reserved credits to the balance
    #[instrument(skip(self, token), fields(reservation = %abbrev_uuid(&token.id)), err)]
    pub async fn release(&self, token: ReservationToken) -> Result<()> {
        if self.store.release(token.id).await? == Resolution::AlreadyResolved {
            warn!("Release of a reservation that was already resolved");
        }
        crate::metrics::record_quota_event("released");
        Ok(())
    }

    /// Balance the user would reserve against right now. Never writes.
    #[instrument(skip(self), fields(user = %abbrev_uuid(&user_id)), err)]
    pub async fn peek(&self, user_id: UserId) -> Result<QuotaBalance> {
        let period = self.current_period();
        let credits_remaining = match self.store.account(user_id).await? {
            Some(account) if account.last_reset_period >= period => account.credits_remaining,
            // Missing or from an earlier month: the next reserve starts from a fresh allowance
            _ => self.monthly_allowance,
        };

        Ok(QuotaBalance {
            credits_remaining,
            monthly_allowance: self.monthly_allowance,
            period,
        })
    }

    /// Release every reservation left unresolved for longer than `max_age`.
    ///
    /// These are reservations whose request never finished (e.g. the process died mid-call). The
    /// user never received an answer, so the credit goes back.
    #[instrument(skip(self), err)]
    pub async fn release_stale(&self, max_age: Duration) -> Result<u64> {
        let max_age = chrono::Duration::from_std(max_age).map_err(|e| DbError::Other(e.into()))?;
        let cutoff = self.clock.now() - max_age;

        let mut released = 0;
        for id in self.store.stale_reservations(cutoff).await? {
            if self.store.release(id).await? == Resolution::Applied {
                released += 1;
                crate::metrics::record_quota_event("stale_released");
            }
        }

        if released > 0 {
            info!(released, "Released stale quota reservations");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FixedClock;
    use in_memory::InMemoryQuotaStore;
    use uuid::Uuid;

    fn ledger_at(store: Arc<InMemoryQuotaStore>, clock: Arc<FixedClock>) -> QuotaLedger {
        QuotaLedger::new(store, clock, 10)
    }

    #[test]
    fn test_period_formatting_and_parsing() {
        let period = BillingPeriod::new(2025, 2).unwrap();
        assert_eq!(period.to_string(), "2025-02");
        assert_eq!("2025-02".parse::<BillingPeriod>().unwrap(), period);

        assert!("2025-13".parse::<BillingPeriod>().is_err());
        assert!("2025-2".parse::<BillingPeriod>().is_err());
        assert!("202502".parse::<BillingPeriod>().is_err());
        assert!("abcd-ef".parse::<BillingPeriod>().is_err());
    }

    #[test]
    fn test_period_ordering_matches_string_ordering() {
        let dec = BillingPeriod::new(2024, 12).unwrap();
        let jan = BillingPeriod::new(2025, 1).unwrap();
        assert!(dec < jan);
        assert!(dec.to_string() < jan.to_string());
    }

    #[tokio::test]
    async fn test_first_reserve_creates_account_with_default_allowance() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));
        let user = Uuid::new_v4();

        let token = ledger.reserve(user, 1).await.unwrap();
        assert_eq!(token.credits_remaining, 9);
        ledger.commit(token).await.unwrap();

        let account = store.account(user).await.unwrap().unwrap();
        assert_eq!(account.credits_remaining, 9);
        assert_eq!(account.last_reset_period.to_string(), "2025-02");
    }

    #[tokio::test]
    async fn test_lazy_reset_before_reserving() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let user = Uuid::new_v4();
        store.insert_account(user, 0, BillingPeriod::new(2025, 1).unwrap());

        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));
        let token = ledger.reserve(user, 1).await.unwrap();
        ledger.commit(token).await.unwrap();

        let account = store.account(user).await.unwrap().unwrap();
        assert_eq!(account.credits_remaining, 9);
        assert_eq!(account.last_reset_period.to_string(), "2025-02");
    }

    #[tokio::test]
    async fn test_reset_happens_once_per_period() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let user = Uuid::new_v4();
        store.insert_account(user, 3, BillingPeriod::new(2025, 1).unwrap());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));

        for expected in (5..10).rev() {
            let token = ledger.reserve(user, 1).await.unwrap();
            assert_eq!(token.credits_remaining, expected);
            ledger.commit(token).await.unwrap();
        }

        let account = store.account(user).await.unwrap().unwrap();
        assert_eq!(account.credits_remaining, 5);
    }

    #[tokio::test]
    async fn test_exhausted_when_balance_too_low() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let user = Uuid::new_v4();
        let period = BillingPeriod::new(2025, 2).unwrap();
        store.insert_account(user, 0, period);
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));

        let err = ledger.reserve(user, 1).await.unwrap_err();
        assert!(matches!(err, QuotaError::Exhausted { credits_remaining: 0 }));

        // A failed reservation leaves the account untouched
        let account = store.account(user).await.unwrap().unwrap();
        assert_eq!(account.credits_remaining, 0);
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let ledger = ledger_at(Arc::new(InMemoryQuotaStore::new()), Arc::new(FixedClock::at_period(2025, 2)));
        assert!(matches!(ledger.reserve(Uuid::new_v4(), 0).await, Err(QuotaError::InvalidAmount(0))));
        assert!(matches!(ledger.reserve(Uuid::new_v4(), -3).await, Err(QuotaError::InvalidAmount(-3))));
    }

    #[tokio::test]
    async fn test_release_returns_credit() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));
        let user = Uuid::new_v4();

        let token = ledger.reserve(user, 1).await.unwrap();
        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 9);

        ledger.release(token).await.unwrap();
        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 10);
    }

    #[tokio::test]
    async fn test_resolving_twice_is_a_no_op() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));
        let user = Uuid::new_v4();

        let token = ledger.reserve(user, 1).await.unwrap();
        let id = token.id;
        ledger.release(token).await.unwrap();

        // A second release or a late commit must not move the balance
        assert_eq!(store.release(id).await.unwrap(), Resolution::AlreadyResolved);
        assert_eq!(store.commit(id).await.unwrap(), Resolution::AlreadyResolved);
        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 10);
    }

    #[tokio::test]
    async fn test_release_after_period_rollover_does_not_top_up() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let clock = Arc::new(FixedClock::at_period(2025, 1));
        let ledger = ledger_at(store.clone(), clock.clone());
        let user = Uuid::new_v4();

        let token = ledger.reserve(user, 1).await.unwrap();

        // Month rolls over while the classifier call is in flight; the next reserve resets
        clock.set_period(2025, 2);
        let next = ledger.reserve(user, 1).await.unwrap();
        ledger.commit(next).await.unwrap();

        ledger.release(token).await.unwrap();
        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 9);
    }

    #[tokio::test]
    async fn test_peek_reports_reset_without_writing() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let user = Uuid::new_v4();
        let january = BillingPeriod::new(2025, 1).unwrap();
        store.insert_account(user, 2, january);
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));

        let balance = ledger.peek(user).await.unwrap();
        assert_eq!(balance.credits_remaining, 10);
        assert_eq!(balance.period.to_string(), "2025-02");

        let stored = store.account(user).await.unwrap().unwrap();
        assert_eq!(stored.credits_remaining, 2);
        assert_eq!(stored.last_reset_period, january);
    }

    #[tokio::test]
    async fn test_peek_unknown_user_reports_allowance() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));
        let user = Uuid::new_v4();

        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 10);
        assert!(store.account(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_overspend() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let user = Uuid::new_v4();
        store.insert_account(user, 3, BillingPeriod::new(2025, 2).unwrap());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));

        let attempts: Vec<_> = (0..20)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve(user, 1).await })
            })
            .collect();

        let mut succeeded = 0;
        let mut exhausted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(token) => {
                    succeeded += 1;
                    ledger.commit(token).await.unwrap();
                }
                Err(QuotaError::Exhausted { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(succeeded, 3);
        assert_eq!(exhausted, 17);
        assert_eq!(store.account(user).await.unwrap().unwrap().credits_remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_reset_stale_period_once() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let user = Uuid::new_v4();
        store.insert_account(user, 0, BillingPeriod::new(2025, 1).unwrap());
        let ledger = ledger_at(store.clone(), Arc::new(FixedClock::at_period(2025, 2)));

        let attempts: Vec<_> = (0..15)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve(user, 1).await })
            })
            .collect();

        let mut succeeded = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(token) => {
                    succeeded += 1;
                    ledger.commit(token).await.unwrap();
                }
                Err(QuotaError::Exhausted { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        // A second reset would have granted more than one allowance
        assert_eq!(succeeded, 10);
        let account = store.account(user).await.unwrap().unwrap();
        assert_eq!(account.credits_remaining, 10 - succeeded);
        assert_eq!(account.last_reset_period, BillingPeriod::new(2025, 2).unwrap());
    }

    #[tokio::test]
    async fn test_release_stale_reservations() {
        let clock = Arc::new(FixedClock::at_period(2025, 2));
        let store = Arc::new(InMemoryQuotaStore::with_clock(clock.clone()));
        let ledger = ledger_at(store.clone(), clock.clone());
        let user = Uuid::new_v4();

        // Simulate a request that never resolved its reservation
        let abandoned = ledger.reserve(user, 1).await.unwrap();
        let resolved = ledger.reserve(user, 1).await.unwrap();
        ledger.commit(resolved).await.unwrap();
        std::mem::drop(abandoned);

        clock.advance(chrono::Duration::minutes(30));
        let released = ledger.release_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(ledger.peek(user).await.unwrap().credits_remaining, 9);

        // Nothing left to sweep
        assert_eq!(ledger.release_stale(Duration::from_secs(600)).await.unwrap(), 0);
    }
}
