//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection or transaction, provides strongly-typed operations
//! and returns models from [`crate::db::models`].
//!
//! - [`QuotaAccounts`]: Quota balances and reservation records
//!
//! ```ignore
//! use gymvision::db::handlers::QuotaAccounts;
//!
//! async fn example(pool: &sqlx::PgPool, user_id: uuid::Uuid) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     let mut repo = QuotaAccounts::new(&mut tx);
//!
//!     repo.ensure_current_period(user_id, "2025-02", 10).await?;
//!     let account = repo.try_decrement(user_id, 1).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod quota_accounts;

pub use quota_accounts::QuotaAccounts;
