//! Database record models matching table schemas.
//!
//! These structs directly correspond to database table rows and derive `sqlx::FromRow`.
//! They are kept separate from the domain types in [`crate::quota`] so that storage and
//! API representations can evolve independently.
//!
//! - [`quota`]: Monthly quota accounts and the reservations held against them

pub mod quota;
