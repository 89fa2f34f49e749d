use crate::quota::QuotaBalance;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuotaResponse {
    /// Credits left in the current billing month
    pub credits_remaining: i32,
    /// Credits granted at the start of every month
    pub monthly_allowance: i32,
    /// Current billing month
    #[schema(example = "2025-02")]
    pub period: String,
}

impl From<QuotaBalance> for QuotaResponse {
    fn from(balance: QuotaBalance) -> Self {
        Self {
            credits_remaining: balance.credits_remaining,
            monthly_allowance: balance.monthly_allowance,
            period: balance.period.to_string(),
        }
    }
}
