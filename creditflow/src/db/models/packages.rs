//! Database models for the credit package catalog.

use crate::types::PackageId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A catalog entry. Orders snapshot its price and credit count at creation,
/// so later edits to a package never change what an existing order owes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: PackageId,
    pub name: String,
    pub price: Decimal,
    pub credits: i64,
    pub bonus_credits: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CreditPackage {
    /// Credits granted for one purchase: base plus bonus
    pub fn total_credits(&self) -> i64 {
        self.credits + self.bonus_credits
    }
}

#[derive(Debug, Clone)]
pub struct PackageCreateDBRequest {
    pub name: String,
    pub price: Decimal,
    pub credits: i64,
    pub bonus_credits: i64,
    pub is_active: bool,
}
