use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::packages::CreditPackage;
use crate::types::PackageId;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PackageResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: PackageId,
    pub name: String,
    #[schema(value_type = f64)]
    pub price: Decimal,
    pub credits: i64,
    pub bonus_credits: i64,
    /// Credits granted per purchase: base plus bonus
    pub total_credits: i64,
}

impl From<CreditPackage> for PackageResponse {
    fn from(package: CreditPackage) -> Self {
        Self {
            total_credits: package.total_credits(),
            id: package.id,
            name: package.name,
            price: package.price,
            credits: package.credits,
            bonus_credits: package.bonus_credits,
        }
    }
}
