//! Common type definitions.
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`UserId`]: purchasing account
//! - [`OrderId`]: one purchase attempt
//! - [`PackageId`]: credit package catalog entry
//! - [`JobId`]: fulfillment job record
//!
//! The closed sets that drive the payment pipeline live here too, since the
//! ledger, the gateways, the job and the HTTP layer all speak them:
//! [`PaymentPlatform`], [`OrderStatus`] and [`FulfillmentSource`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

pub type UserId = Uuid;
pub type OrderId = Uuid;
pub type PackageId = Uuid;
pub type JobId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Payment rails an order can be placed through.
///
/// The set is closed: every place that acts on a platform matches exhaustively,
/// so adding a rail is a compile error until every handler covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPlatform {
    /// Hosted card checkout, completed asynchronously by webhook
    HostedCheckout,
    MobileWalletA,
    MobileWalletB,
    MobileWalletC,
    /// Trusted grant, credited synchronously with no external confirmation
    Manual,
    /// Bank transfer reconciled out of band
    DeferredBank,
}

impl PaymentPlatform {
    pub const ALL: [PaymentPlatform; 6] = [
        Self::HostedCheckout,
        Self::MobileWalletA,
        Self::MobileWalletB,
        Self::MobileWalletC,
        Self::Manual,
        Self::DeferredBank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostedCheckout => "hosted_checkout",
            Self::MobileWalletA => "mobile_wallet_a",
            Self::MobileWalletB => "mobile_wallet_b",
            Self::MobileWalletC => "mobile_wallet_c",
            Self::Manual => "manual",
            Self::DeferredBank => "deferred_bank",
        }
    }

    pub fn is_mobile_wallet(&self) -> bool {
        matches!(self, Self::MobileWalletA | Self::MobileWalletB | Self::MobileWalletC)
    }
}

impl fmt::Display for PaymentPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unsupported payment platform: {s}"))
    }
}

/// Order lifecycle.
///
/// `Pending -> Processing -> {Completed | Failed}`; `Processing` may be entered
/// directly. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same non-terminal state is allowed (idempotent writes).
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Pending | Processing | Completed | Failed) => true,
            (Processing, Processing | Completed | Failed) => true,
            (Processing, Pending) => false,
            (Completed | Failed, _) => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown order status: {s}")),
        }
    }
}

/// Which channel asked for credits to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentSource {
    /// Hosted checkout webhook
    Checkout,
    /// Mobile wallet and other local rails confirmed synchronously
    Local,
    /// Back-office grant
    Admin,
}

impl FulfillmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Local => "local",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for FulfillmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FulfillmentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkout" => Ok(Self::Checkout),
            "local" => Ok(Self::Local),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("Unknown fulfillment source: {s}")),
        }
    }
}
