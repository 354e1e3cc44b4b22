//! Database models for purchasing accounts.
//!
//! Accounts themselves are managed elsewhere; the pipeline only needs the
//! balance counter and the contact details for the confirmation email.

use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// Current credit balance. Only ever changed by atomic increments.
    pub credits: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UserCreateDBRequest {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub credits: i64,
}
