//! Caller identity.
//!
//! Authentication happens upstream. A trusted proxy forwards the caller's id
//! in `x-creditflow-user` and, for back-office staff, `x-creditflow-role:
//! admin`. Handlers take [`CurrentUser`] or [`AdminUser`] as extractors.

pub mod current_user;

pub use current_user::{AdminUser, CurrentUser};

pub const USER_HEADER: &str = "x-creditflow-user";
pub const ROLE_HEADER: &str = "x-creditflow-role";
pub const ADMIN_ROLE: &str = "admin";
