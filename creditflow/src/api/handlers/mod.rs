//! Axum route handlers, one module per resource.
//!
//! - [`packages`]: credit package catalog
//! - [`payments`]: payment initiation and history
//! - [`webhooks`]: hosted checkout webhook
//! - [`orders`]: admin order reporting and manual grants
//!
//! Handlers return [`crate::errors::Error`], which renders the JSON error
//! envelope with its machine-readable code.

pub mod orders;
pub mod packages;
pub mod payments;
pub mod webhooks;
