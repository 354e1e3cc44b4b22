//! Persistence layer.
//!
//! - [`ledger`]: the [`Ledger`](ledger::Ledger) trait and its Postgres and
//!   in-memory implementations
//! - [`models`]: records the ledger reads and writes
//! - [`errors`]: storage error type shared by every backend

pub mod errors;
pub mod ledger;
pub mod models;
