//! Database models: the rows the ledger reads and writes, and the request
//! types used to create them.

pub mod orders;
pub mod packages;
pub mod users;
