//! API request and response models. Kept apart from the ledger rows so the
//! wire format can evolve on its own.

pub mod orders;
pub mod packages;
pub mod pagination;
pub mod payments;
