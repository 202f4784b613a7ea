//! Usage Tracking Module
//!
//! Daily usage/cost ledger with per-resource limits, pluggable provider
//! pricing and one persisted document per usage day.

mod ledger;
mod models;
mod pricing;
mod store;

pub use ledger::*;
pub use models::*;
pub use pricing::*;
pub use store::*;
