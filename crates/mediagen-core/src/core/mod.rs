//! Mediagen Core
//!
//! Core pipeline modules.
//! Leaves first: cache and fingerprinting, then uploads and queue transport,
//! then the job executor, the usage ledger and the pipeline facade.

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod jobs;
pub mod pipeline;
pub mod queue;
pub mod uploads;
pub mod usage;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_recovery;
