//! Observability: tracing/logging initialization for coopledger processes.

pub mod tracing;

pub use tracing::init;
