pub mod cli;
pub mod config;
pub mod engine;
pub mod metrics_export;
pub mod observability;
pub mod sources;

pub use engine::{AllocationEngine, CostDistributionResult, RemainderPolicy};
