pub mod db;
pub mod domain;
pub mod error;
pub mod store;
pub mod validate;

pub use error::{ErrorCategory, LedgerError, Result};
pub use store::{FormulaStore, InMemoryStore, MeterStore, Page};
