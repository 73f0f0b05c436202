//! Point-in-time snapshot loaders.
//!
//! A source materialises one property (meters, readings, formulas) into an
//! [`InMemoryStore`] so that a whole computation runs against a single
//! consistent view.

pub mod csv_files;
pub mod postgres;

pub use csv_files::CsvSnapshotSource;
pub use postgres::PgSnapshotSource;

use meter_ledger::{domain::PropertyId, InMemoryStore, LedgerError};

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("database error: {0}")]
    Database(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SourceError {
    /// Ledger condition string, when the failure came from the ledger itself.
    pub fn condition(&self) -> Option<&'static str> {
        match self {
            SourceError::Ledger(e) => Some(e.condition()),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Loads one property and everything attached to it.
    async fn load(&self, property_id: PropertyId) -> Result<InMemoryStore, SourceError>;
}
