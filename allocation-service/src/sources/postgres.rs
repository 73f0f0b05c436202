use meter_ledger::{
    db::{fetch_formulas, fetch_meters, fetch_property, fetch_readings},
    domain::{MeterId, PropertyId},
    error::NotFound,
    InMemoryStore, LedgerError,
};
use sqlx::PgPool;
use tracing::info;

use super::{SnapshotSource, SourceError};

/// Loads a property from the ledger database inside one `REPEATABLE READ`
/// transaction, so every table is read at the same point in time.
///
/// Reading rows are trusted: the ledger validated them when they were
/// written. Only the structural invariants enforced by `InMemoryStore`
/// insertion are checked here.
pub struct PgSnapshotSource {
    pool: PgPool,
}

impl PgSnapshotSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: impl std::fmt::Display) -> SourceError {
    SourceError::Database(e.to_string())
}

#[async_trait::async_trait]
impl SnapshotSource for PgSnapshotSource {
    async fn load(&self, property_id: PropertyId) -> Result<InMemoryStore, SourceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let property = fetch_property(&mut *tx, property_id)
            .await
            .map_err(db_err)?
            .ok_or_else(|| LedgerError::from(NotFound::Property(property_id)))?;
        let meters = fetch_meters(&mut *tx, property_id).await.map_err(db_err)?;
        let meter_ids: Vec<MeterId> = meters.iter().map(|m| m.id).collect();
        let readings = fetch_readings(&mut *tx, &meter_ids).await.map_err(db_err)?;
        let formulas = fetch_formulas(&mut *tx, property_id).await.map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let mut store = InMemoryStore::new();
        store.insert_property(property);
        let meter_count = meters.len();
        for meter in meters {
            store.insert_meter(meter)?;
        }
        let reading_count = readings.len();
        for reading in readings {
            store.insert_reading(reading)?;
        }
        for formula in formulas {
            store.insert_formula(formula)?;
        }

        info!(
            property_id = %property_id,
            meters = meter_count,
            readings = reading_count,
            "loaded Postgres snapshot"
        );
        Ok(store)
    }
}
