//! Read-side interfaces the allocation engine consumes.
//!
//! Implementations must answer every call of one computation from the same
//! consistent snapshot; the engine does not coordinate with writers.

pub mod memory;

pub use memory::{BulkReading, FormulaUpdate, InMemoryStore, MeterUpdate, NewFormula, ReadingUpdate};

use time::OffsetDateTime;

use crate::domain::{
    CostFormula, FormulaId, Meter, MeterId, PropertyId, Reading, ReadingType, ReadingWindow,
};

/// Offset pagination for reading history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

pub trait MeterStore {
    fn has_property(&self, property_id: PropertyId) -> bool;

    fn get_meter(&self, meter_id: MeterId) -> Option<Meter>;

    fn get_main_meter(&self, property_id: PropertyId) -> Option<Meter>;

    /// All submeters of a property, physical and virtual, in id order.
    fn list_submeters(&self, property_id: PropertyId) -> Vec<Meter>;

    /// Reading taken exactly at `at`. When several match, the first recorded
    /// wins. `reading_type = None` matches either type.
    fn get_reading_at(
        &self,
        meter_id: MeterId,
        at: OffsetDateTime,
        reading_type: Option<ReadingType>,
    ) -> Option<Reading>;

    /// Readings of one type whose timestamp falls inside `window`, oldest first.
    fn list_readings(
        &self,
        meter_id: MeterId,
        reading_type: ReadingType,
        window: ReadingWindow,
    ) -> Vec<Reading>;

    /// Newest reading of the meter by `taken_at`.
    fn latest_reading(&self, meter_id: MeterId) -> Option<Reading>;

    /// Newest-first page of readings, with the meter's total reading count.
    fn reading_history(&self, meter_id: MeterId, page: Page) -> (Vec<Reading>, usize);
}

pub trait FormulaStore {
    fn get_formula(&self, formula_id: FormulaId) -> Option<CostFormula>;

    fn list_formulas(&self, property_id: PropertyId, active_only: bool) -> Vec<CostFormula>;
}
