use meter_ledger::{
    domain::{MeterId, PropertyId, Reading},
    error::NotFound,
    MeterStore, Page, Result,
};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use super::{unmetered::compute_unmetered, AllocationEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmeterReading {
    pub name: String,
    pub meter_id: MeterId,
    pub location: Option<String>,
    pub value: Decimal,
}

/// Meter values of a property recorded at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyReadingSummary {
    pub property_id: PropertyId,
    #[serde(with = "time::serde::rfc3339")]
    pub reading_timestamp: OffsetDateTime,
    pub main_meter: Option<Decimal>,
    /// Submeters that have a reading at this instant.
    pub submeters: Vec<SubmeterReading>,
    /// Main value minus submeter values, clamped at zero; absent without a
    /// main reading.
    pub unmetered: Option<Decimal>,
}

/// One page of a meter's readings, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingHistory {
    pub meter_id: MeterId,
    pub readings: Vec<Reading>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<'a, S: MeterStore> AllocationEngine<'a, S> {
    pub fn reading_summary_at(&self, property_id: PropertyId, at: OffsetDateTime) -> Result<PropertyReadingSummary> {
        self.require_property(property_id)?;

        let main_meter = self
            .store
            .get_main_meter(property_id)
            .and_then(|main| self.store.get_reading_at(main.id, at, None))
            .map(|r| r.value);

        let submeters: Vec<SubmeterReading> = self
            .store
            .list_submeters(property_id)
            .into_iter()
            .filter_map(|meter| {
                let reading = self.store.get_reading_at(meter.id, at, None)?;
                Some(SubmeterReading {
                    name: meter.display_name(),
                    meter_id: meter.id,
                    location: meter.location,
                    value: reading.value,
                })
            })
            .collect();

        let values: Vec<Decimal> = submeters.iter().map(|s| s.value).collect();
        let unmetered = compute_unmetered(main_meter, &values);

        Ok(PropertyReadingSummary {
            property_id,
            reading_timestamp: at,
            main_meter,
            submeters,
            unmetered,
        })
    }

    /// Summary at the newest reading timestamp of any meter of the property,
    /// or `None` when the property has no readings yet.
    pub fn latest_reading_summary(&self, property_id: PropertyId) -> Result<Option<PropertyReadingSummary>> {
        self.require_property(property_id)?;

        let latest = self
            .store
            .get_main_meter(property_id)
            .into_iter()
            .chain(self.store.list_submeters(property_id))
            .filter_map(|meter| self.store.latest_reading(meter.id))
            .map(|r| r.taken_at)
            .max();

        match latest {
            Some(at) => self.reading_summary_at(property_id, at).map(Some),
            None => Ok(None),
        }
    }

    pub fn meter_history(&self, meter_id: MeterId, page: Page) -> Result<ReadingHistory> {
        if self.store.get_meter(meter_id).is_none() {
            return Err(NotFound::Meter(meter_id).into());
        }
        let (readings, total) = self.store.reading_history(meter_id, page);
        Ok(ReadingHistory {
            meter_id,
            readings,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }
}
