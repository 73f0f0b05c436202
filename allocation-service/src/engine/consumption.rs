use std::collections::BTreeMap;

use meter_ledger::{
    domain::{Meter, MeterId, Period, PropertyId, ReadingType, TermKey, UNMETERED_KEY},
    error::NotFound,
    MeterStore, Result,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    unmetered::{compute_unmetered, residual},
    AllocationEngine,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmeterConsumption {
    pub name: String,
    /// `None` for the synthetic unmetered entry.
    pub meter_id: Option<MeterId>,
    pub location: Option<String>,
    pub consumption: Decimal,
    pub is_virtual: bool,
}

/// Consumption of one property over one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumptionSummary {
    pub property_id: PropertyId,
    pub period: Period,
    pub main_meter_consumption: Option<Decimal>,
    /// Physical submeters with data, followed by a virtual `_unmetered` entry
    /// when the residual is positive.
    pub submeters: Vec<SubmeterConsumption>,
    pub total_submetered_consumption: Decimal,
    pub unmetered_consumption: Option<Decimal>,
    /// Submetered total exceeded the main meter and the residual was clamped.
    pub submetered_exceeds_main: bool,
}

impl ConsumptionSummary {
    pub fn physical_submeters(&self) -> impl Iterator<Item = &SubmeterConsumption> {
        self.submeters.iter().filter(|s| !s.is_virtual)
    }

    /// Name-to-consumption map that cost formulas are evaluated against.
    pub fn consumption_map(&self) -> ConsumptionMap {
        let mut map = ConsumptionMap::default();
        for sub in self.physical_submeters() {
            map.insert(TermKey::Meter(sub.name.clone()), sub.consumption);
        }
        if let Some(unmetered) = self.unmetered_consumption {
            map.insert(TermKey::Unmetered, unmetered);
        }
        map
    }
}

/// Consumption keyed by submeter name, plus `_unmetered` when it is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConsumptionMap(BTreeMap<TermKey, Decimal>);

impl ConsumptionMap {
    pub fn insert(&mut self, key: TermKey, consumption: Decimal) {
        self.0.insert(key, consumption);
    }

    /// Consumption for `key`, or zero when the map has no entry for it.
    pub fn get_or_zero(&self, key: &TermKey) -> Decimal {
        self.0.get(key).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn get(&self, key: &TermKey) -> Option<Decimal> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>> FromIterator<(K, Decimal)> for ConsumptionMap {
    fn from_iter<I: IntoIterator<Item = (K, Decimal)>>(iter: I) -> Self {
        let mut map = ConsumptionMap::default();
        for (name, consumption) in iter {
            let key = match name.as_ref() {
                UNMETERED_KEY => TermKey::Unmetered,
                other => TermKey::Meter(other.to_string()),
            };
            map.insert(key, consumption);
        }
        map
    }
}

impl<'a, S: MeterStore> AllocationEngine<'a, S> {
    /// Consumption of one meter over `period`, or `None` when there is no data.
    ///
    /// Precedence:
    /// 1. absolute readings taken exactly at `period.start` and `period.end`:
    ///    `end - start`. No interpolation.
    /// 2. otherwise the sum of relative readings in `(start, end]`.
    /// 3. otherwise `None`, which is distinct from a zero consumption.
    pub fn meter_consumption(&self, meter_id: MeterId, period: &Period) -> Result<Option<Decimal>> {
        if self.store.get_meter(meter_id).is_none() {
            return Err(NotFound::Meter(meter_id).into());
        }
        Ok(self.consumption_of(meter_id, period))
    }

    fn consumption_of(&self, meter_id: MeterId, period: &Period) -> Option<Decimal> {
        let start = self
            .store
            .get_reading_at(meter_id, period.start, Some(ReadingType::Absolute));
        let end = self
            .store
            .get_reading_at(meter_id, period.end, Some(ReadingType::Absolute));

        if let (Some(start), Some(end)) = (start, end) {
            return Some(end.value - start.value);
        }

        let relative = self
            .store
            .list_readings(meter_id, ReadingType::Relative, period.relative_window());
        if relative.is_empty() {
            debug!(meter_id = %meter_id, "no readings cover the period");
            return None;
        }

        debug!(
            meter_id = %meter_id,
            readings = relative.len(),
            "using relative readings for the period"
        );
        Some(relative.iter().map(|r| r.value).sum())
    }

    /// Main, submetered and unmetered consumption of a property.
    pub fn property_consumption(&self, property_id: PropertyId, period: &Period) -> Result<ConsumptionSummary> {
        self.require_property(property_id)?;

        let main_meter_consumption = self
            .store
            .get_main_meter(property_id)
            .and_then(|main| self.consumption_of(main.id, period));

        let mut submeters = Vec::new();
        let mut total_submetered = Decimal::ZERO;

        for meter in self
            .store
            .list_submeters(property_id)
            .into_iter()
            .filter(Meter::is_physical_submeter)
        {
            if let Some(consumption) = self.consumption_of(meter.id, period) {
                total_submetered += consumption;
                submeters.push(SubmeterConsumption {
                    name: meter.display_name(),
                    meter_id: Some(meter.id),
                    location: meter.location,
                    consumption,
                    is_virtual: false,
                });
            }
        }

        let unmetered = compute_unmetered(main_meter_consumption, &[total_submetered]);
        let submetered_exceeds_main =
            flag_meter_disagreement(property_id, main_meter_consumption, total_submetered);

        if let Some(unmetered) = unmetered.filter(|u| *u > Decimal::ZERO) {
            submeters.push(SubmeterConsumption {
                name: UNMETERED_KEY.to_string(),
                meter_id: None,
                location: None,
                consumption: unmetered,
                is_virtual: true,
            });
        }

        Ok(ConsumptionSummary {
            property_id,
            period: *period,
            main_meter_consumption,
            submeters,
            total_submetered_consumption: total_submetered,
            unmetered_consumption: unmetered,
            submetered_exceeds_main,
        })
    }

    pub fn consumption_map(&self, property_id: PropertyId, period: &Period) -> Result<ConsumptionMap> {
        Ok(self.property_consumption(property_id, period)?.consumption_map())
    }
}

fn flag_meter_disagreement(property_id: PropertyId, main: Option<Decimal>, submetered: Decimal) -> bool {
    match residual(main, &[submetered]) {
        Some(raw) if raw < Decimal::ZERO => {
            warn!(
                property_id = %property_id,
                main = ?main,
                submetered = %submetered,
                "submetered consumption exceeds main meter; unmetered clamped to zero"
            );
            metrics::counter!("unmetered_clamped_total").increment(1);
            true
        }
        _ => false,
    }
}
