use std::collections::BTreeMap;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{FormulaStore, MeterStore, Page};
use crate::{
    domain::{
        CostFormula, FormulaId, FormulaStatus, FormulaTerms, Meter, MeterId, MeterRole, Property,
        PropertyId, Reading, ReadingId, ReadingType, ReadingWindow, SubmeterKind, UserId,
        UNMETERED_KEY,
    },
    error::{NotFound, Result, ValidationFailure},
    validate::{validate_reading, NewReading},
};

/// Readings for a whole property taken at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReading {
    pub property_id: PropertyId,
    pub taken_at: OffsetDateTime,
    pub reading_type: ReadingType,
    pub main_value: Decimal,
    pub submeter_values: BTreeMap<String, Decimal>,
    pub recorded_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFormula {
    pub property_id: PropertyId,
    pub name: String,
    pub description: Option<String>,
    pub terms: FormulaTerms,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterUpdate {
    pub name: Option<String>,
    pub location: Option<String>,
    pub is_active: Option<bool>,
}

/// Corrected value and/or timestamp for an existing reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadingUpdate {
    pub value: Option<Decimal>,
    pub taken_at: Option<OffsetDateTime>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormulaUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub terms: Option<FormulaTerms>,
    pub is_active: Option<bool>,
}

/// Snapshot of one or more properties held in memory.
///
/// Serves the engine's read traits and enforces the registry invariants on
/// every insert: one main meter per property, unique submeter names, no
/// readings against virtual meters. Readings keep insertion order so that
/// "first found" lookups are deterministic.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    properties: BTreeMap<PropertyId, Property>,
    meters: BTreeMap<MeterId, Meter>,
    readings: Vec<Reading>,
    formulas: BTreeMap<FormulaId, CostFormula>,
    next_property_id: i64,
    next_meter_id: i64,
    next_reading_id: i64,
    next_formula_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ----- properties -----

    /// Insert a property loaded from elsewhere, keeping its id.
    pub fn insert_property(&mut self, property: Property) {
        self.next_property_id = self.next_property_id.max(property.id.0 + 1);
        self.properties.insert(property.id, property);
    }

    /// Create a property together with its main meter.
    pub fn add_property(&mut self, display_name: &str, address: Option<String>) -> Result<(Property, Meter)> {
        let property = Property {
            id: PropertyId(self.next_property_id.max(1)),
            display_name: display_name.to_string(),
            address,
        };
        self.insert_property(property.clone());
        let main = self.add_main_meter(property.id)?;
        Ok((property, main))
    }

    pub fn get_property(&self, property_id: PropertyId) -> Result<&Property> {
        self.properties
            .get(&property_id)
            .ok_or_else(|| NotFound::Property(property_id).into())
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    // ----- meters -----

    /// Insert a meter loaded from elsewhere, keeping its id.
    ///
    /// Loaded submeters may be unnamed; they are keyed by id in consumption
    /// maps. Names that are present must still be valid and unique.
    pub fn insert_meter(&mut self, meter: Meter) -> Result<()> {
        if !self.properties.contains_key(&meter.property_id) {
            return Err(NotFound::Property(meter.property_id).into());
        }

        match meter.role {
            MeterRole::Main => {
                if self.main_meter(meter.property_id).is_some() {
                    return Err(ValidationFailure::DuplicateMainMeter(meter.property_id).into());
                }
            }
            MeterRole::Submeter(_) => {
                if let Some(name) = meter.name.as_deref() {
                    self.check_submeter_name(meter.property_id, name, None)?;
                }
            }
        }

        self.next_meter_id = self.next_meter_id.max(meter.id.0 + 1);
        self.meters.insert(meter.id, meter);
        Ok(())
    }

    pub fn add_main_meter(&mut self, property_id: PropertyId) -> Result<Meter> {
        let meter = Meter {
            id: MeterId(self.next_meter_id.max(1)),
            property_id,
            role: MeterRole::Main,
            name: None,
            location: None,
            is_active: true,
        };
        self.insert_meter(meter.clone())?;
        Ok(meter)
    }

    pub fn add_submeter(
        &mut self,
        property_id: PropertyId,
        name: &str,
        kind: SubmeterKind,
        location: Option<String>,
    ) -> Result<Meter> {
        let meter = Meter {
            id: MeterId(self.next_meter_id.max(1)),
            property_id,
            role: MeterRole::Submeter(kind),
            name: Some(name.to_string()),
            location,
            is_active: true,
        };
        self.insert_meter(meter.clone())?;
        Ok(meter)
    }

    pub fn update_meter(&mut self, meter_id: MeterId, update: MeterUpdate) -> Result<Meter> {
        let mut updated = self
            .meters
            .get(&meter_id)
            .ok_or(NotFound::Meter(meter_id))?
            .clone();

        if let Some(name) = update.name {
            if updated.is_main() {
                return Err(ValidationFailure::NamedMainMeter.into());
            }
            self.check_submeter_name(updated.property_id, &name, Some(meter_id))?;
            updated.name = Some(name);
        }
        if let Some(location) = update.location {
            updated.location = Some(location);
        }
        if let Some(is_active) = update.is_active {
            updated.is_active = is_active;
        }

        self.meters.insert(meter_id, updated.clone());
        Ok(updated)
    }

    /// Soft delete: existing readings stay and still count towards
    /// consumption, new readings are refused.
    pub fn deactivate_meter(&mut self, meter_id: MeterId) -> Result<Meter> {
        self.update_meter(
            meter_id,
            MeterUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
    }

    /// Remove a meter and every reading recorded against it.
    pub fn remove_meter(&mut self, meter_id: MeterId) -> Result<Meter> {
        let meter = self
            .meters
            .remove(&meter_id)
            .ok_or(NotFound::Meter(meter_id))?;
        let before = self.readings.len();
        self.readings.retain(|r| r.meter_id != meter_id);
        debug!(
            meter_id = %meter_id,
            removed_readings = before - self.readings.len(),
            "meter removed"
        );
        Ok(meter)
    }

    fn check_submeter_name(&self, property_id: PropertyId, name: &str, except: Option<MeterId>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ValidationFailure::BlankMeterName.into());
        }
        if name == UNMETERED_KEY {
            return Err(ValidationFailure::ReservedMeterName(name.to_string()).into());
        }
        if self
            .submeter_by_name(property_id, name)
            .is_some_and(|m| Some(m.id) != except)
        {
            return Err(ValidationFailure::DuplicateSubmeterName(name.to_string()).into());
        }
        Ok(())
    }

    fn main_meter(&self, property_id: PropertyId) -> Option<&Meter> {
        self.meters
            .values()
            .find(|m| m.property_id == property_id && m.is_main())
    }

    fn submeter_by_name(&self, property_id: PropertyId, name: &str) -> Option<&Meter> {
        self.meters
            .values()
            .find(|m| m.property_id == property_id && !m.is_main() && m.name.as_deref() == Some(name))
    }

    // ----- readings -----

    /// Insert a reading loaded from elsewhere, keeping its id. Only the meter
    /// reference and kind are checked; the row was validated when it was
    /// first recorded.
    pub fn insert_reading(&mut self, reading: Reading) -> Result<()> {
        let meter = self
            .meters
            .get(&reading.meter_id)
            .ok_or(NotFound::Meter(reading.meter_id))?;
        if meter.is_virtual() {
            return Err(ValidationFailure::VirtualMeterReading(meter.id).into());
        }
        self.next_reading_id = self.next_reading_id.max(reading.id.0 + 1);
        self.readings.push(reading);
        Ok(())
    }

    pub fn record_reading(&mut self, new: NewReading, now: OffsetDateTime) -> Result<Reading> {
        self.validate_new_reading(&new, now)?;
        Ok(self.push_reading(new, now))
    }

    /// Record the main meter and named submeters at one timestamp.
    ///
    /// Every reading is validated before any is stored; one bad value rejects
    /// the whole batch.
    pub fn record_bulk_readings(&mut self, bulk: BulkReading, now: OffsetDateTime) -> Result<Vec<Reading>> {
        let main = self
            .main_meter(bulk.property_id)
            .ok_or(NotFound::MainMeter(bulk.property_id))?;

        let mut batch = vec![NewReading {
            meter_id: main.id,
            value: bulk.main_value,
            taken_at: bulk.taken_at,
            reading_type: bulk.reading_type,
            recorded_by: bulk.recorded_by,
        }];

        for (name, value) in &bulk.submeter_values {
            if name.trim().is_empty() {
                return Err(ValidationFailure::BlankMeterName.into());
            }
            let submeter = self
                .submeter_by_name(bulk.property_id, name)
                .ok_or_else(|| NotFound::Submeter {
                    property_id: bulk.property_id,
                    name: name.clone(),
                })?;
            batch.push(NewReading {
                meter_id: submeter.id,
                value: *value,
                taken_at: bulk.taken_at,
                reading_type: bulk.reading_type,
                recorded_by: bulk.recorded_by,
            });
        }

        for new in &batch {
            self.validate_new_reading(new, now)?;
        }

        Ok(batch.into_iter().map(|new| self.push_reading(new, now)).collect())
    }

    fn validate_new_reading(&self, new: &NewReading, now: OffsetDateTime) -> Result<()> {
        let meter = self
            .meters
            .get(&new.meter_id)
            .ok_or(NotFound::Meter(new.meter_id))?;
        if !meter.is_active {
            return Err(ValidationFailure::InactiveMeterReading(meter.id).into());
        }
        let history: Vec<Reading> = self
            .readings
            .iter()
            .filter(|r| r.meter_id == new.meter_id)
            .cloned()
            .collect();

        validate_reading(new, meter, &history, now)?;

        if history
            .iter()
            .any(|r| r.taken_at == new.taken_at && r.reading_type == new.reading_type)
        {
            warn!(
                meter_id = %new.meter_id,
                taken_at = %new.taken_at,
                "duplicate reading at an existing timestamp; lookups keep the first one"
            );
        }
        Ok(())
    }

    fn push_reading(&mut self, new: NewReading, now: OffsetDateTime) -> Reading {
        let reading = Reading {
            id: ReadingId(self.next_reading_id.max(1)),
            meter_id: new.meter_id,
            value: new.value,
            taken_at: new.taken_at,
            recorded_at: now,
            reading_type: new.reading_type,
            recorded_by: new.recorded_by,
        };
        self.next_reading_id = reading.id.0 + 1;
        self.readings.push(reading.clone());
        reading
    }

    /// Correct a reading in place. The result is validated against the
    /// meter's other readings, so a correction cannot break monotonicity.
    pub fn update_reading(
        &mut self,
        reading_id: ReadingId,
        update: ReadingUpdate,
        now: OffsetDateTime,
    ) -> Result<Reading> {
        let idx = self
            .readings
            .iter()
            .position(|r| r.id == reading_id)
            .ok_or(NotFound::Reading(reading_id))?;
        let current = &self.readings[idx];
        let meter = self
            .meters
            .get(&current.meter_id)
            .ok_or(NotFound::Meter(current.meter_id))?;

        let candidate = NewReading {
            meter_id: current.meter_id,
            value: update.value.unwrap_or(current.value),
            taken_at: update.taken_at.unwrap_or(current.taken_at),
            reading_type: current.reading_type,
            recorded_by: current.recorded_by,
        };
        let others: Vec<Reading> = self
            .readings
            .iter()
            .filter(|r| r.meter_id == candidate.meter_id && r.id != reading_id)
            .cloned()
            .collect();
        validate_reading(&candidate, meter, &others, now)?;

        let reading = &mut self.readings[idx];
        reading.value = candidate.value;
        reading.taken_at = candidate.taken_at;
        debug!(reading_id = %reading_id, "reading updated");
        Ok(reading.clone())
    }

    pub fn delete_reading(&mut self, reading_id: ReadingId) -> Result<Reading> {
        let idx = self
            .readings
            .iter()
            .position(|r| r.id == reading_id)
            .ok_or(NotFound::Reading(reading_id))?;
        Ok(self.readings.remove(idx))
    }

    // ----- formulas -----

    /// Insert a formula loaded from elsewhere, keeping its id and status.
    pub fn insert_formula(&mut self, formula: CostFormula) -> Result<()> {
        if !self.properties.contains_key(&formula.property_id) {
            return Err(NotFound::Property(formula.property_id).into());
        }
        if formula.is_active() {
            self.check_formula_name(formula.property_id, &formula.name, None)?;
        }
        self.next_formula_id = self.next_formula_id.max(formula.id.0 + 1);
        self.formulas.insert(formula.id, formula);
        Ok(())
    }

    pub fn create_formula(&mut self, new: NewFormula, now: OffsetDateTime) -> Result<CostFormula> {
        let formula = CostFormula {
            id: FormulaId(self.next_formula_id.max(1)),
            property_id: new.property_id,
            name: new.name,
            description: new.description,
            terms: new.terms,
            status: FormulaStatus::Active,
            created_at: now,
        };
        self.insert_formula(formula.clone())?;
        Ok(formula)
    }

    pub fn update_formula(&mut self, formula_id: FormulaId, update: FormulaUpdate) -> Result<CostFormula> {
        let current = self
            .formulas
            .get(&formula_id)
            .ok_or(NotFound::Formula(formula_id))?
            .clone();

        let mut updated = current;
        if let Some(name) = update.name {
            updated.name = name;
        }
        if let Some(description) = update.description {
            updated.description = Some(description);
        }
        if let Some(terms) = update.terms {
            updated.terms = terms;
        }
        if let Some(is_active) = update.is_active {
            updated.status = if is_active {
                FormulaStatus::Active
            } else {
                FormulaStatus::Inactive
            };
        }

        if updated.is_active() {
            self.check_formula_name(updated.property_id, &updated.name, Some(formula_id))?;
        }

        self.formulas.insert(formula_id, updated.clone());
        Ok(updated)
    }

    /// Soft delete: the formula stays in the store, flagged inactive.
    pub fn deactivate_formula(&mut self, formula_id: FormulaId) -> Result<()> {
        let formula = self
            .formulas
            .get_mut(&formula_id)
            .ok_or(NotFound::Formula(formula_id))?;
        formula.status = FormulaStatus::Inactive;
        Ok(())
    }

    fn check_formula_name(&self, property_id: PropertyId, name: &str, except: Option<FormulaId>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ValidationFailure::BlankFormulaName.into());
        }
        let taken = self.formulas.values().any(|f| {
            f.property_id == property_id && f.is_active() && f.name == name && Some(f.id) != except
        });
        if taken {
            return Err(ValidationFailure::DuplicateFormulaName(name.to_string()).into());
        }
        Ok(())
    }

    pub fn reading_count(&self) -> usize {
        self.readings.len()
    }
}

impl MeterStore for InMemoryStore {
    fn has_property(&self, property_id: PropertyId) -> bool {
        self.properties.contains_key(&property_id)
    }

    fn get_meter(&self, meter_id: MeterId) -> Option<Meter> {
        self.meters.get(&meter_id).cloned()
    }

    fn get_main_meter(&self, property_id: PropertyId) -> Option<Meter> {
        self.main_meter(property_id).cloned()
    }

    fn list_submeters(&self, property_id: PropertyId) -> Vec<Meter> {
        self.meters
            .values()
            .filter(|m| m.property_id == property_id && !m.is_main())
            .cloned()
            .collect()
    }

    fn get_reading_at(
        &self,
        meter_id: MeterId,
        at: OffsetDateTime,
        reading_type: Option<ReadingType>,
    ) -> Option<Reading> {
        self.readings
            .iter()
            .find(|r| {
                r.meter_id == meter_id
                    && r.taken_at == at
                    && reading_type.map_or(true, |t| r.reading_type == t)
            })
            .cloned()
    }

    fn list_readings(
        &self,
        meter_id: MeterId,
        reading_type: ReadingType,
        window: ReadingWindow,
    ) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self
            .readings
            .iter()
            .filter(|r| {
                r.meter_id == meter_id && r.reading_type == reading_type && window.contains(r.taken_at)
            })
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.taken_at);
        readings
    }

    fn latest_reading(&self, meter_id: MeterId) -> Option<Reading> {
        self.readings
            .iter()
            .filter(|r| r.meter_id == meter_id)
            .max_by_key(|r| r.taken_at)
            .cloned()
    }

    fn reading_history(&self, meter_id: MeterId, page: Page) -> (Vec<Reading>, usize) {
        let mut readings: Vec<&Reading> = self
            .readings
            .iter()
            .filter(|r| r.meter_id == meter_id)
            .collect();
        let total = readings.len();
        readings.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        let page = readings
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        (page, total)
    }
}

impl FormulaStore for InMemoryStore {
    fn get_formula(&self, formula_id: FormulaId) -> Option<CostFormula> {
        self.formulas.get(&formula_id).cloned()
    }

    fn list_formulas(&self, property_id: PropertyId, active_only: bool) -> Vec<CostFormula> {
        self.formulas
            .values()
            .filter(|f| f.property_id == property_id && (!active_only || f.is_active()))
            .cloned()
            .collect()
    }
}
