use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    str::FromStr,
};

use csv::StringRecord;
use meter_ledger::{
    domain::{
        CostFormula, FormulaId, FormulaStatus, FormulaTerms, Meter, MeterId, MeterRole, Property,
        PropertyId, Reading, ReadingId, ReadingType, SubmeterKind, UserId,
    },
    error::NotFound,
    validate::{validate_reading, NewReading},
    InMemoryStore, LedgerError,
};
use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{info, warn};

use super::{SnapshotSource, SourceError};

/// Snapshot stored as four CSV files in one directory.
///
/// Expected header columns (by name):
/// - `properties.csv`: property_id, display_name, address (optional)
/// - `meters.csv`: meter_id, property_id, role (`main` | `physical` | `virtual`),
///   name (optional), location (optional), is_active (optional, default `true`)
/// - `readings.csv`: reading_id, meter_id, value, taken_at (RFC3339),
///   reading_type (optional, default `absolute`), recorded_at (optional),
///   recorded_by (optional)
/// - `formulas.csv`: formula_id, property_id, name, description (optional),
///   terms (JSON object), is_active (optional, default `true`),
///   created_at (optional)
///
/// Unlike the Postgres source, a CSV snapshot is hand-maintained and is not
/// trusted. Readings go through the same validation as newly recorded ones,
/// in `taken_at` order per meter (file order breaks ties), so a bad row only
/// rejects itself; rejected rows are skipped and counted. Meter status is
/// not checked: inactive meters keep the readings taken while they were
/// active.
pub struct CsvSnapshotSource {
    dir: PathBuf,
}

impl CsvSnapshotSource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn load_blocking(&self, property_id: PropertyId) -> Result<InMemoryStore, SourceError> {
        let now = OffsetDateTime::now_utc();
        let mut store = InMemoryStore::new();

        let property = read_rows(&self.dir.join("properties.csv"), record_to_property)?
            .into_iter()
            .find(|p| p.id == property_id)
            .ok_or_else(|| LedgerError::from(NotFound::Property(property_id)))?;
        store.insert_property(property);

        let mut meters = read_rows(&self.dir.join("meters.csv"), record_to_meter)?;
        meters.retain(|m| m.property_id == property_id);
        for meter in &meters {
            store.insert_meter(meter.clone())?;
        }

        let readings = read_rows(&self.dir.join("readings.csv"), record_to_reading)?;
        let (accepted, rejected) = screen_readings(&meters, readings, now);
        let loaded = accepted.len();
        for reading in accepted {
            store.insert_reading(reading)?;
        }

        for formula in read_rows(&self.dir.join("formulas.csv"), record_to_formula)? {
            if formula.property_id == property_id {
                store.insert_formula(formula)?;
            }
        }

        info!(
            property_id = %property_id,
            meters = meters.len(),
            readings = loaded,
            rejected,
            "loaded CSV snapshot"
        );
        Ok(store)
    }
}

/// Validates each meter's readings oldest first and returns the accepted
/// ones in that order, with the number rejected. Readings of meters outside
/// `meters` are dropped without counting.
fn screen_readings(meters: &[Meter], mut readings: Vec<Reading>, now: OffsetDateTime) -> (Vec<Reading>, usize) {
    // stable: equal timestamps keep file order, so "first match" still holds
    readings.sort_by_key(|r| r.taken_at);

    let by_id: HashMap<MeterId, &Meter> = meters.iter().map(|m| (m.id, m)).collect();
    let mut history: HashMap<MeterId, Vec<Reading>> = HashMap::new();
    let mut accepted = Vec::with_capacity(readings.len());
    let mut rejected = 0usize;

    for reading in readings {
        let Some(meter) = by_id.get(&reading.meter_id) else {
            continue;
        };
        let seen = history.entry(reading.meter_id).or_default();
        let candidate = NewReading {
            meter_id: reading.meter_id,
            value: reading.value,
            taken_at: reading.taken_at,
            reading_type: reading.reading_type,
            recorded_by: reading.recorded_by,
        };

        if let Err(e) = validate_reading(&candidate, meter, &seen[..], now) {
            metrics::counter!("reading_validation_rejected_total", "condition" => e.condition())
                .increment(1);
            warn!(
                reading_id = %reading.id,
                meter_id = %reading.meter_id,
                error = %e,
                "skipping invalid reading"
            );
            rejected += 1;
            continue;
        }

        seen.push(reading.clone());
        accepted.push(reading);
    }

    (accepted, rejected)
}

#[async_trait::async_trait]
impl SnapshotSource for CsvSnapshotSource {
    async fn load(&self, property_id: PropertyId) -> Result<InMemoryStore, SourceError> {
        // Snapshot files are small; a blocking read inside the task is fine.
        self.load_blocking(property_id)
    }
}

fn read_rows<T>(
    path: &Path,
    parse: fn(&StringRecord, &StringRecord) -> Result<T, SourceError>,
) -> Result<Vec<T>, SourceError> {
    let file = File::open(path)
        .map_err(|e| SourceError::Io(format!("failed to open {}: {e}", path.display())))?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr
        .headers()
        .map_err(|e| SourceError::Parse(format!("failed to read headers of {}: {e}", path.display())))?
        .clone();

    let mut rows = Vec::new();
    for (idx, result) in rdr.records().enumerate() {
        let record = result
            .map_err(|e| SourceError::Parse(format!("{}: failed to read record: {e}", path.display())))?;

        match parse(&record, &headers) {
            Ok(row) => rows.push(row),
            Err(e) => {
                metrics::counter!("snapshot_csv_parse_errors_total").increment(1);
                // +2: one for the header line, one for 1-based numbering.
                return Err(SourceError::Parse(format!("{} line {}: {e}", path.display(), idx + 2)));
            }
        }
    }
    Ok(rows)
}

fn column<'r>(record: &'r StringRecord, headers: &StringRecord, name: &str) -> Option<&'r str> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .and_then(|idx| record.get(idx))
}

fn required<'r>(record: &'r StringRecord, headers: &StringRecord, name: &str) -> Result<&'r str, SourceError> {
    column(record, headers, name)
        .map(str::trim)
        .ok_or_else(|| SourceError::Parse(format!("missing column '{name}'")))
}

fn optional_string(record: &StringRecord, headers: &StringRecord, name: &str) -> Option<String> {
    column(record, headers, name)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_field<T: FromStr>(record: &StringRecord, headers: &StringRecord, name: &str) -> Result<T, SourceError>
where
    T::Err: std::fmt::Display,
{
    let raw = required(record, headers, name)?;
    raw.parse()
        .map_err(|e| SourceError::Parse(format!("invalid {name} '{raw}': {e}")))
}

fn optional_bool(record: &StringRecord, headers: &StringRecord, name: &str) -> Result<Option<bool>, SourceError> {
    match optional_string(record, headers, name).as_deref() {
        None => Ok(None),
        Some("true") | Some("1") => Ok(Some(true)),
        Some("false") | Some("0") => Ok(Some(false)),
        Some(other) => Err(SourceError::Parse(format!("invalid {name} '{other}'"))),
    }
}

fn parse_timestamp(raw: &str, name: &str) -> Result<OffsetDateTime, SourceError> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|e| SourceError::Parse(format!("invalid {name} '{raw}': {e}")))
}

fn optional_timestamp(
    record: &StringRecord,
    headers: &StringRecord,
    name: &str,
) -> Result<Option<OffsetDateTime>, SourceError> {
    optional_string(record, headers, name)
        .map(|raw| parse_timestamp(&raw, name))
        .transpose()
}

fn record_to_property(record: &StringRecord, headers: &StringRecord) -> Result<Property, SourceError> {
    Ok(Property {
        id: PropertyId(parse_field(record, headers, "property_id")?),
        display_name: required(record, headers, "display_name")?.to_string(),
        address: optional_string(record, headers, "address"),
    })
}

fn record_to_meter(record: &StringRecord, headers: &StringRecord) -> Result<Meter, SourceError> {
    let role = match required(record, headers, "role")? {
        "main" => MeterRole::Main,
        "physical" => MeterRole::Submeter(SubmeterKind::Physical),
        "virtual" => MeterRole::Submeter(SubmeterKind::Virtual),
        other => return Err(SourceError::Parse(format!("unknown meter role '{other}'"))),
    };

    Ok(Meter {
        id: MeterId(parse_field(record, headers, "meter_id")?),
        property_id: PropertyId(parse_field(record, headers, "property_id")?),
        role,
        name: optional_string(record, headers, "name"),
        location: optional_string(record, headers, "location"),
        is_active: optional_bool(record, headers, "is_active")?.unwrap_or(true),
    })
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord) -> Result<Reading, SourceError> {
    let value: Decimal = parse_field(record, headers, "value")?;
    let taken_at = parse_timestamp(required(record, headers, "taken_at")?, "taken_at")?;
    let reading_type = match optional_string(record, headers, "reading_type") {
        Some(raw) => raw.parse::<ReadingType>().map_err(SourceError::Parse)?,
        None => ReadingType::Absolute,
    };
    let recorded_by = optional_string(record, headers, "recorded_by")
        .map(|raw| {
            raw.parse::<i64>()
                .map(UserId)
                .map_err(|e| SourceError::Parse(format!("invalid recorded_by '{raw}': {e}")))
        })
        .transpose()?;

    Ok(Reading {
        id: ReadingId(parse_field(record, headers, "reading_id")?),
        meter_id: MeterId(parse_field(record, headers, "meter_id")?),
        value,
        taken_at,
        recorded_at: optional_timestamp(record, headers, "recorded_at")?.unwrap_or(taken_at),
        reading_type,
        recorded_by,
    })
}

fn record_to_formula(record: &StringRecord, headers: &StringRecord) -> Result<CostFormula, SourceError> {
    let terms = FormulaTerms::from_json(required(record, headers, "terms")?)?;
    let status = if optional_bool(record, headers, "is_active")?.unwrap_or(true) {
        FormulaStatus::Active
    } else {
        FormulaStatus::Inactive
    };

    Ok(CostFormula {
        id: FormulaId(parse_field(record, headers, "formula_id")?),
        property_id: PropertyId(parse_field(record, headers, "property_id")?),
        name: required(record, headers, "name")?.to_string(),
        description: optional_string(record, headers, "description"),
        terms,
        status,
        created_at: optional_timestamp(record, headers, "created_at")?
            .unwrap_or(OffsetDateTime::UNIX_EPOCH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn record(headers: &[&str], values: &[&str]) -> (StringRecord, StringRecord) {
        (StringRecord::from(values.to_vec()), StringRecord::from(headers.to_vec()))
    }

    #[test]
    fn reading_defaults_to_absolute_and_taken_at() {
        let (rec, headers) = record(
            &["reading_id", "meter_id", "value", "taken_at"],
            &["7", "2", "1234.500", "2024-01-01T00:00:00Z"],
        );
        let reading = record_to_reading(&rec, &headers).unwrap();
        assert_eq!(reading.id, ReadingId(7));
        assert_eq!(reading.value, dec!(1234.5));
        assert_eq!(reading.reading_type, ReadingType::Absolute);
        assert_eq!(reading.recorded_at, datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(reading.recorded_by, None);
    }

    #[test]
    fn reading_rejects_bad_value() {
        let (rec, headers) = record(
            &["reading_id", "meter_id", "value", "taken_at"],
            &["7", "2", "lots", "2024-01-01T00:00:00Z"],
        );
        assert!(matches!(record_to_reading(&rec, &headers), Err(SourceError::Parse(_))));
    }

    #[test]
    fn meter_roles_map_to_domain() {
        let headers = ["meter_id", "property_id", "role", "name", "location"];
        let (rec, h) = record(&headers, &["1", "1", "main", "", ""]);
        assert!(record_to_meter(&rec, &h).unwrap().is_main());

        let (rec, h) = record(&headers, &["2", "1", "virtual", "common", "hall"]);
        let meter = record_to_meter(&rec, &h).unwrap();
        assert!(meter.is_virtual());
        assert_eq!(meter.location.as_deref(), Some("hall"));

        let (rec, h) = record(&headers, &["3", "1", "gas", "x", ""]);
        assert!(record_to_meter(&rec, &h).is_err());
    }

    #[test]
    fn meter_status_column_is_optional() {
        let headers = ["meter_id", "property_id", "role", "name", "is_active"];
        let (rec, h) = record(&headers, &["2", "1", "physical", "", "false"]);
        let meter = record_to_meter(&rec, &h).unwrap();
        assert!(!meter.is_active);
        assert_eq!(meter.name, None);

        let (rec, h) = record(&headers, &["2", "1", "physical", "a", ""]);
        assert!(record_to_meter(&rec, &h).unwrap().is_active);

        let (rec, h) = record(&headers, &["2", "1", "physical", "a", "maybe"]);
        assert!(record_to_meter(&rec, &h).is_err());
    }

    fn submeter(id: i64) -> Meter {
        Meter {
            id: MeterId(id),
            property_id: PropertyId(1),
            role: MeterRole::Submeter(SubmeterKind::Physical),
            name: Some(format!("sub_{id}")),
            location: None,
            is_active: true,
        }
    }

    fn absolute(id: i64, meter_id: i64, value: Decimal, taken_at: OffsetDateTime) -> Reading {
        Reading {
            id: ReadingId(id),
            meter_id: MeterId(meter_id),
            value,
            taken_at,
            recorded_at: taken_at,
            reading_type: ReadingType::Absolute,
            recorded_by: None,
        }
    }

    #[test]
    fn readings_are_screened_oldest_first() {
        let now = datetime!(2024-06-01 00:00:00 UTC);
        // file order puts the bad February value ahead of the good January one
        let readings = vec![
            absolute(1, 2, dec!(5), datetime!(2024-02-01 00:00:00 UTC)),
            absolute(2, 2, dec!(100), datetime!(2024-01-01 00:00:00 UTC)),
            absolute(3, 2, dec!(120), datetime!(2024-03-01 00:00:00 UTC)),
        ];

        let (accepted, rejected) = screen_readings(&[submeter(2)], readings, now);

        assert_eq!(rejected, 1);
        let ids: Vec<_> = accepted.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ReadingId(2), ReadingId(3)]);
    }

    #[test]
    fn screening_keeps_file_order_for_equal_timestamps() {
        let now = datetime!(2024-06-01 00:00:00 UTC);
        let at = datetime!(2024-01-01 00:00:00 UTC);
        let readings = vec![
            absolute(7, 2, dec!(10), at),
            absolute(3, 2, dec!(10), at),
            absolute(4, 99, dec!(10), at),
        ];

        let (accepted, rejected) = screen_readings(&[submeter(2)], readings, now);

        assert_eq!(rejected, 0);
        let ids: Vec<_> = accepted.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![ReadingId(7), ReadingId(3)]);
    }

    #[test]
    fn formula_terms_come_from_json_column() {
        let (rec, headers) = record(
            &["formula_id", "property_id", "name", "terms", "is_active"],
            &["5", "1", "Tenant A", r#"{"sub_a": "1.0", "_unmetered": 0.2}"#, "false"],
        );
        let formula = record_to_formula(&rec, &headers).unwrap();
        assert_eq!(formula.terms.len(), 2);
        assert!(!formula.is_active());

        let (rec, headers) = record(
            &["formula_id", "property_id", "name", "terms"],
            &["6", "1", "Empty", "{}"],
        );
        let err = record_to_formula(&rec, &headers).unwrap_err();
        assert_eq!(err.condition(), Some("formula_terms_empty"));
    }
}
