use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::domain::{
    CostFormula, FormulaId, FormulaStatus, FormulaTerms, Meter, MeterId, MeterRole, Property,
    PropertyId, Reading, ReadingId, ReadingType, SubmeterKind, UserId,
};

#[derive(Debug, Clone, sqlx::FromRow)]
struct PropertyRow {
    property_id: i64,
    display_name: String,
    address: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MeterRow {
    meter_id: i64,
    property_id: i64,
    meter_type: String,
    sub_meter_kind: Option<String>,
    name: Option<String>,
    location: Option<String>,
    is_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReadingRow {
    reading_id: i64,
    meter_id: i64,
    value: Decimal,
    reading_timestamp: OffsetDateTime,
    created_at: OffsetDateTime,
    reading_type: String,
    recorded_by_user_id: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct FormulaRow {
    formula_id: i64,
    property_id: i64,
    name: String,
    description: Option<String>,
    terms_json: String,
    is_active: bool,
    created_at: OffsetDateTime,
}

impl TryFrom<MeterRow> for Meter {
    type Error = anyhow::Error;

    fn try_from(row: MeterRow) -> Result<Self> {
        let role = match (row.meter_type.as_str(), row.sub_meter_kind.as_deref()) {
            ("main_meter", _) => MeterRole::Main,
            ("sub_meter", Some("virtual")) => MeterRole::Submeter(SubmeterKind::Virtual),
            ("sub_meter", Some("physical") | None) => MeterRole::Submeter(SubmeterKind::Physical),
            (meter_type, kind) => {
                return Err(anyhow!(
                    "meter {}: unknown meter type '{meter_type}' / kind {kind:?}",
                    row.meter_id
                ))
            }
        };

        Ok(Meter {
            id: MeterId(row.meter_id),
            property_id: PropertyId(row.property_id),
            role,
            name: row.name,
            location: row.location,
            is_active: row.is_active,
        })
    }
}

impl TryFrom<ReadingRow> for Reading {
    type Error = anyhow::Error;

    fn try_from(row: ReadingRow) -> Result<Self> {
        let reading_type: ReadingType = row
            .reading_type
            .parse()
            .map_err(|e: String| anyhow!("reading {}: {e}", row.reading_id))?;

        Ok(Reading {
            id: ReadingId(row.reading_id),
            meter_id: MeterId(row.meter_id),
            value: row.value,
            taken_at: row.reading_timestamp,
            recorded_at: row.created_at,
            reading_type,
            recorded_by: row.recorded_by_user_id.map(UserId),
        })
    }
}

impl TryFrom<FormulaRow> for CostFormula {
    type Error = anyhow::Error;

    fn try_from(row: FormulaRow) -> Result<Self> {
        let terms = FormulaTerms::from_json(&row.terms_json)
            .map_err(|e| anyhow!("cost formula {}: {e}", row.formula_id))?;

        Ok(CostFormula {
            id: FormulaId(row.formula_id),
            property_id: PropertyId(row.property_id),
            name: row.name,
            description: row.description,
            terms,
            status: if row.is_active {
                FormulaStatus::Active
            } else {
                FormulaStatus::Inactive
            },
            created_at: row.created_at,
        })
    }
}

pub async fn fetch_property(conn: &mut PgConnection, property_id: PropertyId) -> Result<Option<Property>> {
    let row = sqlx::query_as::<_, PropertyRow>(
        r#"
        SELECT property_id, display_name, address
        FROM properties
        WHERE property_id = $1
        "#,
    )
    .bind(property_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| Property {
        id: PropertyId(r.property_id),
        display_name: r.display_name,
        address: r.address,
    }))
}

/// All meters of a property, main meter first.
pub async fn fetch_meters(conn: &mut PgConnection, property_id: PropertyId) -> Result<Vec<Meter>> {
    let rows = sqlx::query_as::<_, MeterRow>(
        r#"
        SELECT meter_id, property_id, meter_type, sub_meter_kind, name, location, is_active
        FROM meters
        WHERE property_id = $1
        ORDER BY (meter_type <> 'main_meter'), meter_id
        "#,
    )
    .bind(property_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(Meter::try_from).collect()
}

/// Every reading of the given meters.
///
/// The snapshot needs the full history: point-in-time and latest lookups
/// are not limited to a period. Rows come back in insertion order so that
/// "first match" lookups over the result agree with the database.
pub async fn fetch_readings(conn: &mut PgConnection, meter_ids: &[MeterId]) -> Result<Vec<Reading>> {
    if meter_ids.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = meter_ids.iter().map(|m| m.0).collect();
    let rows = sqlx::query_as::<_, ReadingRow>(
        r#"
        SELECT reading_id, meter_id, value, reading_timestamp, created_at, reading_type, recorded_by_user_id
        FROM meter_readings
        WHERE meter_id = ANY($1)
        ORDER BY reading_id
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(Reading::try_from).collect()
}

/// Every formula of a property, active and inactive.
pub async fn fetch_formulas(conn: &mut PgConnection, property_id: PropertyId) -> Result<Vec<CostFormula>> {
    let rows = sqlx::query_as::<_, FormulaRow>(
        r#"
        SELECT formula_id, property_id, name, description, terms_json, is_active, created_at
        FROM cost_formulas
        WHERE property_id = $1
        ORDER BY formula_id
        "#,
    )
    .bind(property_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(CostFormula::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    #[test]
    fn meter_row_maps_roles() {
        let row = MeterRow {
            meter_id: 3,
            property_id: 1,
            meter_type: "sub_meter".to_string(),
            sub_meter_kind: Some("virtual".to_string()),
            name: Some("common".to_string()),
            location: None,
            is_active: false,
        };
        let meter = Meter::try_from(row).unwrap();
        assert!(meter.is_virtual());
        assert!(!meter.is_active);

        let row = MeterRow {
            meter_id: 4,
            property_id: 1,
            meter_type: "gas".to_string(),
            sub_meter_kind: None,
            name: None,
            location: None,
            is_active: true,
        };
        assert!(Meter::try_from(row).is_err());
    }

    #[test]
    fn reading_row_keeps_both_timestamps() {
        let row = ReadingRow {
            reading_id: 10,
            meter_id: 2,
            value: dec!(1234.56),
            reading_timestamp: datetime!(2024-01-01 00:00:00 UTC),
            created_at: datetime!(2024-01-03 08:15:00 UTC),
            reading_type: "relative".to_string(),
            recorded_by_user_id: Some(7),
        };
        let reading = Reading::try_from(row).unwrap();
        assert_eq!(reading.reading_type, ReadingType::Relative);
        assert_eq!(reading.taken_at, datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(reading.recorded_at, datetime!(2024-01-03 08:15:00 UTC));
        assert_eq!(reading.recorded_by, Some(UserId(7)));
    }

    #[test]
    fn formula_row_rejects_bad_terms() {
        let row = FormulaRow {
            formula_id: 1,
            property_id: 1,
            name: "Tenant A".to_string(),
            description: None,
            terms_json: "{}".to_string(),
            is_active: true,
            created_at: datetime!(2024-01-01 00:00:00 UTC),
        };
        assert!(CostFormula::try_from(row).is_err());
    }
}
