use rust_decimal::Decimal;
use time::{macros::datetime, OffsetDateTime};

use crate::{
    domain::{Meter, Reading, ReadingType},
    error::{Result, ValidationFailure},
};

/// Incoming reading before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReading {
    pub meter_id: crate::domain::MeterId,
    pub value: Decimal,
    pub taken_at: OffsetDateTime,
    pub reading_type: ReadingType,
    pub recorded_by: Option<crate::domain::UserId>,
}

/// Pure validation of a reading against its meter and that meter's history.
///
/// Rules:
/// - readings are never recorded directly against virtual meters.
/// - `taken_at` must not be after `now`, and must fall in the sanity window
///   [2000-01-01, 2100-01-01].
/// - absolute values must be non-negative and must not go backwards relative
///   to the surrounding absolute readings of the same meter.
///
/// Relative readings are deltas and are exempt from the ordering rule.
pub fn validate_reading(
    reading: &NewReading,
    meter: &Meter,
    history: &[Reading],
    now: OffsetDateTime,
) -> Result<()> {
    if meter.is_virtual() {
        return Err(ValidationFailure::VirtualMeterReading(meter.id).into());
    }

    if reading.taken_at > now {
        return Err(ValidationFailure::FutureReading.into());
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    if reading.taken_at < min_ts || reading.taken_at > max_ts {
        return Err(ValidationFailure::ReadingOutOfRange.into());
    }

    if reading.reading_type == ReadingType::Absolute {
        if reading.value < Decimal::ZERO {
            return Err(ValidationFailure::NegativeReading.into());
        }
        check_monotonic(reading, history)?;
    }

    Ok(())
}

fn check_monotonic(reading: &NewReading, history: &[Reading]) -> Result<()> {
    let absolute = history
        .iter()
        .filter(|r| r.meter_id == reading.meter_id && r.reading_type == ReadingType::Absolute);

    for other in absolute {
        let conflict = if other.taken_at < reading.taken_at && other.value > reading.value {
            Some("earlier")
        } else if other.taken_at > reading.taken_at && other.value < reading.value {
            Some("later")
        } else {
            None
        };

        if let Some(neighbour) = conflict {
            return Err(ValidationFailure::NonMonotonicReading {
                value: reading.value.to_string(),
                neighbour,
                neighbour_value: other.value.to_string(),
                at: other.taken_at.to_string(),
            }
            .into());
        }
    }

    Ok(())
}
