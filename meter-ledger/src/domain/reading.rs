use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{MeterId, ReadingId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingType {
    /// Cumulative counter value.
    Absolute,
    /// Consumption delta already computed for a sub-period.
    Relative,
}

impl ReadingType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadingType::Absolute => "absolute",
            ReadingType::Relative => "relative",
        }
    }
}

impl fmt::Display for ReadingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "absolute" => Ok(ReadingType::Absolute),
            "relative" => Ok(ReadingType::Relative),
            other => Err(format!("unknown reading type '{other}'")),
        }
    }
}

/// A single value recorded against a meter.
///
/// `taken_at` is when the physical measurement happened; `recorded_at` is when
/// it entered the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub meter_id: MeterId,
    pub value: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub reading_type: ReadingType,
    pub recorded_by: Option<UserId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_type_parses_known_tags() {
        assert_eq!("absolute".parse::<ReadingType>(), Ok(ReadingType::Absolute));
        assert_eq!(" relative ".parse::<ReadingType>(), Ok(ReadingType::Relative));
        assert!("delta".parse::<ReadingType>().is_err());
    }
}
