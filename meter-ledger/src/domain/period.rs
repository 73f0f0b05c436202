use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Result, ValidationFailure};

/// A billing period bounded by two reading timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl Period {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self> {
        if end < start {
            return Err(ValidationFailure::InvertedPeriod.into());
        }
        Ok(Self { start, end })
    }

    /// Window that relative readings must fall into to count for this period.
    pub fn relative_window(&self) -> ReadingWindow {
        ReadingWindow {
            after: self.start,
            up_to: self.end,
        }
    }
}

/// Half-open window `(after, up_to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadingWindow {
    pub after: OffsetDateTime,
    pub up_to: OffsetDateTime,
}

impl ReadingWindow {
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        ts > self.after && ts <= self.up_to
    }
}
