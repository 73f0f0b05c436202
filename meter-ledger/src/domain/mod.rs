pub mod formula;
pub mod meter;
pub mod period;
pub mod reading;

pub use formula::{CostFormula, FormulaStatus, FormulaTerms, TermKey, UNMETERED_KEY};
pub use meter::{Meter, MeterRole, Property, SubmeterKind};
pub use period::{Period, ReadingWindow};
pub use reading::{Reading, ReadingType};

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(PropertyId);
id_type!(MeterId);
id_type!(ReadingId);
id_type!(FormulaId);
id_type!(
    /// The user who recorded a reading, when known.
    UserId
);
