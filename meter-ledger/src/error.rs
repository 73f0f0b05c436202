//! Error types for the meter ledger.
//!
//! Every failure carries a stable condition string so callers can tell which
//! policy fired without parsing the human-readable message.

use thiserror::Error;

use crate::domain::{FormulaId, MeterId, PropertyId, ReadingId};

/// Result type alias using [`LedgerError`].
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Unified error type for ledger and allocation operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("not found: {0}")]
    NotFound(#[from] NotFound),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("precondition failed: {0}")]
    Precondition(#[from] PreconditionFailure),
}

/// Coarse error class, used by outer layers to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Validation,
    Precondition,
}

impl ErrorCategory {
    /// HTTP-equivalent status for this class.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorCategory::NotFound => 404,
            ErrorCategory::Validation | ErrorCategory::Precondition => 400,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFound {
    #[error("property {0} not found")]
    Property(PropertyId),

    #[error("meter {0} not found")]
    Meter(MeterId),

    #[error("main meter not found for property {0}")]
    MainMeter(PropertyId),

    #[error("submeter '{name}' not found for property {property_id}")]
    Submeter { property_id: PropertyId, name: String },

    #[error("cost formula {0} not found")]
    Formula(FormulaId),

    #[error("reading {0} not found")]
    Reading(ReadingId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("formula terms must not be empty")]
    EmptyTerms,

    #[error("formula term keys must not be blank")]
    BlankTermKey,

    #[error("invalid coefficient '{value}' for term '{key}'")]
    InvalidCoefficient { key: String, value: String },

    #[error("active formula with name '{0}' already exists for this property")]
    DuplicateFormulaName(String),

    #[error("formula name must not be blank")]
    BlankFormulaName,

    #[error("property {0} already has a main meter")]
    DuplicateMainMeter(PropertyId),

    #[error("submeter with name '{0}' already exists for this property")]
    DuplicateSubmeterName(String),

    #[error("meter name '{0}' is reserved")]
    ReservedMeterName(String),

    #[error("meter name must not be blank")]
    BlankMeterName,

    #[error("main meters are unnamed")]
    NamedMainMeter,

    #[error("cannot record readings directly against virtual meter {0}")]
    VirtualMeterReading(MeterId),

    #[error("cannot add readings to inactive meter {0}")]
    InactiveMeterReading(MeterId),

    #[error("reading timestamp cannot be in the future")]
    FutureReading,

    #[error("reading timestamp out of allowed range")]
    ReadingOutOfRange,

    #[error("absolute reading value must be non-negative")]
    NegativeReading,

    #[error("reading value {value} conflicts with {neighbour} reading {neighbour_value} at {at}")]
    NonMonotonicReading {
        value: String,
        neighbour: &'static str,
        neighbour_value: String,
        at: String,
    },

    #[error("period end must not precede period start")]
    InvertedPeriod,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreconditionFailure {
    #[error("no active cost formulas found for property {0}")]
    NoActiveFormulas(PropertyId),

    #[error("main meter consumption is unavailable for this period")]
    MainConsumptionUnavailable,

    #[error("main meter consumption is zero or negative for this period")]
    MainConsumptionNotPositive,
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::NotFound(_) => ErrorCategory::NotFound,
            LedgerError::Validation(_) => ErrorCategory::Validation,
            LedgerError::Precondition(_) => ErrorCategory::Precondition,
        }
    }

    /// Stable, documented condition string for the policy that fired.
    pub fn condition(&self) -> &'static str {
        match self {
            LedgerError::NotFound(e) => match e {
                NotFound::Property(_) => "property_not_found",
                NotFound::Meter(_) => "meter_not_found",
                NotFound::MainMeter(_) => "main_meter_not_found",
                NotFound::Submeter { .. } => "submeter_not_found",
                NotFound::Formula(_) => "formula_not_found",
                NotFound::Reading(_) => "reading_not_found",
            },
            LedgerError::Validation(e) => match e {
                ValidationFailure::EmptyTerms => "formula_terms_empty",
                ValidationFailure::BlankTermKey => "formula_term_key_blank",
                ValidationFailure::InvalidCoefficient { .. } => "invalid_coefficient",
                ValidationFailure::DuplicateFormulaName(_) => "duplicate_formula_name",
                ValidationFailure::BlankFormulaName => "formula_name_blank",
                ValidationFailure::DuplicateMainMeter(_) => "duplicate_main_meter",
                ValidationFailure::DuplicateSubmeterName(_) => "duplicate_submeter_name",
                ValidationFailure::ReservedMeterName(_) => "reserved_meter_name",
                ValidationFailure::BlankMeterName => "meter_name_blank",
                ValidationFailure::NamedMainMeter => "main_meter_named",
                ValidationFailure::VirtualMeterReading(_) => "virtual_meter_reading",
                ValidationFailure::InactiveMeterReading(_) => "inactive_meter_reading",
                ValidationFailure::FutureReading => "reading_in_future",
                ValidationFailure::ReadingOutOfRange => "reading_out_of_range",
                ValidationFailure::NegativeReading => "reading_negative",
                ValidationFailure::NonMonotonicReading { .. } => "reading_not_monotonic",
                ValidationFailure::InvertedPeriod => "period_inverted",
            },
            LedgerError::Precondition(e) => match e {
                PreconditionFailure::NoActiveFormulas(_) => "no_active_formulas",
                PreconditionFailure::MainConsumptionUnavailable => "main_consumption_unavailable",
                PreconditionFailure::MainConsumptionNotPositive => "main_consumption_not_positive",
            },
        }
    }
}
