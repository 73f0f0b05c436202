use std::{collections::BTreeMap, fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use super::{FormulaId, PropertyId};
use crate::error::{LedgerError, Result, ValidationFailure};

/// Reserved term key that refers to the inferred unmetered consumption.
pub const UNMETERED_KEY: &str = "_unmetered";

/// Left-hand side of a formula term: a submeter name or the unmetered residual.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermKey {
    Meter(String),
    Unmetered,
}

impl TermKey {
    pub fn as_str(&self) -> &str {
        match self {
            TermKey::Meter(name) => name,
            TermKey::Unmetered => UNMETERED_KEY,
        }
    }
}

impl fmt::Display for TermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TermKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(ValidationFailure::BlankTermKey.into());
        }
        if s == UNMETERED_KEY {
            return Ok(TermKey::Unmetered);
        }
        Ok(TermKey::Meter(s.to_string()))
    }
}

impl Serialize for TermKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TermKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Coefficients of a cost formula, keyed by meter name or `_unmetered`.
///
/// Never empty and never carries a blank key; both are checked on every
/// construction path, including deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<TermKey, Decimal>", into = "BTreeMap<TermKey, Decimal>")]
pub struct FormulaTerms(BTreeMap<TermKey, Decimal>);

impl FormulaTerms {
    pub fn new(terms: BTreeMap<TermKey, Decimal>) -> Result<Self> {
        if terms.is_empty() {
            return Err(ValidationFailure::EmptyTerms.into());
        }
        Ok(Self(terms))
    }

    /// Build terms from user-supplied strings, as stored in the ledger or
    /// typed into a form. Malformed coefficients are rejected here so the
    /// arithmetic never sees them.
    pub fn parse<I, K, V>(raw: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut terms = BTreeMap::new();
        for (key, value) in raw {
            let key: TermKey = key.as_ref().parse()?;
            let coefficient = Decimal::from_str(value.as_ref().trim()).map_err(|_| {
                ValidationFailure::InvalidCoefficient {
                    key: key.to_string(),
                    value: value.as_ref().to_string(),
                }
            })?;
            terms.insert(key, coefficient);
        }
        Self::new(terms)
    }

    /// Parse the JSON document form `{"meter": "coefficient", ...}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json).map_err(|e| {
            ValidationFailure::InvalidCoefficient {
                key: String::new(),
                value: e.to_string(),
            }
        })?;
        Self::parse(raw.into_iter().map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        }))
    }

    /// JSON document form with coefficients as decimal strings.
    pub fn to_json(&self) -> String {
        let raw: BTreeMap<&str, String> = self
            .0
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_string()))
            .collect();
        serde_json::to_string(&raw).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TermKey, &Decimal)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<BTreeMap<TermKey, Decimal>> for FormulaTerms {
    type Error = LedgerError;

    fn try_from(terms: BTreeMap<TermKey, Decimal>) -> Result<Self> {
        Self::new(terms)
    }
}

impl From<FormulaTerms> for BTreeMap<TermKey, Decimal> {
    fn from(terms: FormulaTerms) -> Self {
        terms.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaStatus {
    Active,
    Inactive,
}

/// A named linear combination of meter consumptions defining one party's
/// share of a property's cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostFormula {
    pub id: FormulaId,
    pub property_id: PropertyId,
    pub name: String,
    pub description: Option<String>,
    pub terms: FormulaTerms,
    pub status: FormulaStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CostFormula {
    pub fn is_active(&self) -> bool {
        self.status == FormulaStatus::Active
    }
}
