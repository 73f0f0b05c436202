use serde::{Deserialize, Serialize};

use super::{MeterId, PropertyId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub display_name: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmeterKind {
    /// Has its own readings.
    Physical,
    /// Derived value; never carries readings of its own.
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role", content = "kind")]
pub enum MeterRole {
    Main,
    Submeter(SubmeterKind),
}

/// A main meter or submeter belonging to one property.
///
/// Main meters are unnamed; submeter names are unique within a property and
/// are what cost formulas refer to. Inactive meters accept no new readings
/// but still count towards consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub id: MeterId,
    pub property_id: PropertyId,
    pub role: MeterRole,
    pub name: Option<String>,
    pub location: Option<String>,
    #[serde(default = "active")]
    pub is_active: bool,
}

fn active() -> bool {
    true
}

impl Meter {
    pub fn is_main(&self) -> bool {
        self.role == MeterRole::Main
    }

    pub fn is_virtual(&self) -> bool {
        self.role == MeterRole::Submeter(SubmeterKind::Virtual)
    }

    pub fn is_physical_submeter(&self) -> bool {
        self.role == MeterRole::Submeter(SubmeterKind::Physical)
    }

    /// Name used as the key in consumption maps: the submeter name, or the
    /// numeric id for meters that were never named.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }
}
