// ── Equipment identity ──

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const MAX_LEN: usize = 50;

/// Validated identifier of one physical tool.
///
/// ASCII letters, digits, `_` and `-`, at most 50 characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EquipmentId(String);

impl EquipmentId {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(CoreError::validation("equipment id", "must not be empty"));
        }
        if raw.len() > MAX_LEN {
            return Err(CoreError::validation(
                "equipment id",
                format!("'{raw}' exceeds {MAX_LEN} characters"),
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(CoreError::validation(
                "equipment id",
                format!("'{raw}' contains invalid character '{bad}'"),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EquipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EquipmentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EquipmentId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EquipmentId> for String {
    fn from(id: EquipmentId) -> Self {
        id.0
    }
}

impl AsRef<str> for EquipmentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
