// ── Machine metadata ──
//
// Stable identification read from a tool during the bootstrap handshake.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::error::CoreError;

const MAX_FIELD_LEN: usize = 64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumIter,
)]
pub enum Capability {
    StateQuery,
    DataCollection,
    AlarmManagement,
    RemoteControl,
    EventReports,
}

impl Capability {
    /// Everything a GEM-compliant tool is expected to support.
    pub fn gem_baseline() -> BTreeSet<Self> {
        Self::iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMetadata {
    pub vendor: String,
    /// `MDLN` from S1F14.
    pub model: String,
    pub serial: String,
    /// `SOFTREV` from S1F14.
    pub software_revision: String,
    pub capabilities: BTreeSet<Capability>,
}

impl MachineMetadata {
    pub fn validate(&self) -> Result<(), CoreError> {
        check_field("model", &self.model)?;
        check_field("serial", &self.serial)?;
        if self.vendor.len() > MAX_FIELD_LEN {
            return Err(CoreError::validation(
                "vendor",
                format!("exceeds {MAX_FIELD_LEN} characters"),
            ));
        }
        Ok(())
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

fn check_field(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(field, "must not be empty"));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(CoreError::validation(
            field,
            format!("exceeds {MAX_FIELD_LEN} characters"),
        ));
    }
    Ok(())
}
