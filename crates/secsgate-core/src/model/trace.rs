use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sample of collected variables, from polling or an S6F11 report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub report_id: u32,
    /// Collection event that produced the sample; `None` for polled data.
    pub event_id: Option<u32>,
    pub values: BTreeMap<u32, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TraceData {
    pub fn new(report_id: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            report_id,
            event_id: None,
            values: BTreeMap::new(),
            timestamp,
        }
    }

    #[must_use]
    pub fn with_event(mut self, event_id: u32) -> Self {
        self.event_id = Some(event_id);
        self
    }

    #[must_use]
    pub fn with_value(mut self, variable_id: u32, value: serde_json::Value) -> Self {
        self.values.insert(variable_id, value);
        self
    }
}
