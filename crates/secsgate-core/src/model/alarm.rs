// ── Alarm domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Alarm severity, totally ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmSeverity {
    Info,
    Minor,
    Major,
    Critical,
    Emergency,
}

impl AlarmSeverity {
    /// Map the low seven bits of an S5F1 ALCD byte.
    ///
    /// Categories per SEMI E5: 1 personal safety, 2 equipment safety,
    /// 3 parameter control warning, 4 parameter control error,
    /// 5 irrecoverable error, 6 equipment status warning,
    /// 7 attention flags, 8 data integrity.
    pub fn from_alcd_category(category: u8) -> Self {
        match category {
            1 => Self::Emergency,
            2 | 5 => Self::Critical,
            4 | 8 => Self::Major,
            3 | 6 => Self::Minor,
            _ => Self::Info,
        }
    }

    /// MAJOR and above force the tool into ALARM.
    pub fn is_major_or_worse(self) -> bool {
        self >= Self::Major
    }
}

/// One active (or just-cleared) alarm on a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub alarm_id: u32,
    pub code: Option<String>,
    pub text: String,
    pub severity: AlarmSeverity,
    pub set_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl AlarmEvent {
    pub fn new(
        alarm_id: u32,
        text: impl Into<String>,
        severity: AlarmSeverity,
        set_at: DateTime<Utc>,
    ) -> Self {
        Self {
            alarm_id,
            code: None,
            text: text.into(),
            severity,
            set_at,
            acknowledged_at: None,
            acknowledged_by: None,
            cleared_at: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}
