// ── Logical connection state ──
//
// Immutable snapshot of a device's connectivity. Every transition returns a
// new value; nothing here performs I/O. The transport client owns the live
// copy and the equipment aggregate keeps its own for health derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Heartbeat gap (seconds) at or below which quality is Excellent.
pub const EXCELLENT_GAP_SECS: i64 = 30;
/// Heartbeat gap (seconds) at or below which quality is Good.
pub const GOOD_GAP_SECS: i64 = 60;
/// Heartbeat gap (seconds) at or below which quality is Fair.
pub const FAIR_GAP_SECS: i64 = 120;

/// Link quality derived from the age of the last heartbeat.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    Display, EnumString,
)]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Classify a heartbeat gap. Negative gaps (clock skew) count as fresh.
    pub fn from_gap_secs(gap: i64) -> Self {
        match gap {
            g if g <= EXCELLENT_GAP_SECS => Self::Excellent,
            g if g <= GOOD_GAP_SECS => Self::Good,
            g if g <= FAIR_GAP_SECS => Self::Fair,
            _ => Self::Poor,
        }
    }
}

/// Snapshot of a device's logical connectivity.
///
/// Invariants: `is_connected` implies `session_id.is_some()`;
/// `retry_count <= max_retries` unless reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_connected: bool,
    pub session_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub connection_started_at: Option<DateTime<Utc>>,
    pub disconnect_reason: Option<String>,
}

impl ConnectionState {
    /// A never-connected state with the given retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            is_connected: false,
            session_id: None,
            retry_count: 0,
            max_retries,
            last_connected_at: None,
            last_disconnected_at: None,
            last_heartbeat_at: None,
            connection_started_at: None,
            disconnect_reason: None,
        }
    }

    /// Successful session establishment. Resets the retry counter.
    #[must_use]
    pub fn connect(&self, session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            is_connected: true,
            session_id: Some(session_id.into()),
            retry_count: 0,
            last_connected_at: Some(now),
            last_heartbeat_at: Some(now),
            connection_started_at: Some(now),
            disconnect_reason: None,
            ..self.clone()
        }
    }

    /// Session ended. The previous session id is dropped.
    #[must_use]
    pub fn disconnect(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            is_connected: false,
            session_id: None,
            last_disconnected_at: Some(now),
            connection_started_at: None,
            disconnect_reason: Some(reason.into()),
            ..self.clone()
        }
    }

    /// Record one failed attempt. Saturates at `max_retries`.
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1).min(self.max_retries),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn update_heartbeat(&self, now: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat_at: Some(now),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn reset_retry_count(&self) -> Self {
        Self {
            retry_count: 0,
            ..self.clone()
        }
    }

    /// Hard cap on reconnection attempts.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Quality from the heartbeat gap; `Unknown` when disconnected or no
    /// heartbeat has been seen.
    pub fn quality(&self, now: DateTime<Utc>) -> ConnectionQuality {
        match (self.is_connected, self.last_heartbeat_at) {
            (true, Some(last)) => ConnectionQuality::from_gap_secs((now - last).num_seconds()),
            _ => ConnectionQuality::Unknown,
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_heartbeat_at.map(|t| now - t)
    }

    pub fn connection_duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.connection_started_at
            .filter(|_| self.is_connected)
            .map(|t| now - t)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(crate::config::RetryPolicy::default().max_retries)
    }
}
