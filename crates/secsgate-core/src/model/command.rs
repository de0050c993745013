// ── Remote commands ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::state::EquipmentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

/// A host-initiated command and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    pub id: Uuid,
    pub name: String,
    /// Parameters as sent, serialized to JSON.
    pub parameters: serde_json::Value,
    pub status: CommandStatus,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub result_message: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RemoteCommand {
    pub(crate) fn new(
        name: impl Into<String>,
        parameters: serde_json::Value,
        requested_by: impl Into<String>,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            parameters,
            status: CommandStatus::Pending,
            requested_by: requested_by.into(),
            requested_at: now,
            timeout_at: now + timeout,
            result_message: None,
            result_data: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && now >= self.timeout_at
    }
}

/// Whether command `name` may be issued while the tool is in `state`.
///
/// Unrecognised names are treated as vendor commands and only run from IDLE.
pub fn command_allowed(name: &str, state: EquipmentState) -> bool {
    use EquipmentState::{Alarm, Executing, Fault, Idle, Pause, Setup, Unknown};

    match name.to_ascii_uppercase().as_str() {
        "START" | "PP-SELECT" => matches!(state, Idle | Setup),
        "STOP" => matches!(state, Executing | Pause),
        "PAUSE" => state == Executing,
        "RESUME" => state == Pause,
        "ABORT" => matches!(state, Executing | Pause | Setup),
        "RESET" => matches!(state, Fault | Alarm),
        "LOCAL" | "REMOTE" => state != Unknown,
        _ => state == Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_commands_follow_state() {
        assert!(command_allowed("START", EquipmentState::Idle));
        assert!(command_allowed("start", EquipmentState::Setup));
        assert!(!command_allowed("START", EquipmentState::Executing));
        assert!(command_allowed("STOP", EquipmentState::Pause));
        assert!(command_allowed("RESET", EquipmentState::Alarm));
        assert!(!command_allowed("RESET", EquipmentState::Idle));
        assert!(command_allowed("REMOTE", EquipmentState::Down));
        assert!(!command_allowed("LOCAL", EquipmentState::Unknown));
    }

    #[test]
    fn vendor_commands_only_from_idle() {
        assert!(command_allowed("PURGE-CHAMBER", EquipmentState::Idle));
        assert!(!command_allowed("PURGE-CHAMBER", EquipmentState::Maintenance));
    }

    #[test]
    fn overdue_only_while_unfinished() {
        let now = Utc::now();
        let mut cmd = RemoteCommand::new(
            "START",
            serde_json::Value::Null,
            "host",
            chrono::Duration::seconds(10),
            now,
        );
        assert!(!cmd.is_overdue(now));
        assert!(cmd.is_overdue(now + chrono::Duration::seconds(10)));
        cmd.status = CommandStatus::Completed;
        assert!(!cmd.is_overdue(now + chrono::Duration::seconds(10)));
    }
}
