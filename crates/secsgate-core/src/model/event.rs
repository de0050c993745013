// ── Domain events ──
//
// Buffered on the aggregate and drained by the orchestration layer after
// each mutation. The aggregate never publishes on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use uuid::Uuid;

use super::alarm::AlarmEvent;
use super::command::CommandStatus;
use super::equipment_id::EquipmentId;
use super::state::EquipmentState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DomainEvent {
    Registered {
        equipment_id: EquipmentId,
        name: String,
        endpoint: String,
        at: DateTime<Utc>,
    },
    Connected {
        equipment_id: EquipmentId,
        session_id: String,
        at: DateTime<Utc>,
    },
    Disconnected {
        equipment_id: EquipmentId,
        reason: String,
        expected: bool,
        at: DateTime<Utc>,
    },
    StateChanged {
        equipment_id: EquipmentId,
        from: EquipmentState,
        to: EquipmentState,
        actor: String,
        reason: String,
        at: DateTime<Utc>,
    },
    AttentionRequired {
        equipment_id: EquipmentId,
        state: EquipmentState,
        reason: String,
        cancelled_commands: usize,
        at: DateTime<Utc>,
    },
    AlarmTriggered {
        equipment_id: EquipmentId,
        alarm: AlarmEvent,
        at: DateTime<Utc>,
    },
    AlarmCleared {
        equipment_id: EquipmentId,
        alarm: AlarmEvent,
        at: DateTime<Utc>,
    },
    AlarmAcknowledged {
        equipment_id: EquipmentId,
        alarm_id: u32,
        by: String,
        at: DateTime<Utc>,
    },
    CommandRequested {
        equipment_id: EquipmentId,
        command_id: Uuid,
        name: String,
        requested_by: String,
        at: DateTime<Utc>,
    },
    CommandCompleted {
        equipment_id: EquipmentId,
        command_id: Uuid,
        name: String,
        status: CommandStatus,
        message: Option<String>,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Stable snake_case name, also used as the serde tag.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn equipment_id(&self) -> &EquipmentId {
        match self {
            Self::Registered { equipment_id, .. }
            | Self::Connected { equipment_id, .. }
            | Self::Disconnected { equipment_id, .. }
            | Self::StateChanged { equipment_id, .. }
            | Self::AttentionRequired { equipment_id, .. }
            | Self::AlarmTriggered { equipment_id, .. }
            | Self::AlarmCleared { equipment_id, .. }
            | Self::AlarmAcknowledged { equipment_id, .. }
            | Self::CommandRequested { equipment_id, .. }
            | Self::CommandCompleted { equipment_id, .. } => equipment_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Registered { at, .. }
            | Self::Connected { at, .. }
            | Self::Disconnected { at, .. }
            | Self::StateChanged { at, .. }
            | Self::AttentionRequired { at, .. }
            | Self::AlarmTriggered { at, .. }
            | Self::AlarmCleared { at, .. }
            | Self::AlarmAcknowledged { at, .. }
            | Self::CommandRequested { at, .. }
            | Self::CommandCompleted { at, .. } => *at,
        }
    }
}
