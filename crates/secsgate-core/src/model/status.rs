use chrono::{DateTime, Utc};
use secsgate_hsms::ConnectionQuality;
use serde::{Deserialize, Serialize};

use super::alarm::AlarmSeverity;
use super::equipment_id::EquipmentId;
use super::state::{EquipmentState, HealthStatus};

/// Point-in-time status written to the status cache after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub equipment_id: EquipmentId,
    pub state: EquipmentState,
    pub health: HealthStatus,
    pub connected: bool,
    pub quality: ConnectionQuality,
    pub active_alarms: usize,
    pub highest_severity: Option<AlarmSeverity>,
    pub pending_commands: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_data_update: Option<DateTime<Utc>>,
    pub version: u64,
    pub captured_at: DateTime<Utc>,
}
