// ── Runtime configuration for devices and the fleet ──
//
// Built by secsgate-config from the on-disk file; tests construct
// these directly.

use std::time::Duration;

use secsgate_hsms::{Endpoint, HsmsConfig};

use crate::error::CoreError;
use crate::model::EquipmentId;

/// Status variable that reports the operating state (GEM `ControlState`
/// style). The value is a state code or name.
pub const DEFAULT_STATE_SVID: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct DataCollectionSettings {
    pub enabled: bool,
    /// Data variables polled with S2F13.
    pub variable_ids: Vec<u32>,
    /// Collection events enabled with S2F37.
    pub event_ids: Vec<u32>,
    pub interval: Duration,
}

impl Default for DataCollectionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            variable_ids: Vec::new(),
            event_ids: Vec::new(),
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSettings {
    pub enabled: bool,
    /// Alarms enabled with S5F3 on start.
    pub alarm_ids: Vec<u32>,
    /// Period of the S5F5 reconciliation sweep.
    pub sync_interval: Duration,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            alarm_ids: Vec::new(),
            sync_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteControlSettings {
    pub enabled: bool,
    pub command_timeout: Duration,
}

impl Default for RemoteControlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-device behaviour. The fleet holds one set of defaults that
/// individual devices may override.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub hsms: HsmsConfig,
    pub connect_timeout: Duration,
    pub state_svid: u32,
    pub state_sync_interval: Duration,
    pub data_collection: DataCollectionSettings,
    pub alarms: AlarmSettings,
    pub remote_control: RemoteControlSettings,
    /// Pause between connecting and starting data/alarm loops.
    pub settle_delay: Duration,
    /// Pause between stop and start on restart.
    pub restart_delay: Duration,
    pub status_ttl: Duration,
    pub command_sweep_interval: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            hsms: HsmsConfig::default(),
            connect_timeout: Duration::from_secs(30),
            state_svid: DEFAULT_STATE_SVID,
            state_sync_interval: Duration::from_secs(15),
            data_collection: DataCollectionSettings::default(),
            alarms: AlarmSettings::default(),
            remote_control: RemoteControlSettings::default(),
            settle_delay: Duration::from_secs(2),
            restart_delay: Duration::from_secs(5),
            status_ttl: Duration::from_secs(300),
            command_sweep_interval: Duration::from_secs(5),
        }
    }
}

impl DeviceSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        self.hsms.validate()?;
        non_zero("connect_timeout", self.connect_timeout)?;
        non_zero("state_sync_interval", self.state_sync_interval)?;
        non_zero("command_sweep_interval", self.command_sweep_interval)?;
        if self.data_collection.enabled {
            non_zero("data_collection.interval", self.data_collection.interval)?;
        }
        if self.alarms.enabled {
            non_zero("alarms.sync_interval", self.alarms.sync_interval)?;
        }
        if self.remote_control.enabled {
            non_zero(
                "remote_control.command_timeout",
                self.remote_control.command_timeout,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub equipment_id: EquipmentId,
    pub name: String,
    pub endpoint: Endpoint,
    pub settings: DeviceSettings,
}

impl DeviceConfig {
    pub fn new(equipment_id: EquipmentId, endpoint: Endpoint, settings: DeviceSettings) -> Self {
        Self {
            name: equipment_id.to_string(),
            equipment_id,
            endpoint,
            settings,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("name", "must not be empty"));
        }
        self.settings.validate()
    }
}

/// Status variables read during the bootstrap handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentitySvids {
    pub equipment_id: u32,
    pub manufacturer: u32,
    pub serial: u32,
}

impl Default for IdentitySvids {
    fn default() -> Self {
        Self {
            equipment_id: 1001,
            manufacturer: 1002,
            serial: 1003,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Ceiling on simultaneous connection attempts, not on connected devices.
    pub max_concurrent_connections: usize,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub cleanup_interval: Duration,
    /// Unhealthy devices idle longer than this are evicted.
    pub stale_threshold: Duration,
    /// Model (`MDLN`) prefixes the fleet accepts. Empty accepts all.
    pub accepted_model_prefixes: Vec<String>,
    pub identity_svids: IdentitySvids,
    pub device_defaults: DeviceSettings,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            connect_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            stale_threshold: Duration::from_secs(600),
            accepted_model_prefixes: Vec::new(),
            identity_svids: IdentitySvids::default(),
            device_defaults: DeviceSettings::default(),
        }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_connections == 0 {
            return Err(CoreError::validation(
                "max_concurrent_connections",
                "must be at least 1",
            ));
        }
        non_zero("connect_timeout", self.connect_timeout)?;
        non_zero("health_check_interval", self.health_check_interval)?;
        non_zero("cleanup_interval", self.cleanup_interval)?;
        non_zero("stale_threshold", self.stale_threshold)?;
        self.device_defaults.validate()
    }

    pub fn accepts_model(&self, model: &str) -> bool {
        self.accepted_model_prefixes.is_empty()
            || self
                .accepted_model_prefixes
                .iter()
                .any(|prefix| model.starts_with(prefix.as_str()))
    }
}

fn non_zero(field: &str, value: Duration) -> Result<(), CoreError> {
    if value.is_zero() {
        return Err(CoreError::validation(field, "must be greater than zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(FleetConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut settings = DeviceSettings::default();
        settings.data_collection.enabled = true;
        settings.data_collection.interval = Duration::ZERO;
        assert!(settings.validate().is_err());

        let fleet = FleetConfig {
            max_concurrent_connections: 0,
            ..FleetConfig::default()
        };
        assert!(fleet.validate().is_err());
    }

    #[test]
    fn model_prefix_filter() {
        let fleet = FleetConfig {
            accepted_model_prefixes: vec!["ETCH".into(), "CVD".into()],
            ..FleetConfig::default()
        };
        assert!(fleet.accepts_model("ETCH-9000"));
        assert!(!fleet.accepts_model("LITHO-1"));
        assert!(FleetConfig::default().accepts_model("anything"));
    }
}
