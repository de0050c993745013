//! Configuration for the secsgate gateway.
//!
//! A single TOML file describes fleet behaviour, per-device defaults, and
//! the statically known tools. Loading layers built-in defaults, the file,
//! and `SECSGATE_*` environment variables (`__` separates nested keys, so
//! `SECSGATE_FLEET__MAX_CONCURRENT_CONNECTIONS=4` sets
//! `fleet.max_concurrent_connections`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use secsgate_core::{
    AlarmSettings, CoreError, DataCollectionSettings, DeviceConfig, DeviceSettings, EquipmentId,
    FleetConfig, IdentitySvids, RemoteControlSettings, StaticConfigSource,
};
use secsgate_hsms::{ConnectionMode, Endpoint, HsmsConfig, RetryPolicy};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("failed to load config: {0}")]
    Figment(Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl ConfigError {
    fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Re-home a core validation error under a config path prefix.
    fn from_core(prefix: &str, err: CoreError) -> Self {
        match err {
            CoreError::Validation { field, reason } => {
                Self::validation(join_field(prefix, &field), reason)
            }
            other => Self::validation(prefix.trim_end_matches('.'), other.to_string()),
        }
    }
}

fn join_field(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_owned()
    } else {
        format!("{prefix}{field}")
    }
}

// ── Top-level config ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub fleet: FleetSection,
    pub defaults: DefaultsSection,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    /// Simultaneous connection attempts, not connected devices.
    pub max_concurrent_connections: usize,
    pub connect_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub stale_threshold_secs: u64,
    /// How long a published device status stays cached.
    pub status_ttl_secs: u64,
    /// Accepted `MDLN` prefixes. Empty accepts every model.
    pub accepted_model_prefixes: Vec<String>,
    pub identity: IdentitySection,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            connect_timeout_secs: 30,
            health_check_interval_secs: 60,
            cleanup_interval_secs: 300,
            stale_threshold_secs: 600,
            status_ttl_secs: 300,
            accepted_model_prefixes: Vec::new(),
            identity: IdentitySection::default(),
        }
    }
}

/// Status variables read while identifying a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub equipment_id_svid: u32,
    pub manufacturer_svid: u32,
    pub serial_svid: u32,
}

impl Default for IdentitySection {
    fn default() -> Self {
        let svids = IdentitySvids::default();
        Self {
            equipment_id_svid: svids.equipment_id,
            manufacturer_svid: svids.manufacturer,
            serial_svid: svids.serial,
        }
    }
}

impl From<IdentitySection> for IdentitySvids {
    fn from(section: IdentitySection) -> Self {
        Self {
            equipment_id: section.equipment_id_svid,
            manufacturer: section.manufacturer_svid,
            serial: section.serial_svid,
        }
    }
}

// ── Device defaults ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub hsms: HsmsSection,
    pub state_svid: u32,
    pub state_sync_interval_secs: u64,
    pub settle_delay_ms: u64,
    pub restart_delay_ms: u64,
    pub command_sweep_interval_secs: u64,
    pub data_collection: DataCollectionSection,
    pub alarms: AlarmSection,
    pub remote_control: RemoteControlSection,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        let settings = DeviceSettings::default();
        Self {
            hsms: HsmsSection::default(),
            state_svid: settings.state_svid,
            state_sync_interval_secs: settings.state_sync_interval.as_secs(),
            settle_delay_ms: millis(settings.settle_delay),
            restart_delay_ms: millis(settings.restart_delay),
            command_sweep_interval_secs: settings.command_sweep_interval.as_secs(),
            data_collection: DataCollectionSection::default(),
            alarms: AlarmSection::default(),
            remote_control: RemoteControlSection::default(),
        }
    }
}

/// HSMS timers in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmsSection {
    pub device_id: u16,
    pub mode: ConnectionMode,
    pub t3_ms: u64,
    pub t5_ms: u64,
    pub t6_ms: u64,
    pub t7_ms: u64,
    pub t8_ms: u64,
    /// Zero disables link-test heartbeats.
    pub heartbeat_interval_ms: u64,
    pub heartbeat_failure_threshold: u32,
    pub auto_reconnect: bool,
    pub retry: RetrySection,
}

impl Default for HsmsSection {
    fn default() -> Self {
        let hsms = HsmsConfig::default();
        Self {
            device_id: hsms.device_id,
            mode: hsms.mode,
            t3_ms: millis(hsms.t3),
            t5_ms: millis(hsms.t5),
            t6_ms: millis(hsms.t6),
            t7_ms: millis(hsms.t7),
            t8_ms: millis(hsms.t8),
            heartbeat_interval_ms: millis(hsms.heartbeat_interval),
            heartbeat_failure_threshold: hsms.heartbeat_failure_threshold,
            auto_reconnect: hsms.auto_reconnect,
            retry: RetrySection::default(),
        }
    }
}

impl HsmsSection {
    fn to_hsms_config(&self) -> HsmsConfig {
        HsmsConfig {
            device_id: self.device_id,
            mode: self.mode,
            t3: Duration::from_millis(self.t3_ms),
            t5: Duration::from_millis(self.t5_ms),
            t6: Duration::from_millis(self.t6_ms),
            t7: Duration::from_millis(self.t7_ms),
            t8: Duration::from_millis(self.t8_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_failure_threshold: self.heartbeat_failure_threshold,
            auto_reconnect: self.auto_reconnect,
            retry: self.retry.to_policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay_ms: millis(policy.initial_delay),
            multiplier: policy.multiplier,
            max_delay_ms: millis(policy.max_delay),
            jitter: policy.jitter,
        }
    }
}

impl RetrySection {
    fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCollectionSection {
    pub enabled: bool,
    pub variable_ids: Vec<u32>,
    pub event_ids: Vec<u32>,
    pub interval_secs: u64,
}

impl Default for DataCollectionSection {
    fn default() -> Self {
        let settings = DataCollectionSettings::default();
        Self {
            enabled: settings.enabled,
            variable_ids: settings.variable_ids,
            event_ids: settings.event_ids,
            interval_secs: settings.interval.as_secs(),
        }
    }
}

impl From<&DataCollectionSection> for DataCollectionSettings {
    fn from(section: &DataCollectionSection) -> Self {
        Self {
            enabled: section.enabled,
            variable_ids: section.variable_ids.clone(),
            event_ids: section.event_ids.clone(),
            interval: Duration::from_secs(section.interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmSection {
    pub enabled: bool,
    pub alarm_ids: Vec<u32>,
    pub sync_interval_secs: u64,
}

impl Default for AlarmSection {
    fn default() -> Self {
        let settings = AlarmSettings::default();
        Self {
            enabled: settings.enabled,
            alarm_ids: settings.alarm_ids,
            sync_interval_secs: settings.sync_interval.as_secs(),
        }
    }
}

impl From<&AlarmSection> for AlarmSettings {
    fn from(section: &AlarmSection) -> Self {
        Self {
            enabled: section.enabled,
            alarm_ids: section.alarm_ids.clone(),
            sync_interval: Duration::from_secs(section.sync_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteControlSection {
    pub enabled: bool,
    pub command_timeout_secs: u64,
}

impl Default for RemoteControlSection {
    fn default() -> Self {
        let settings = RemoteControlSettings::default();
        Self {
            enabled: settings.enabled,
            command_timeout_secs: settings.command_timeout.as_secs(),
        }
    }
}

impl From<&RemoteControlSection> for RemoteControlSettings {
    fn from(section: &RemoteControlSection) -> Self {
        Self {
            enabled: section.enabled,
            command_timeout: Duration::from_secs(section.command_timeout_secs),
        }
    }
}

// ── Devices ─────────────────────────────────────────────────────────

/// A statically known tool. Unset fields inherit from `[defaults]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    /// `ip:port` of the tool's HSMS listener.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_svid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_collection: Option<DataCollectionSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarms: Option<AlarmSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_control: Option<RemoteControlSection>,
}

impl DeviceEntry {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            name: None,
            device_id: None,
            mode: None,
            auto_reconnect: None,
            state_svid: None,
            data_collection: None,
            alarms: None,
            remote_control: None,
        }
    }

    fn to_device_config(
        &self,
        defaults: &DeviceSettings,
        prefix: &str,
    ) -> Result<DeviceConfig, ConfigError> {
        let equipment_id = EquipmentId::new(self.id.as_str())
            .map_err(|e| ConfigError::validation(format!("{prefix}id"), e.to_string()))?;
        let endpoint: Endpoint = self
            .endpoint
            .parse()
            .map_err(|_| {
                ConfigError::validation(
                    format!("{prefix}endpoint"),
                    format!("expected ip:port, got '{}'", self.endpoint),
                )
            })?;

        let mut settings = defaults.clone();
        if let Some(device_id) = self.device_id {
            settings.hsms.device_id = device_id;
        }
        if let Some(mode) = self.mode {
            settings.hsms.mode = mode;
        }
        if let Some(auto_reconnect) = self.auto_reconnect {
            settings.hsms.auto_reconnect = auto_reconnect;
        }
        if let Some(svid) = self.state_svid {
            settings.state_svid = svid;
        }
        if let Some(section) = &self.data_collection {
            settings.data_collection = section.into();
        }
        if let Some(section) = &self.alarms {
            settings.alarms = section.into();
        }
        if let Some(section) = &self.remote_control {
            settings.remote_control = section.into();
        }

        let mut config = DeviceConfig::new(equipment_id, endpoint, settings);
        if let Some(name) = &self.name {
            config.name.clone_from(name);
        }
        config
            .validate()
            .map_err(|e| ConfigError::from_core(prefix, e))?;
        Ok(config)
    }
}

// ── Translation and validation ──────────────────────────────────────

impl GatewayConfig {
    /// Settings every device starts from before its own overrides.
    pub fn device_defaults(&self) -> DeviceSettings {
        let d = &self.defaults;
        DeviceSettings {
            hsms: d.hsms.to_hsms_config(),
            connect_timeout: Duration::from_secs(self.fleet.connect_timeout_secs),
            state_svid: d.state_svid,
            state_sync_interval: Duration::from_secs(d.state_sync_interval_secs),
            data_collection: (&d.data_collection).into(),
            alarms: (&d.alarms).into(),
            remote_control: (&d.remote_control).into(),
            settle_delay: Duration::from_millis(d.settle_delay_ms),
            restart_delay: Duration::from_millis(d.restart_delay_ms),
            status_ttl: Duration::from_secs(self.fleet.status_ttl_secs),
            command_sweep_interval: Duration::from_secs(d.command_sweep_interval_secs),
        }
    }

    pub fn to_fleet_config(&self) -> Result<FleetConfig, ConfigError> {
        let f = &self.fleet;
        let fleet = FleetConfig {
            max_concurrent_connections: f.max_concurrent_connections,
            connect_timeout: Duration::from_secs(f.connect_timeout_secs),
            health_check_interval: Duration::from_secs(f.health_check_interval_secs),
            cleanup_interval: Duration::from_secs(f.cleanup_interval_secs),
            stale_threshold: Duration::from_secs(f.stale_threshold_secs),
            accepted_model_prefixes: f.accepted_model_prefixes.clone(),
            identity_svids: f.identity.into(),
            device_defaults: self.device_defaults(),
        };
        fleet.validate().map_err(|e| {
            // Device-level fields live under [defaults].
            let prefix = match &e {
                CoreError::Validation { field, .. } if !is_fleet_field(field) => "defaults.",
                _ => "fleet.",
            };
            ConfigError::from_core(prefix, e)
        })?;
        Ok(fleet)
    }

    pub fn device_configs(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        let defaults = self.device_defaults();
        self.devices
            .iter()
            .enumerate()
            .map(|(i, entry)| entry.to_device_config(&defaults, &format!("devices[{i}].")))
            .collect()
    }

    /// In-memory configuration source for the fleet manager.
    pub fn config_source(&self) -> Result<StaticConfigSource, ConfigError> {
        Ok(StaticConfigSource::new(
            self.to_fleet_config()?,
            self.device_configs()?,
        ))
    }

    /// Check the whole file, reporting the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hsms = &self.defaults.hsms;
        if hsms.auto_reconnect && hsms.retry.max_retries == 0 {
            return Err(ConfigError::validation(
                "defaults.hsms.retry.max_retries",
                "must be at least 1 when auto_reconnect is enabled",
            ));
        }

        self.to_fleet_config()?;
        let devices = self.device_configs()?;

        let mut ids = HashSet::new();
        let mut endpoints = HashSet::new();
        for (i, device) in devices.iter().enumerate() {
            if !ids.insert(device.equipment_id.clone()) {
                return Err(ConfigError::validation(
                    format!("devices[{i}].id"),
                    format!("duplicate device id '{}'", device.equipment_id),
                ));
            }
            if !endpoints.insert(device.endpoint) {
                return Err(ConfigError::validation(
                    format!("devices[{i}].endpoint"),
                    format!("endpoint {} is already used by another device", device.endpoint),
                ));
            }
        }
        Ok(())
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn is_fleet_field(field: &str) -> bool {
    const FLEET_FIELDS: [&str; 5] = [
        "max_concurrent_connections",
        "connect_timeout",
        "health_check_interval",
        "cleanup_interval",
        "stale_threshold",
    ];
    FLEET_FIELDS.contains(&field)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ── Loading ─────────────────────────────────────────────────────────

/// Default location of the configuration file.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "secsgate", "secsgate").map_or_else(
        || PathBuf::from(".").join("secsgate.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Layered sources: defaults, then the file, then the environment.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(GatewayConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SECSGATE_").split("__"))
}

/// Load the config without validating it. A missing file yields defaults.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    Ok(figment(&path).extract()?)
}
