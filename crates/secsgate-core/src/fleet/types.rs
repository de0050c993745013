use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secsgate_hsms::Endpoint;
use serde::Serialize;
use strum::Display;

use crate::model::{EquipmentId, HealthStatus, MachineMetadata};
use crate::service::{DeviceService, HealthCheckResult};

/// One device to bring up: where it is and, optionally, who it should be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub ip: String,
    pub port: u16,
    pub expected_id: Option<String>,
}

impl ConnectTarget {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            expected_id: None,
        }
    }

    #[must_use]
    pub fn expecting(mut self, id: impl Into<String>) -> Self {
        self.expected_id = Some(id.into());
        self
    }
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum FailureKind {
    InvalidAddress,
    DuplicateDevice,
    TypeMismatch,
    IdMismatch,
    HandshakeFailed,
    ConnectTimeout,
    StartFailed,
    Cancelled,
    InvalidMetadata,
    NotFound,
}

/// Why a device could not be brought up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionFailure {
    pub kind: FailureKind,
    pub target: String,
    /// Known once the handshake has identified the tool.
    pub equipment_id: Option<EquipmentId>,
    pub reason: String,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.target, self.kind, self.reason)
    }
}

/// Outcome of one connection attempt. Expected failures are values, not
/// errors.
#[derive(Debug, Clone)]
pub enum ConnectionResult {
    Connected(Arc<DeviceConnection>),
    Failed(ConnectionFailure),
}

impl ConnectionResult {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn connection(&self) -> Option<&Arc<DeviceConnection>> {
        match self {
            Self::Connected(c) => Some(c),
            Self::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ConnectionFailure> {
        match self {
            Self::Connected(_) => None,
            Self::Failed(f) => Some(f),
        }
    }
}

/// Per-target results of a batch, in input order.
#[derive(Debug, Clone)]
pub struct BatchConnectResult {
    pub results: Vec<ConnectionResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BatchConnectResult {
    pub(crate) fn new(results: Vec<ConnectionResult>, elapsed: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.is_connected()).count();
        Self {
            failed: results.len() - succeeded,
            succeeded,
            results,
            elapsed,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Fraction of targets connected, `0.0` for an empty batch.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.succeeded as f64 / self.results.len() as f64
    }

    pub fn failures(&self) -> impl Iterator<Item = &ConnectionFailure> {
        self.results.iter().filter_map(ConnectionResult::failure)
    }
}

/// A device under fleet management.
pub struct DeviceConnection {
    pub equipment_id: EquipmentId,
    pub endpoint: Endpoint,
    pub metadata: MachineMetadata,
    pub service: DeviceService,
    pub connected_at: DateTime<Utc>,
    health: StdMutex<HealthStatus>,
    /// Unix millis of registration or the last check the tool answered.
    last_answered: AtomicI64,
}

impl DeviceConnection {
    pub(crate) fn new(
        equipment_id: EquipmentId,
        endpoint: Endpoint,
        metadata: MachineMetadata,
        service: DeviceService,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            equipment_id,
            endpoint,
            metadata,
            service,
            connected_at: now,
            health: StdMutex::new(HealthStatus::Healthy),
            last_answered: AtomicI64::new(now.timestamp_millis()),
        }
    }

    /// Verdict of the most recent fleet health check.
    pub fn health(&self) -> HealthStatus {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthStatus::Healthy
    }

    /// Latest sign of life: registration, an answered health check, a
    /// link test, a state read, or data and alarms from the tool.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let answered = DateTime::from_timestamp_millis(self.last_answered.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at);
        let equipment = self.service.equipment();
        let link_test = self.service.client().connection_state().last_heartbeat_at;
        [equipment.last_heartbeat(), equipment.last_data_update(), link_test]
            .into_iter()
            .flatten()
            .fold(answered, DateTime::max)
    }

    pub(crate) fn record_health(&self, result: &HealthCheckResult) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = result.status;
        if result.round_trip.is_some() {
            self.last_answered
                .store(result.checked_at.timestamp_millis(), Ordering::Relaxed);
        }
    }

    /// Unhealthy and silent for longer than `threshold`. Degraded devices
    /// are never stale.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        if self.health() != HealthStatus::Unhealthy {
            return false;
        }
        let idle = now.signed_duration_since(self.last_activity());
        idle.to_std().is_ok_and(|idle| idle > threshold)
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("equipment_id", &self.equipment_id)
            .field("endpoint", &self.endpoint)
            .field("model", &self.metadata.model)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

/// Fleet-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub devices: usize,
    pub connected: usize,
    pub healthy: usize,
    pub with_active_alarms: usize,
    pub in_flight_attempts: usize,
}
