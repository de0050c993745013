use std::time::Duration;

use chrono::{DateTime, Utc};
use secsgate_hsms::ConnectionQuality;
use serde::Serialize;
use tracing::debug;

use super::{DeviceService, ServiceState};
use crate::model::{AlarmSeverity, EquipmentId, EquipmentState, HealthStatus};

/// Outcome of one device health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub equipment_id: EquipmentId,
    pub status: HealthStatus,
    pub connected: bool,
    pub quality: ConnectionQuality,
    pub active_alarms: usize,
    pub critical_alarms: usize,
    /// S1F1 round trip, when the probe was sent and answered.
    pub round_trip: Option<Duration>,
    /// Why the status is not `Healthy`, most severe first.
    pub reasons: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

fn rank(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Unknown => 1,
        HealthStatus::Degraded => 2,
        HealthStatus::Unhealthy => 3,
    }
}

struct Verdict {
    status: HealthStatus,
    reasons: Vec<(HealthStatus, String)>,
}

impl Verdict {
    fn worsen(&mut self, status: HealthStatus, reason: impl Into<String>) {
        if rank(status) > rank(self.status) {
            self.status = status;
        }
        self.reasons.push((status, reason.into()));
    }
}

pub(super) async fn check(service: &DeviceService) -> HealthCheckResult {
    let now = Utc::now();
    let client = service.client();
    let equipment = service.equipment();
    let connection = client.connection_state();
    let quality = connection.quality(now);
    let connected = client.is_connected();

    let active_alarms = equipment.active_alarms().len();
    let critical_alarms = equipment
        .active_alarms()
        .filter(|a| a.severity >= AlarmSeverity::Critical)
        .count();

    let mut verdict = Verdict {
        status: HealthStatus::Healthy,
        reasons: Vec::new(),
    };
    let mut round_trip = None;

    if connected {
        let failures = client.statistics().consecutive_heartbeat_failures;
        if failures > 0 {
            verdict.worsen(
                HealthStatus::Degraded,
                format!("{failures} consecutive link test failures"),
            );
        }
        if quality == ConnectionQuality::Poor {
            verdict.worsen(HealthStatus::Degraded, "stale heartbeat");
        }
        match client.test_connection().await {
            Ok(rtt) => round_trip = Some(rtt),
            Err(e) => verdict.worsen(HealthStatus::Unhealthy, format!("S1F1 probe failed: {e}")),
        }
    } else {
        verdict.worsen(HealthStatus::Unhealthy, "not connected");
    }

    if critical_alarms > 0 {
        verdict.worsen(
            HealthStatus::Unhealthy,
            format!("{critical_alarms} critical alarms active"),
        );
    } else if active_alarms > 0 {
        verdict.worsen(
            HealthStatus::Degraded,
            format!("{active_alarms} alarms active"),
        );
    }

    if equipment.state() == EquipmentState::Fault {
        verdict.worsen(HealthStatus::Unhealthy, "equipment in FAULT");
    }

    let lifecycle = service.status();
    if lifecycle != ServiceState::Started {
        verdict.worsen(HealthStatus::Degraded, format!("service {lifecycle}"));
    }

    let Verdict { status, mut reasons } = verdict;
    reasons.sort_by_key(|(s, _)| std::cmp::Reverse(rank(*s)));
    debug!(equipment_id = %equipment.id(), status = ?status, "health check");

    HealthCheckResult {
        equipment_id: equipment.id().clone(),
        status,
        connected,
        quality,
        active_alarms,
        critical_alarms,
        round_trip,
        reasons: reasons.into_iter().map(|(_, r)| r).collect(),
        checked_at: now,
    }
}
