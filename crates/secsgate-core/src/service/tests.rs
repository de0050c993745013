#![allow(clippy::unwrap_used)]

use std::time::Duration;

use pretty_assertions::assert_eq;
use secsgate_hsms::sim::{SimulatedEquipment, SimulatedFactory};
use secsgate_hsms::standard::hcack;
use secsgate_hsms::{Endpoint, HsmsConfig, RetryPolicy};

use super::*;
use crate::config::{DEFAULT_STATE_SVID, DeviceSettings};
use crate::model::HealthStatus;
use crate::ports::{EquipmentRepository, StatusCache};
use crate::store::StaticConfigSource;

fn endpoint() -> Endpoint {
    "10.2.0.5:5000".parse().unwrap()
}

fn settings() -> DeviceSettings {
    DeviceSettings {
        hsms: HsmsConfig {
            t3: Duration::from_millis(500),
            t5: Duration::from_millis(10),
            heartbeat_interval: Duration::ZERO,
            auto_reconnect: false,
            retry: RetryPolicy {
                jitter: false,
                initial_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
            ..HsmsConfig::default()
        },
        connect_timeout: Duration::from_secs(2),
        settle_delay: Duration::ZERO,
        restart_delay: Duration::from_millis(10),
        state_sync_interval: Duration::from_secs(3600),
        command_sweep_interval: Duration::from_secs(3600),
        ..DeviceSettings::default()
    }
}

struct Harness {
    service: DeviceService,
    tool: SimulatedEquipment,
    collaborators: Collaborators,
}

fn harness(settings: DeviceSettings) -> Harness {
    let factory = Arc::new(SimulatedFactory::new());
    let tool = factory.add(
        endpoint(),
        SimulatedEquipment::new("ETCH-3000", "4.2")
            .with_variable(DEFAULT_STATE_SVID, SecsItem::ascii("IDLE")),
    );
    let id = EquipmentId::new("ETCH-01").unwrap();
    let config = DeviceConfig::new(id.clone(), endpoint(), settings);
    let equipment = Equipment::register(id, "Etch 01", endpoint(), Utc::now());
    let collaborators = Collaborators::in_memory(StaticConfigSource::default());
    let service = DeviceService::new(config, equipment, factory, collaborators.clone());
    Harness {
        service,
        tool,
        collaborators,
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn start_connects_syncs_and_persists() {
    let h = harness(settings());
    h.tool
        .set_variable(DEFAULT_STATE_SVID, SecsItem::ascii("EXECUTING"));
    let mut events = h.service.subscribe_events();

    h.service.start().await.unwrap();

    assert_eq!(h.service.status(), ServiceState::Started);
    let eq = h.service.equipment();
    assert!(eq.is_connected());
    assert_eq!(eq.state(), EquipmentState::Executing);
    assert_eq!(eq.state_changed_by(), Some(DEVICE_ACTOR));

    let id = h.service.equipment_id();
    let saved = h.collaborators.repository.load(&id).await.unwrap().unwrap();
    assert_eq!(saved.version(), eq.version());
    let cached = h.collaborators.status_cache.get(&id).await.unwrap().unwrap();
    assert_eq!(cached.state, EquipmentState::Executing);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec!["registered", "connected", "state_changed", "state_changed"]
    );

    // idempotent while started
    h.service.start().await.unwrap();
    h.service.dispose().await;
}

#[tokio::test]
async fn unreachable_device_faults_the_service() {
    let h = harness(settings());
    h.tool.fail_next_opens(1);

    let err = h.service.start().await.unwrap_err();

    assert_eq!(err.kind(), crate::error::ErrorKind::NotConnected);
    assert_eq!(h.service.status(), ServiceState::Faulted);
    assert!(!h.service.equipment().is_connected());
}

#[tokio::test]
async fn stop_marks_down_and_is_idempotent() {
    let h = harness(settings());
    h.service.start().await.unwrap();

    h.service.stop("maintenance window").await.unwrap();

    assert_eq!(h.service.status(), ServiceState::Stopped);
    let eq = h.service.equipment();
    assert!(!eq.is_connected());
    assert_eq!(eq.state(), EquipmentState::Down);
    assert_eq!(eq.state_reason(), Some("maintenance window"));
    assert!(!h.service.client().is_connected());

    h.service.stop("again").await.unwrap();
    assert_eq!(h.service.status(), ServiceState::Stopped);
}

#[tokio::test]
async fn restart_reconnects_and_resyncs() {
    let h = harness(settings());
    h.service.start().await.unwrap();

    h.service.restart().await.unwrap();

    assert_eq!(h.service.status(), ServiceState::Started);
    let eq = h.service.equipment();
    assert!(eq.is_connected());
    assert_eq!(eq.state(), EquipmentState::Idle);
    h.service.dispose().await;
}

#[tokio::test]
async fn accepted_command_completes_and_moves_state() {
    let h = harness(settings());
    let _ = h
        .tool
        .clone()
        .with_command_effect("START", DEFAULT_STATE_SVID, SecsItem::ascii("EXECUTING"));
    h.service.start().await.unwrap();

    let command = h
        .service
        .send_remote_command("START", &[("RECIPE".into(), SecsItem::ascii("R1"))], "operator")
        .await
        .unwrap();

    assert_eq!(command.status, CommandStatus::Completed);
    assert_eq!(command.parameters["RECIPE"], "R1");
    assert_eq!(h.tool.commands(), vec!["START".to_owned()]);

    assert_eq!(h.service.sync_state().await.unwrap(), EquipmentState::Executing);
    assert_eq!(h.service.equipment().state(), EquipmentState::Executing);
    h.service.dispose().await;
}

#[tokio::test]
async fn rejected_command_fails_with_the_ack_code() {
    let h = harness(settings());
    h.service.start().await.unwrap();
    h.tool.set_hcack(hcack::CANNOT_PERFORM_NOW);

    let command = h
        .service
        .send_remote_command("START", &[], "operator")
        .await
        .unwrap();

    assert_eq!(command.status, CommandStatus::Failed);
    assert!(command.result_message.unwrap().starts_with("HCACK 2"));
    assert_eq!(h.service.equipment().command_history().len(), 1);
    h.service.dispose().await;
}

#[tokio::test]
async fn silent_device_fails_command_with_no_response() {
    let h = harness(settings());
    h.service.start().await.unwrap();
    h.tool.set_responding(false);

    let command = h
        .service
        .send_remote_command("START", &[], "operator")
        .await
        .unwrap();

    assert_eq!(command.status, CommandStatus::Failed);
    assert_eq!(command.result_message.as_deref(), Some("no response"));
    h.service.dispose().await;
}

#[tokio::test]
async fn disallowed_command_is_never_sent() {
    let h = harness(settings());
    h.service.start().await.unwrap();

    let err = h
        .service
        .send_remote_command("STOP", &[], "operator")
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::CommandNotAllowed { .. }));
    assert!(h.tool.commands().is_empty());
    assert_eq!(h.service.equipment().command_history().len(), 0);
    h.service.dispose().await;
}

#[tokio::test]
async fn remote_control_can_be_disabled() {
    let mut settings = settings();
    settings.remote_control.enabled = false;
    let h = harness(settings);
    h.service.start().await.unwrap();

    let err = h
        .service
        .send_remote_command("START", &[], "operator")
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::RemoteControlDisabled { .. }));
    h.service.dispose().await;
}

#[tokio::test]
async fn commands_require_a_connection() {
    let h = harness(settings());
    let err = h
        .service
        .send_remote_command("START", &[], "operator")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotConnected));
}

#[tokio::test]
async fn device_alarms_drive_the_alarm_state() {
    let h = harness(settings());
    h.service.start().await.unwrap();

    h.tool.raise_alarm(7, 2, "chamber door open");
    eventually(|| h.service.equipment().state() == EquipmentState::Alarm).await;

    let eq = h.service.equipment();
    let alarm = eq.active_alarm(7).unwrap();
    assert_eq!(alarm.severity, AlarmSeverity::Critical);
    assert_eq!(alarm.text, "chamber door open");
    assert!(h.tool.received().iter().any(|m| (m.stream, m.function) == (5, 2)));

    let health = h.service.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.critical_alarms, 1);

    h.tool.clear_alarm(7);
    eventually(|| h.service.equipment().state() == EquipmentState::Idle).await;
    assert_eq!(h.service.equipment().active_alarms().len(), 0);
    h.service.dispose().await;
}

#[tokio::test]
async fn event_reports_land_in_the_trace_window() {
    let h = harness(settings());
    h.service.start().await.unwrap();

    h.tool.send_event_report(
        300,
        vec![(11, vec![SecsItem::u4(42), SecsItem::ascii("LOT-9")])],
    );
    eventually(|| h.service.equipment().recent_trace().len() == 1).await;

    let eq = h.service.equipment();
    let trace = eq.recent_trace().next().unwrap();
    assert_eq!(trace.event_id, Some(300));
    assert_eq!(trace.report_id, 11);
    assert_eq!(trace.values[&0], 42);
    assert_eq!(trace.values[&1], "LOT-9");
    h.service.dispose().await;
}

#[tokio::test]
async fn polled_data_is_recorded() {
    let mut settings = settings();
    settings.data_collection.variable_ids = vec![2001, 2002];
    let h = harness(settings);
    h.tool.set_variable(2001, SecsItem::f8(1.5));
    h.tool.set_variable(2002, SecsItem::u4(9));
    h.service.start().await.unwrap();

    let trace = h.service.collect_data().await.unwrap().unwrap();

    assert_eq!(trace.report_id, POLLED_REPORT_ID);
    assert_eq!(trace.event_id, None);
    assert_eq!(trace.values[&2001], 1.5);
    assert_eq!(trace.values[&2002], 9);
    assert!(h.service.equipment().last_data_update().is_some());
    h.service.dispose().await;
}

#[tokio::test]
async fn alarm_sync_enables_and_reconciles() {
    let mut settings = settings();
    settings.alarms.alarm_ids = vec![7, 8];
    let h = harness(settings);
    h.service.start().await.unwrap();

    assert_eq!(h.service.enable_alarms().await.unwrap(), 2);
    assert_eq!(h.tool.enabled_alarms().into_iter().collect::<Vec<_>>(), vec![7, 8]);

    // an alarm the tool no longer reports is cleared
    h.service
        .mutate(|eq, now| {
            eq.add_alarm(AlarmEvent::new(8, "stale", AlarmSeverity::Minor, now), now)
        })
        .await;
    assert_eq!(h.service.sync_alarms().await.unwrap(), 1);
    assert!(h.service.equipment().active_alarm(8).is_none());

    assert_eq!(h.service.disable_alarms().await.unwrap(), 2);
    assert!(h.tool.enabled_alarms().is_empty());
    h.service.dispose().await;
}

#[tokio::test]
async fn dropped_link_disconnects_the_aggregate() {
    let h = harness(settings());
    h.tool
        .set_variable(DEFAULT_STATE_SVID, SecsItem::ascii("EXECUTING"));
    h.service.start().await.unwrap();

    h.tool.drop_link();
    eventually(|| !h.service.equipment().is_connected()).await;

    let eq = h.service.equipment();
    assert_eq!(eq.state(), EquipmentState::Fault);
    eventually(|| h.service.status() == ServiceState::Faulted).await;

    let health = h.service.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.reasons.iter().any(|r| r == "not connected"));
    h.service.dispose().await;
}

#[tokio::test]
async fn healthy_device_reports_round_trip() {
    let h = harness(settings());
    h.service.start().await.unwrap();

    let health = h.service.health_check().await;

    assert!(health.is_healthy(), "{:?}", health.reasons);
    assert!(health.round_trip.is_some());
    assert_eq!(health.active_alarms, 0);
    h.service.dispose().await;
}

#[tokio::test]
async fn major_alarm_holds_alarm_state_against_sync() {
    let h = harness(settings());
    h.service.start().await.unwrap();
    h.tool.raise_alarm(5, 4, "vacuum low");
    eventually(|| h.service.equipment().state() == EquipmentState::Alarm).await;

    // the tool still reports IDLE
    assert_eq!(h.service.sync_state().await.unwrap(), EquipmentState::Idle);
    assert_eq!(h.service.equipment().state(), EquipmentState::Alarm);
    h.service.dispose().await;
}

#[tokio::test]
async fn stop_abandons_a_request_stuck_on_a_silent_device() {
    let h = harness(DeviceSettings {
        hsms: HsmsConfig {
            t3: Duration::from_secs(3),
            ..settings().hsms
        },
        state_sync_interval: Duration::from_millis(50),
        ..settings()
    });
    h.service.start().await.unwrap();

    h.tool.set_responding(false);
    // let a periodic sync get stuck waiting on its reply
    tokio::time::sleep(Duration::from_millis(120)).await;

    let started = std::time::Instant::now();
    h.service.stop("operator").await.unwrap();
    let took = started.elapsed();

    assert!(took < Duration::from_secs(1), "stop took {took:?}");
    assert_eq!(h.service.status(), ServiceState::Stopped);
    assert!(!h.service.is_connected());
    h.service.dispose().await;
}

#[tokio::test]
async fn refused_session_is_accepted_once_maintenance_ends() {
    let h = harness(DeviceSettings {
        hsms: HsmsConfig {
            auto_reconnect: true,
            ..settings().hsms
        },
        ..settings()
    });
    h.service.start().await.unwrap();
    h.tool
        .set_variable(DEFAULT_STATE_SVID, SecsItem::ascii("MAINTENANCE"));
    h.service.sync_state().await.unwrap();
    assert_eq!(h.service.equipment().state(), EquipmentState::Maintenance);

    // the tool comes back while still in maintenance; the aggregate refuses it
    h.tool.drop_link();
    eventually(|| !h.service.equipment().is_connected()).await;
    eventually(|| h.service.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.service.equipment().is_connected());

    h.tool.set_variable(DEFAULT_STATE_SVID, SecsItem::ascii("IDLE"));
    assert_eq!(h.service.sync_state().await.unwrap(), EquipmentState::Idle);

    let eq = h.service.equipment();
    assert_eq!(eq.state(), EquipmentState::Idle);
    assert!(eq.is_connected());
    let id = h.service.equipment_id();
    let cached = h.collaborators.status_cache.get(&id).await.unwrap().unwrap();
    assert!(cached.connected);
    h.service.dispose().await;
}
