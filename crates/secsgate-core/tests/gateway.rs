//! End-to-end: a configured fleet of simulated tools driven through the
//! public API only.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use secsgate_core::{
    AlarmSettings, BroadcastEventPublisher, Collaborators, CommandStatus, ConnectTarget,
    DataCollectionSettings, DeviceConfig, DeviceSettings, EquipmentId, EquipmentState,
    FleetConfig, FleetManager, InMemoryEquipmentRepository, InMemoryStatusCache, StatusCache,
    StaticConfigSource,
};
use secsgate_hsms::sim::{SimulatedEquipment, SimulatedFactory};
use secsgate_hsms::{Endpoint, HsmsConfig, SecsItem};

const STATE_SVID: u32 = 1000;
const PRESSURE_VID: u32 = 3001;
const TIMEOUT: Duration = Duration::from_secs(2);

fn settings() -> DeviceSettings {
    DeviceSettings {
        hsms: HsmsConfig {
            t3: Duration::from_millis(500),
            t5: Duration::from_millis(10),
            heartbeat_interval: Duration::ZERO,
            auto_reconnect: false,
            ..HsmsConfig::default()
        },
        connect_timeout: TIMEOUT,
        settle_delay: Duration::ZERO,
        state_sync_interval: Duration::from_secs(3600),
        command_sweep_interval: Duration::from_secs(3600),
        data_collection: DataCollectionSettings {
            enabled: true,
            variable_ids: vec![PRESSURE_VID],
            event_ids: vec![100],
            interval: Duration::from_millis(50),
        },
        alarms: AlarmSettings {
            enabled: true,
            alarm_ids: vec![7, 8],
            sync_interval: Duration::from_secs(3600),
        },
        ..DeviceSettings::default()
    }
}

fn tool(id: &str) -> SimulatedEquipment {
    SimulatedEquipment::new("CVD-900", "3.2")
        .with_variable(STATE_SVID, SecsItem::ascii("IDLE"))
        .with_variable(1001, SecsItem::ascii(id))
        .with_variable(1002, SecsItem::ascii("Acme"))
        .with_variable(1003, SecsItem::ascii(format!("SN-{id}")))
        .with_variable(PRESSURE_VID, SecsItem::f8(1.25))
        .with_command_effect("START", STATE_SVID, SecsItem::ascii("EXECUTING"))
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn configured_fleet_runs_a_full_gem_session() {
    let ids = ["CVD-01", "CVD-02"];
    let endpoints: Vec<Endpoint> = (1..=2)
        .map(|n| format!("10.9.0.{n}:5000").parse().unwrap())
        .collect();

    let fleet_config = FleetConfig {
        max_concurrent_connections: 2,
        connect_timeout: TIMEOUT,
        accepted_model_prefixes: vec!["CVD".into()],
        device_defaults: settings(),
        ..FleetConfig::default()
    };
    let devices = ids.iter().zip(&endpoints).map(|(id, endpoint)| {
        DeviceConfig::new(EquipmentId::new(*id).unwrap(), *endpoint, settings())
    });

    let factory = Arc::new(SimulatedFactory::new());
    let tools: Vec<SimulatedEquipment> = ids
        .iter()
        .zip(&endpoints)
        .map(|(id, endpoint)| factory.add(*endpoint, tool(id)))
        .collect();

    let repository = Arc::new(InMemoryEquipmentRepository::new());
    let status_cache = Arc::new(InMemoryStatusCache::new());
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let collaborators = Collaborators {
        repository: repository.clone(),
        status_cache: status_cache.clone(),
        publisher: publisher.clone(),
        config_source: Arc::new(StaticConfigSource::new(fleet_config.clone(), devices)),
    };
    let fleet = FleetManager::new(fleet_config, factory.clone(), collaborators);

    // Bring-up.
    let targets = ids
        .iter()
        .zip(&endpoints)
        .map(|(id, endpoint)| ConnectTarget::new(endpoint.ip.to_string(), 5000).expecting(*id))
        .collect();
    let batch = fleet.connect_multiple(targets, 2).await;
    assert_eq!(batch.succeeded, 2, "{:?}", batch.failures().collect::<Vec<_>>());
    assert_eq!(repository.len(), 2);
    assert!(publisher.published() >= 2);

    let first = EquipmentId::new("CVD-01").unwrap();
    let device = fleet.device(&first).unwrap();
    assert_eq!(device.metadata.vendor, "Acme");
    assert_eq!(device.service.equipment().state(), EquipmentState::Idle);

    // Alarms and events are enabled on the tool, then data starts flowing.
    assert!(eventually(|| tools[0].enabled_alarms().len() == 2).await);
    assert!(eventually(|| tools[0].enabled_events().is_some_and(|e| e.contains(&100))).await);
    assert!(eventually(|| device.service.equipment().recent_trace().len() > 0).await);
    let sample = device.service.equipment().recent_trace().last().cloned().unwrap();
    assert_eq!(sample.values[&PRESSURE_VID], serde_json::json!(1.25));

    // Host command.
    let command = device
        .service
        .send_remote_command("START", &[], "integration")
        .await
        .unwrap();
    assert_eq!(command.status, CommandStatus::Completed);
    device.service.sync_state().await.unwrap();
    assert_eq!(device.service.equipment().state(), EquipmentState::Executing);

    // A critical alarm from the tool drives the aggregate into ALARM.
    tools[0].raise_alarm(7, 2, "exhaust flow low");
    assert!(eventually(|| device.service.equipment().state() == EquipmentState::Alarm).await);
    // The cache is written just after the snapshot swaps in.
    let mut cached = None;
    for _ in 0..100 {
        cached = status_cache.get(&first).await.unwrap();
        if cached.as_ref().is_some_and(|s| s.active_alarms == 1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cached.unwrap().state, EquipmentState::Alarm);

    let summary = fleet.summary();
    assert_eq!(summary.devices, 2);
    assert_eq!(summary.with_active_alarms, 1);

    fleet.shutdown().await;
    assert!(fleet.is_empty());
    assert_eq!(factory.open_sessions(), 0);
}
