//! `secsgate simulate`: run the fleet against in-memory tools.
//!
//! Every configured device (plus `--tools N` synthetic ones) gets a
//! simulated tool that answers the identity handshake. A driver task then
//! cycles each tool through a run: START, an event report, an alarm, then
//! alarm clear and STOP.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tabled::Tabled;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use secsgate_core::{
    BatchConnectResult, BroadcastEventPublisher, Collaborators, ConnectTarget, DeviceConfig,
    DeviceSettings, DeviceStatus, EquipmentId, FleetConfig, FleetManager, FleetSummary,
    StaticConfigSource,
};
use secsgate_hsms::sim::{SimulatedEquipment, SimulatedFactory};
use secsgate_hsms::{Endpoint, SecsItem};

use crate::cli::{GlobalOpts, SimulateArgs};
use crate::error::CliError;
use crate::output;

const SIM_MODEL: &str = "SIM-TOOL";
const SIM_REVISION: &str = "1.0.0";
const SIM_PORT: u16 = 5000;
const SIM_CEID: u32 = 100;
const SIM_RPTID: u32 = 1;
const SIM_ALID: u32 = 1;
/// ALCD category 6: minor attention flag.
const SIM_ALARM_CATEGORY: u8 = 6;
const OPERATOR: &str = "simulate";

// ── Table row ───────────────────────────────────────────────────────

#[derive(Debug, Tabled, Serialize)]
struct StatusRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "Link")]
    quality: String,
    #[tabled(rename = "Alarms")]
    alarms: usize,
    #[tabled(rename = "Commands")]
    pending_commands: usize,
}

impl StatusRow {
    fn new(endpoint: Endpoint, status: &DeviceStatus) -> Self {
        Self {
            id: status.equipment_id.to_string(),
            endpoint: endpoint.to_string(),
            state: status.state.to_string(),
            health: status.health.to_string(),
            quality: if status.connected {
                status.quality.to_string()
            } else {
                "down".into()
            },
            alarms: status.active_alarms,
            pending_commands: status.pending_commands,
        }
    }
}

// ── Simulated tools ─────────────────────────────────────────────────

#[derive(Clone)]
struct SimTool {
    id: EquipmentId,
    variable_ids: Vec<u32>,
    equipment: SimulatedEquipment,
}

/// `SIM-001` .. `SIM-nnn` on 10.77.0.x.
fn synthetic_devices(count: u8, defaults: &DeviceSettings) -> Result<Vec<DeviceConfig>, CliError> {
    (1..=count)
        .map(|n| {
            let id = EquipmentId::new(format!("SIM-{n:03}"))?;
            let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 77, 0, n)), SIM_PORT)
                .map_err(secsgate_core::CoreError::from)?;
            Ok(DeviceConfig::new(id, endpoint, defaults.clone()))
        })
        .collect()
}

/// A tool that passes the fleet's identity checks for `device`.
fn simulated_tool(device: &DeviceConfig, fleet: &FleetConfig) -> SimulatedEquipment {
    let model = fleet
        .accepted_model_prefixes
        .first()
        .map_or_else(|| SIM_MODEL.to_owned(), |prefix| format!("{prefix}{SIM_MODEL}"));
    let svids = fleet.identity_svids;
    let settings = &device.settings;
    let id = device.equipment_id.as_str();

    let tool = SimulatedEquipment::new(&model, SIM_REVISION)
        .with_variable(svids.equipment_id, SecsItem::ascii(id))
        .with_variable(svids.manufacturer, SecsItem::ascii("secsgate"))
        .with_variable(svids.serial, SecsItem::ascii(format!("SN-{id}")))
        .with_variable(settings.state_svid, SecsItem::ascii("IDLE"))
        .with_command_effect("START", settings.state_svid, SecsItem::ascii("EXECUTING"))
        .with_command_effect("STOP", settings.state_svid, SecsItem::ascii("IDLE"));
    for &vid in &settings.data_collection.variable_ids {
        tool.set_variable(vid, SecsItem::f8(0.0));
    }
    tool
}

struct Simulation {
    fleet: FleetManager,
    tools: Vec<SimTool>,
    batch: BatchConnectResult,
}

async fn launch(
    fleet_config: FleetConfig,
    source: StaticConfigSource,
    publisher: Arc<BroadcastEventPublisher>,
) -> Simulation {
    let devices = source.devices();
    let factory = Arc::new(SimulatedFactory::new());
    let tools: Vec<SimTool> = devices
        .iter()
        .map(|device| SimTool {
            id: device.equipment_id.clone(),
            variable_ids: device.settings.data_collection.variable_ids.clone(),
            equipment: factory.add(device.endpoint, simulated_tool(device, &fleet_config)),
        })
        .collect();

    let concurrency = fleet_config.max_concurrent_connections;
    let collaborators = Collaborators {
        publisher,
        ..Collaborators::in_memory(source)
    };
    let fleet = FleetManager::new(fleet_config, factory, collaborators);

    let targets = devices
        .iter()
        .map(|d| {
            ConnectTarget::new(d.endpoint.ip.to_string(), d.endpoint.port)
                .expecting(d.equipment_id.as_str())
        })
        .collect();
    let batch = fleet.connect_multiple(targets, concurrency).await;

    Simulation {
        fleet,
        tools,
        batch,
    }
}

// ── Activity driver ─────────────────────────────────────────────────

/// One step of a tool's run. `round` counts completed visits to the tool.
async fn step(fleet: &FleetManager, tool: &SimTool, round: u32) {
    let device = fleet.device(&tool.id);
    match round % 4 {
        0 => send_command(device.as_deref(), "START").await,
        1 => {
            let values: Vec<SecsItem> = tool
                .variable_ids
                .iter()
                .zip(1_u32..)
                .map(|(&vid, k)| {
                    let value = SecsItem::f8(f64::from(round) + f64::from(k) / 10.0);
                    tool.equipment.set_variable(vid, value.clone());
                    value
                })
                .collect();
            let values = if values.is_empty() {
                vec![SecsItem::u4(round)]
            } else {
                values
            };
            tool.equipment
                .send_event_report(SIM_CEID, vec![(SIM_RPTID, values)]);
        }
        2 => tool
            .equipment
            .raise_alarm(SIM_ALID, SIM_ALARM_CATEGORY, "chamber pressure drifting"),
        _ => {
            tool.equipment.clear_alarm(SIM_ALID);
            send_command(device.as_deref(), "STOP").await;
        }
    }
}

async fn send_command(device: Option<&secsgate_core::DeviceConnection>, name: &str) {
    let Some(device) = device else {
        return;
    };
    match device.service.send_remote_command(name, &[], OPERATOR).await {
        Ok(command) => {
            debug!(
                equipment_id = %device.equipment_id,
                command = name,
                status = %command.status,
                "simulated command finished"
            );
            // Pick up the state the command left behind without waiting for the sync loop.
            if let Err(e) = device.service.sync_state().await {
                debug!(equipment_id = %device.equipment_id, error = %e, "state sync after command failed");
            }
        }
        Err(e) => {
            debug!(equipment_id = %device.equipment_id, command = name, error = %e, "simulated command refused");
        }
    }
}

fn spawn_driver(
    fleet: FleetManager,
    tools: Vec<SimTool>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tools.is_empty() {
            return;
        }
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        let mut tick: usize = 0;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let tool = &tools[tick % tools.len()];
                    let round = u32::try_from(tick / tools.len()).unwrap_or(u32::MAX);
                    step(&fleet, tool, round).await;
                    tick = tick.wrapping_add(1);
                }
            }
        }
    })
}

fn spawn_event_log(
    publisher: &BroadcastEventPublisher,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => info!(equipment_id = %event.equipment_id(), event = event.name(), "domain event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

// ── Reporting ───────────────────────────────────────────────────────

fn status_rows(fleet: &FleetManager) -> Vec<StatusRow> {
    let now = Utc::now();
    fleet
        .devices()
        .iter()
        .map(|device| StatusRow::new(device.endpoint, &device.service.equipment().status(now)))
        .collect()
}

fn print_status(fleet: &FleetManager, global: &GlobalOpts) -> Result<(), CliError> {
    let rows = status_rows(fleet);
    let out = output::render_list(global.output, &rows, |r| r.id.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}

fn summary_text(summary: &FleetSummary) -> String {
    format!(
        "{} device(s): {} connected, {} healthy, {} with active alarms",
        summary.devices, summary.connected, summary.healthy, summary.with_active_alarms
    )
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(args: &SimulateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    for (field, value) in [
        ("--report-every", args.report_every),
        ("--activity-every", args.activity_every),
    ] {
        if value.is_zero() {
            return Err(CliError::Validation {
                field: field.into(),
                reason: "must be greater than zero".into(),
            });
        }
    }

    let path = global.config_path();
    let config = super::load_validated(global)?;
    let mut fleet_config = config
        .to_fleet_config()
        .map_err(|e| CliError::config(&path, e))?;
    if let Some(concurrency) = args.concurrency {
        fleet_config.max_concurrent_connections = concurrency.max(1);
    }
    let source = config
        .config_source()
        .map_err(|e| CliError::config(&path, e))?;
    for device in synthetic_devices(args.tools, &fleet_config.device_defaults)? {
        source.insert(device);
    }
    if source.devices().is_empty() {
        return Err(CliError::NoDevices {
            path: path.display().to_string(),
        });
    }

    let cancel = CancellationToken::new();
    let publisher = Arc::new(BroadcastEventPublisher::default());
    let event_log = spawn_event_log(&publisher, cancel.child_token());

    let Simulation {
        fleet,
        tools,
        batch,
    } = launch(fleet_config, source, publisher).await;
    info!(
        succeeded = batch.succeeded,
        failed = batch.failed,
        elapsed_ms = u64::try_from(batch.elapsed.as_millis()).unwrap_or(u64::MAX),
        peak_in_flight = fleet.peak_in_flight_attempts(),
        "initial connection batch finished"
    );
    for failure in batch.failures() {
        warn!(device = %failure.target, kind = %failure.kind, reason = %failure.reason, "device did not connect");
    }
    if batch.succeeded == 0 {
        cancel.cancel();
        fleet.shutdown().await;
        let _ = event_log.await;
        return Err(CliError::ConnectionFailed {
            attempted: batch.total(),
            first_failure: batch
                .failures()
                .next()
                .map_or_else(String::new, ToString::to_string),
        });
    }

    fleet.start_supervision();
    let driver = spawn_driver(
        fleet.clone(),
        tools,
        args.activity_every,
        cancel.child_token(),
    );

    let deadline = args.duration.map(|d| Instant::now() + d);
    let mut report = tokio::time::interval(args.report_every);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            () = until(deadline) => break,
            _ = report.tick() => print_status(&fleet, global)?,
        }
    }

    cancel.cancel();
    let _ = driver.await;
    print_status(&fleet, global)?;
    let summary = fleet.summary();
    fleet.shutdown().await;
    let _ = event_log.await;

    let out = output::render_single(global.output, &summary, summary_text)?;
    output::print_output(&out, global.quiet);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secsgate_core::EquipmentState;

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn quick_settings() -> DeviceSettings {
        let mut settings = DeviceSettings::default();
        settings.hsms.heartbeat_interval = Duration::ZERO;
        settings.settle_delay = Duration::ZERO;
        settings
    }

    #[test]
    fn synthetic_devices_are_numbered_on_their_own_subnet() {
        let devices = synthetic_devices(3, &DeviceSettings::default()).unwrap();
        let labels: Vec<String> = devices
            .iter()
            .map(|d| format!("{}@{}", d.equipment_id, d.endpoint))
            .collect();
        assert_eq!(
            labels,
            vec![
                "SIM-001@10.77.0.1:5000",
                "SIM-002@10.77.0.2:5000",
                "SIM-003@10.77.0.3:5000",
            ]
        );
        assert!(synthetic_devices(0, &DeviceSettings::default()).unwrap().is_empty());
    }

    #[test]
    fn simulated_model_honours_the_accepted_prefixes() {
        let device = synthetic_devices(1, &DeviceSettings::default())
            .unwrap()
            .remove(0);
        let fleet = FleetConfig {
            accepted_model_prefixes: vec!["ETCH-".into()],
            ..FleetConfig::default()
        };
        let tool = simulated_tool(&device, &fleet);
        assert_eq!(
            tool.variable(fleet.identity_svids.equipment_id),
            Some(SecsItem::ascii("SIM-001"))
        );
        assert!(fleet.accepts_model(&format!("ETCH-{SIM_MODEL}")));
    }

    #[tokio::test]
    async fn simulated_fleet_connects_and_follows_activity() {
        let fleet_config = FleetConfig {
            device_defaults: quick_settings(),
            ..FleetConfig::default()
        };
        let source = StaticConfigSource::new(
            fleet_config.clone(),
            synthetic_devices(3, &fleet_config.device_defaults).unwrap(),
        );
        let publisher = Arc::new(BroadcastEventPublisher::default());
        let sim = launch(fleet_config, source, publisher.clone()).await;

        assert_eq!(sim.batch.succeeded, 3);
        assert_eq!(sim.fleet.len(), 3);
        assert!(publisher.published() > 0);

        let tool = sim.tools[0].clone();
        let device = sim.fleet.device(&tool.id).unwrap();

        step(&sim.fleet, &tool, 0).await;
        assert_eq!(device.service.equipment().state(), EquipmentState::Executing);

        step(&sim.fleet, &tool, 2).await;
        assert!(
            eventually(|| device.service.equipment().active_alarms().len() == 1).await
        );

        step(&sim.fleet, &tool, 3).await;
        assert!(
            eventually(|| device.service.equipment().active_alarms().len() == 0).await
        );

        let rows = status_rows(&sim.fleet);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id, "SIM-001");

        sim.fleet.shutdown().await;
        assert!(sim.fleet.is_empty());
    }
}
