// ── Device orchestration service ──
//
// Couples one HsmsClient to one Equipment aggregate. Owns the device
// lifecycle and the background work for it: message routing, connection
// tracking, state sync, data collection, alarm sync, and command expiry.

mod health;
mod router;
mod tasks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use secsgate_hsms::standard::{self, hcack};
use secsgate_hsms::{HsmsClient, SecsItem, SessionFactory};
use serde::Serialize;
use strum::Display;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use health::HealthCheckResult;

use crate::config::{DeviceConfig, DeviceSettings};
use crate::error::CoreError;
use crate::model::{
    AlarmEvent, AlarmSeverity, CommandStatus, DomainEvent, Equipment, EquipmentId,
    EquipmentState, RemoteCommand, TraceData,
};
use crate::ports::Collaborators;

const EVENT_CHANNEL_SIZE: usize = 256;
const SERVICE_ACTOR: &str = "service";
const DEVICE_ACTOR: &str = "device";
/// Report id recorded for polled (S2F13) samples.
pub const POLLED_REPORT_ID: u32 = 0;

/// Lifecycle of a device service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum ServiceState {
    NotInitialized,
    Starting,
    Started,
    Stopping,
    Stopped,
    Faulted,
}

// ── DeviceService ───────────────────────────────────────────────────

/// Cheaply cloneable via `Arc<ServiceInner>`.
#[derive(Clone)]
pub struct DeviceService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: DeviceConfig,
    client: HsmsClient,
    collaborators: Collaborators,
    /// Held across persistence so collaborators see mutations in order.
    aggregate: Mutex<Equipment>,
    /// Copy-on-write view for lock-free reads.
    snapshot: ArcSwap<Equipment>,
    lifecycle: watch::Sender<ServiceState>,
    /// Serializes start/stop/restart.
    lifecycle_lock: Mutex<()>,
    /// Set while stopping; late timer firings observe it and no-op.
    stopping: AtomicBool,
    cancel: CancellationToken,
    /// Child token for the current run; replaced on every start.
    cancel_child: StdMutex<CancellationToken>,
    task_handles: StdMutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<DomainEvent>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceService {
    /// Build a service with its own transport client. Does not connect.
    pub fn new(
        config: DeviceConfig,
        equipment: Equipment,
        factory: Arc<dyn SessionFactory>,
        collaborators: Collaborators,
    ) -> Self {
        let client = HsmsClient::new(config.endpoint, config.settings.hsms.clone(), factory);
        Self::with_client(config, equipment, client, collaborators)
    }

    pub fn with_client(
        config: DeviceConfig,
        equipment: Equipment,
        client: HsmsClient,
        collaborators: Collaborators,
    ) -> Self {
        let (lifecycle, _) = watch::channel(ServiceState::NotInitialized);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Self {
            inner: Arc::new(ServiceInner {
                config,
                client,
                collaborators,
                snapshot: ArcSwap::from_pointee(equipment.clone()),
                aggregate: Mutex::new(equipment),
                lifecycle,
                lifecycle_lock: Mutex::new(()),
                stopping: AtomicBool::new(false),
                cancel,
                cancel_child: StdMutex::new(cancel_child),
                task_handles: StdMutex::new(Vec::new()),
                events,
            }),
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn equipment_id(&self) -> EquipmentId {
        self.inner.config.equipment_id.clone()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    fn settings(&self) -> &DeviceSettings {
        &self.inner.config.settings
    }

    pub fn client(&self) -> &HsmsClient {
        &self.inner.client
    }

    /// Lock-free snapshot of the aggregate.
    pub fn equipment(&self) -> Arc<Equipment> {
        self.inner.snapshot.load_full()
    }

    pub fn status(&self) -> ServiceState {
        *self.inner.lifecycle.borrow()
    }

    pub fn lifecycle(&self) -> watch::Receiver<ServiceState> {
        self.inner.lifecycle.subscribe()
    }

    /// Domain events as they are published. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.inner.lifecycle.send_replace(state);
        if previous != state {
            debug!(equipment_id = %self.inner.config.equipment_id, from = %previous, to = %state, "service state");
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect the transport, reconcile the aggregate, and launch the
    /// background loops. Idempotent while started.
    pub async fn start(&self) -> Result<(), CoreError> {
        let _lifecycle = self.inner.lifecycle_lock.lock().await;
        match self.status() {
            ServiceState::Started => return Ok(()),
            ServiceState::NotInitialized | ServiceState::Stopped | ServiceState::Faulted => {}
            other => {
                return Err(CoreError::ServiceState {
                    operation: "start",
                    state: other.to_string(),
                });
            }
        }
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let id = self.inner.config.equipment_id.clone();
        self.set_state(ServiceState::Starting);
        self.inner.stopping.store(false, Ordering::SeqCst);
        info!(equipment_id = %id, endpoint = %self.inner.config.endpoint, "starting device service");

        let config_valid = self.inner.config.validate().is_ok();
        self.mutate(|eq, now| eq.set_config_valid(config_valid, now))
            .await;

        // Subscribe before connecting so no early primary is missed.
        let primaries = self.inner.client.primary_messages();
        let client_events = self.inner.client.subscribe();

        if let Err(e) = self
            .inner
            .client
            .connect(self.settings().connect_timeout)
            .await
        {
            error!(equipment_id = %id, error = %e, "device connect failed");
            self.set_state(ServiceState::Faulted);
            return Err(e.into());
        }

        if let Err(e) = self.reconcile_connection().await {
            error!(equipment_id = %id, error = %e, "aggregate refused connection");
            self.inner.client.disconnect(&e.to_string()).await;
            self.set_state(ServiceState::Faulted);
            return Err(e);
        }

        if let Err(e) = self.sync_state().await {
            warn!(equipment_id = %id, error = %e, "initial state sync failed");
        }

        let child = self.inner.cancel.child_token();
        *lock(&self.inner.cancel_child) = child.clone();
        self.spawn_tasks(&child, Box::pin(primaries), client_events);

        self.set_state(ServiceState::Started);
        info!(equipment_id = %id, "device service started");
        Ok(())
    }

    /// Stop the loops, disconnect the transport, and mark the tool DOWN.
    /// Idempotent.
    pub async fn stop(&self, reason: &str) -> Result<(), CoreError> {
        let _lifecycle = self.inner.lifecycle_lock.lock().await;
        match self.status() {
            ServiceState::Started | ServiceState::Faulted => {}
            _ => return Ok(()),
        }

        let id = self.inner.config.equipment_id.clone();
        self.set_state(ServiceState::Stopping);
        self.inner.stopping.store(true, Ordering::SeqCst);

        lock(&self.inner.cancel_child).cancel();
        let handles = std::mem::take(&mut *lock(&self.inner.task_handles));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(equipment_id = %id, error = %e, "background task ended abnormally");
            }
        }

        self.inner.client.disconnect(reason).await;

        self.mutate(|eq, now| {
            eq.disconnect(reason, true, now);
            if let Err(e) = eq.update_state(EquipmentState::Down, SERVICE_ACTOR, reason, now) {
                debug!(equipment_id = %eq.id(), error = %e, "leaving state unchanged on stop");
            }
        })
        .await;

        self.set_state(ServiceState::Stopped);
        info!(equipment_id = %id, reason, "device service stopped");
        Ok(())
    }

    /// Stop, wait the restart delay, start.
    pub async fn restart(&self) -> Result<(), CoreError> {
        self.stop("restart").await?;
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => return Err(CoreError::Cancelled),
            () = tokio::time::sleep(self.settings().restart_delay) => {}
        }
        self.start().await
    }

    /// Stop and release the transport for good.
    pub async fn dispose(&self) {
        if let Err(e) = self.stop("disposed").await {
            warn!(equipment_id = %self.inner.config.equipment_id, error = %e, "stop during dispose failed");
        }
        self.inner.cancel.cancel();
        self.inner.client.shutdown().await;
    }

    fn spawn_tasks(
        &self,
        child: &CancellationToken,
        primaries: tasks::PrimaryStream,
        client_events: broadcast::Receiver<secsgate_hsms::ClientEvent>,
    ) {
        let settings = self.settings();
        let mut handles = lock(&self.inner.task_handles);

        handles.push(tokio::spawn(router::route_messages(
            self.clone(),
            primaries,
            child.clone(),
        )));
        handles.push(tokio::spawn(tasks::watch_connection(
            self.clone(),
            client_events,
            child.clone(),
        )));
        handles.push(tokio::spawn(tasks::state_sync_task(
            self.clone(),
            settings.state_sync_interval,
            child.clone(),
        )));
        handles.push(tokio::spawn(tasks::command_sweep_task(
            self.clone(),
            settings.command_sweep_interval,
            child.clone(),
        )));
        if settings.data_collection.enabled {
            handles.push(tokio::spawn(tasks::data_collection_task(
                self.clone(),
                child.clone(),
            )));
        }
        if settings.alarms.enabled {
            handles.push(tokio::spawn(tasks::alarm_task(self.clone(), child.clone())));
        }
    }

    // ── Aggregate mutation ───────────────────────────────────────────

    /// Apply `f` to the aggregate, then publish its events, save it, and
    /// refresh the cached status. Collaborator failures are logged only.
    pub(crate) async fn mutate<R>(&self, f: impl FnOnce(&mut Equipment, DateTime<Utc>) -> R) -> R {
        let mut equipment = self.inner.aggregate.lock().await;
        let now = Utc::now();
        let result = f(&mut equipment, now);
        let events = equipment.take_events();
        let snapshot = Arc::new(equipment.clone());
        self.inner.snapshot.store(Arc::clone(&snapshot));
        self.persist(&snapshot, &events, now).await;
        result
    }

    async fn persist(&self, equipment: &Equipment, events: &[DomainEvent], now: DateTime<Utc>) {
        let id = equipment.id();
        let c = &self.inner.collaborators;

        if !events.is_empty() {
            if let Err(e) = c.publisher.publish(events).await {
                warn!(equipment_id = %id, error = %e, count = events.len(), "event publish failed");
            }
            for event in events {
                let _ = self.inner.events.send(event.clone());
            }
        }
        if let Err(e) = c.repository.save(equipment).await {
            warn!(equipment_id = %id, error = %e, "aggregate save failed");
        }
        if let Err(e) = c
            .status_cache
            .put(id, equipment.status(now), self.settings().status_ttl)
            .await
        {
            warn!(equipment_id = %id, error = %e, "status cache write failed");
        }
    }

    /// Mirror the transport's session onto the aggregate.
    async fn reconcile_connection(&self) -> Result<(), CoreError> {
        let state = self.inner.client.connection_state();
        let Some(session_id) = state.session_id.clone().filter(|_| state.is_connected) else {
            return Err(CoreError::NotConnected);
        };
        self.mutate(|eq, now| {
            if eq.connection_state().session_id.as_deref() == Some(session_id.as_str())
                && eq.is_connected()
            {
                return Ok(());
            }
            if eq.is_connected() {
                eq.disconnect("superseded session", true, now);
            }
            eq.connect(&session_id, now)
        })
        .await
    }

    fn ensure_connected(&self) -> Result<(), CoreError> {
        if self.inner.client.is_connected() {
            Ok(())
        } else {
            Err(CoreError::NotConnected)
        }
    }

    // ── Device operations ────────────────────────────────────────────

    /// Read the state variable and apply it through the state machine.
    ///
    /// A tool held in ALARM by an active MAJOR+ alarm stays there until the
    /// alarm clears, whatever the state variable says. A live session the
    /// aggregate refused (say, while in MAINTENANCE) is offered again after
    /// the new state is applied.
    pub async fn sync_state(&self) -> Result<EquipmentState, CoreError> {
        self.ensure_connected()?;
        let svid = self.settings().state_svid;
        let values = self.inner.client.get_equipment_state(&[svid]).await?;
        let reported = values
            .first()
            .and_then(EquipmentState::from_device)
            .ok_or_else(|| CoreError::Protocol {
                message: format!("state variable {svid} returned no recognisable state"),
            })?;

        self.mutate(|eq, now| {
            eq.record_heartbeat(now);
            let held_by_alarm = eq.state() == EquipmentState::Alarm
                && eq.has_major_alarm()
                && !reported.requires_attention();
            if reported == EquipmentState::Unknown || reported == eq.state() || held_by_alarm {
                return Ok(());
            }
            eq.update_state(reported, DEVICE_ACTOR, "state sync", now)
        })
        .await?;

        // A session the aggregate refused earlier may be acceptable now.
        if self.inner.client.is_connected() && !self.equipment().is_connected() && !self.is_stopping() {
            match self.reconcile_connection().await {
                Ok(()) => info!(equipment_id = %self.inner.config.equipment_id, "aggregate accepted the live session"),
                Err(e) => debug!(equipment_id = %self.inner.config.equipment_id, error = %e, "aggregate still refuses the session"),
            }
        }
        Ok(reported)
    }

    /// Poll the configured data variables once (S2F13) into the trace window.
    /// Returns `None` when no variables are configured.
    pub async fn collect_data(&self) -> Result<Option<TraceData>, CoreError> {
        let ids = &self.settings().data_collection.variable_ids;
        if ids.is_empty() {
            return Ok(None);
        }
        self.ensure_connected()?;
        let reply = self
            .inner
            .client
            .request(standard::data_variable_request(ids))
            .await?;
        let values = standard::parse_data_values(&reply)?;
        if values.len() != ids.len() {
            return Err(CoreError::Protocol {
                message: format!("S2F14 returned {} values for {} variables", values.len(), ids.len()),
            });
        }

        let trace = self
            .mutate(|eq, now| {
                let trace = ids.iter().zip(&values).fold(
                    TraceData::new(POLLED_REPORT_ID, now),
                    |trace, (id, value)| trace.with_value(*id, value.to_json()),
                );
                eq.add_trace_data(trace.clone());
                trace
            })
            .await;
        Ok(Some(trace))
    }

    /// Enable event reports (S2F37) for the configured collection events.
    pub async fn enable_event_reports(&self) -> Result<(), CoreError> {
        let ceids = &self.settings().data_collection.event_ids;
        if ceids.is_empty() {
            return Ok(());
        }
        self.ensure_connected()?;
        let reply = self
            .inner
            .client
            .request(standard::enable_event_reports(true, ceids))
            .await?;
        match standard::parse_ack(&reply, 2, 38, "S2F38")? {
            0 => Ok(()),
            code => Err(CoreError::ProtocolReject {
                exchange: "S2F37".into(),
                code,
                reason: "event report enable denied".into(),
            }),
        }
    }

    /// Enable device-side reporting for the configured alarm ids (S5F3).
    /// Returns how many the tool accepted.
    pub async fn enable_alarms(&self) -> Result<usize, CoreError> {
        self.set_alarms_enabled(true).await
    }

    pub async fn disable_alarms(&self) -> Result<usize, CoreError> {
        self.set_alarms_enabled(false).await
    }

    async fn set_alarms_enabled(&self, enable: bool) -> Result<usize, CoreError> {
        let alids = &self.settings().alarms.alarm_ids;
        if alids.is_empty() {
            return Ok(0);
        }
        self.ensure_connected()?;
        let mut accepted = 0;
        for &alid in alids {
            let reply = self
                .inner
                .client
                .request(standard::alarm_enable(enable, alid))
                .await?;
            match standard::parse_ack(&reply, 5, 4, "S5F4")? {
                0 => accepted += 1,
                code => warn!(
                    equipment_id = %self.inner.config.equipment_id,
                    alid, code, enable, "alarm enable denied"
                ),
            }
        }
        Ok(accepted)
    }

    /// Reconcile active alarms with the tool's list (S5F5). Returns the
    /// number of alarms added or cleared.
    pub async fn sync_alarms(&self) -> Result<usize, CoreError> {
        self.ensure_connected()?;
        let reply = self
            .inner
            .client
            .request(standard::list_alarms_request(&self.settings().alarms.alarm_ids))
            .await?;
        let reported = standard::parse_alarm_list(&reply)?;

        let changes = self
            .mutate(|eq, now| {
                let mut changes = 0;
                let set: Vec<_> = reported.iter().filter(|a| a.is_set()).collect();
                for report in &set {
                    if eq.add_alarm(alarm_from_report(report, now), now) {
                        changes += 1;
                    }
                }
                let stale: Vec<u32> = eq
                    .active_alarms()
                    .map(|a| a.alarm_id)
                    .filter(|id| !set.iter().any(|r| r.alid == *id))
                    .collect();
                for alid in stale {
                    if eq.clear_alarm(alid, now).is_some() {
                        changes += 1;
                    }
                }
                changes
            })
            .await;
        Ok(changes)
    }

    pub async fn acknowledge_alarm(&self, alarm_id: u32, by: &str) -> Result<bool, CoreError> {
        self.mutate(|eq, now| eq.acknowledge_alarm(alarm_id, by, now))
            .await
    }

    /// Record, send (S2F41), and resolve a host command.
    ///
    /// The command is on the aggregate before anything is sent. HCACK 0 or
    /// 4 completes it, any other code fails it, and no reply fails it with
    /// "no response". `Err` means the command was never recorded.
    pub async fn send_remote_command(
        &self,
        name: &str,
        params: &[(String, SecsItem)],
        requested_by: &str,
    ) -> Result<RemoteCommand, CoreError> {
        let id = &self.inner.config.equipment_id;
        let settings = &self.settings().remote_control;
        if !settings.enabled {
            return Err(CoreError::RemoteControlDisabled { id: id.to_string() });
        }
        self.ensure_connected()?;

        let parameters = serde_json::Value::Object(
            params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        );
        let timeout = chrono::Duration::from_std(settings.command_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let command = self
            .mutate(|eq, now| {
                let command =
                    eq.execute_remote_command(name, parameters, requested_by, timeout, now)?;
                eq.update_command_status(command.id, CommandStatus::Executing, None, None, now)
            })
            .await
            .inspect_err(|e| warn!(equipment_id = %id, command = name, error = %e, "command rejected"))?;

        let outcome = match self
            .inner
            .client
            .request(standard::host_command(name, params))
            .await
        {
            Ok(reply) => match standard::parse_host_command_ack(&reply) {
                Ok(ack) if hcack::is_accepted(ack.hcack) => (
                    CommandStatus::Completed,
                    hcack::describe(ack.hcack).to_owned(),
                    None,
                ),
                Ok(ack) => (
                    CommandStatus::Failed,
                    format!("HCACK {}: {}", ack.hcack, hcack::describe(ack.hcack)),
                    Some(serde_json::json!({ "parameter_errors": ack.parameter_errors })),
                ),
                Err(e) => (CommandStatus::Failed, e.to_string(), None),
            },
            Err(e) if e.is_timeout() => (CommandStatus::Failed, "no response".to_owned(), None),
            Err(e) => (CommandStatus::Failed, e.to_string(), None),
        };
        let (status, message, data) = outcome;
        if status == CommandStatus::Failed {
            warn!(equipment_id = %id, command = name, reason = %message, "remote command failed");
        } else {
            info!(equipment_id = %id, command = name, "remote command accepted");
        }

        let finished = self
            .mutate(|eq, now| {
                eq.update_command_status(command.id, status, Some(message), data, now)
            })
            .await;
        match finished {
            Ok(command) => Ok(command),
            // Resolved elsewhere first (expiry sweep); report what it says.
            Err(CoreError::CommandAlreadyFinished { .. }) => self
                .equipment()
                .command(command.id)
                .cloned()
                .ok_or_else(|| CoreError::Internal("command left history".into())),
            Err(e) => Err(e),
        }
    }

    /// Connectivity, stability, alarms, and a live S1F1 round trip,
    /// folded into one verdict.
    pub async fn health_check(&self) -> HealthCheckResult {
        health::check(self).await
    }

    // ── Primary-message handlers ─────────────────────────────────────

    pub(crate) async fn apply_alarm_report(&self, report: &standard::AlarmReport) {
        let id = &self.inner.config.equipment_id;
        if report.is_set() {
            let added = self
                .mutate(|eq, now| {
                    eq.record_heartbeat(now);
                    eq.add_alarm(alarm_from_report(report, now), now)
                })
                .await;
            if added {
                warn!(equipment_id = %id, alid = report.alid, text = %report.text, "alarm set");
            }
        } else {
            let cleared = self
                .mutate(|eq, now| {
                    eq.record_heartbeat(now);
                    eq.clear_alarm(report.alid, now)
                })
                .await;
            if cleared.is_some() {
                info!(equipment_id = %id, alid = report.alid, "alarm cleared");
            }
        }
    }

    pub(crate) async fn apply_event_report(&self, report: &standard::EventReport) {
        self.mutate(|eq, now| {
            for r in &report.reports {
                let trace = r
                    .values
                    .iter()
                    .zip(0u32..)
                    .fold(TraceData::new(r.rptid, now).with_event(report.ceid), |t, (v, i)| {
                        t.with_value(i, v.to_json())
                    });
                eq.add_trace_data(trace);
            }
            eq.record_heartbeat(now);
        })
        .await;
    }
}

fn alarm_from_report(report: &standard::AlarmReport, now: DateTime<Utc>) -> AlarmEvent {
    AlarmEvent::new(
        report.alid,
        report.text.clone(),
        AlarmSeverity::from_alcd_category(report.category()),
        now,
    )
    .with_code(format!("ALCD {:#04x}", report.alcd))
}

#[cfg(test)]
mod tests;
