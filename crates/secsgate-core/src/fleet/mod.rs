// ── Fleet connection manager ──
//
// Brings up, tracks, and supervises any number of devices under one
// fleet-wide ceiling on simultaneous connection attempts. Connected
// devices hold no slot.

mod bootstrap;
mod claim;
mod types;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::future::join_all;
use secsgate_hsms::{Endpoint, SessionFactory};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use types::{
    BatchConnectResult, ConnectTarget, ConnectionFailure, ConnectionResult, DeviceConnection,
    FailureKind, FleetSummary,
};

use self::bootstrap::DeviceIdentity;
use self::claim::Claim;
use crate::config::{DeviceConfig, FleetConfig};
use crate::error::ErrorKind;
use crate::model::{Equipment, EquipmentId, HealthStatus, MachineMetadata};
use crate::ports::Collaborators;
use crate::service::DeviceService;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheaply cloneable via `Arc<FleetInner>`.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    config: FleetConfig,
    factory: Arc<dyn SessionFactory>,
    collaborators: Collaborators,
    devices: DashMap<EquipmentId, Arc<DeviceConnection>>,
    /// Endpoints with an attempt in progress or a registered device.
    endpoint_claims: DashMap<Endpoint, ()>,
    /// Equipment ids with an attempt past the handshake or a registered device.
    id_claims: DashMap<EquipmentId, ()>,
    connect_slots: Semaphore,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    stopping: AtomicBool,
    cancel: CancellationToken,
    task_handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// Counts one in-flight connection attempt for as long as it lives.
struct InFlight<'a>(&'a FleetInner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a FleetInner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FleetManager {
    pub fn new(
        config: FleetConfig,
        factory: Arc<dyn SessionFactory>,
        collaborators: Collaborators,
    ) -> Self {
        let slots = config.max_concurrent_connections.max(1);
        Self {
            inner: Arc::new(FleetInner {
                config,
                factory,
                collaborators,
                devices: DashMap::new(),
                endpoint_claims: DashMap::new(),
                id_claims: DashMap::new(),
                connect_slots: Semaphore::new(slots),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                task_handles: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    pub fn device(&self, id: &EquipmentId) -> Option<Arc<DeviceConnection>> {
        self.inner.devices.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Every managed device, ordered by id.
    pub fn devices(&self) -> Vec<Arc<DeviceConnection>> {
        let mut devices: Vec<_> = self
            .inner
            .devices
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        devices.sort_by(|a, b| a.equipment_id.cmp(&b.equipment_id));
        devices
    }

    pub fn len(&self) -> usize {
        self.inner.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.devices.is_empty()
    }

    pub fn in_flight_attempts(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous connection attempts seen so far.
    pub fn peak_in_flight_attempts(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> FleetSummary {
        let devices = self.devices();
        FleetSummary {
            devices: devices.len(),
            connected: devices.iter().filter(|d| d.service.is_connected()).count(),
            healthy: devices.iter().filter(|d| d.is_healthy()).count(),
            with_active_alarms: devices
                .iter()
                .filter(|d| d.service.equipment().active_alarms().len() > 0)
                .count(),
            in_flight_attempts: self.in_flight_attempts(),
        }
    }

    // ── Connecting ───────────────────────────────────────────────────

    /// Identify, validate, start, and register one device.
    ///
    /// Expected failures come back as [`ConnectionResult::Failed`]; nothing
    /// is registered and every partially created resource is released.
    pub async fn add_and_connect(
        &self,
        ip: &str,
        port: u16,
        expected_id: Option<&str>,
        timeout: Duration,
    ) -> ConnectionResult {
        let target = format!("{ip}:{port}");
        match self.try_add(ip, port, expected_id, timeout).await {
            Ok(connection) => {
                info!(
                    equipment_id = %connection.equipment_id,
                    endpoint = %connection.endpoint,
                    model = %connection.metadata.model,
                    "device added to fleet"
                );
                ConnectionResult::Connected(connection)
            }
            Err(failure) => {
                let failure = ConnectionFailure { target, ..failure };
                warn!(device = %failure.target, kind = %failure.kind, reason = %failure.reason, "device connection failed");
                ConnectionResult::Failed(failure)
            }
        }
    }

    async fn try_add(
        &self,
        ip: &str,
        port: u16,
        expected_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<DeviceConnection>, ConnectionFailure> {
        let inner = &*self.inner;
        let endpoint = Endpoint::parse(ip, port)
            .map_err(|e| failure(FailureKind::InvalidAddress, None, e.to_string()))?;
        let expected = expected_id
            .map(EquipmentId::new)
            .transpose()
            .map_err(|e| failure(FailureKind::InvalidAddress, None, e.to_string()))?;

        if inner.stopping.load(Ordering::SeqCst) {
            return Err(failure(FailureKind::Cancelled, None, "fleet is shutting down"));
        }
        let mut endpoint_claim = Claim::acquire(&inner.endpoint_claims, endpoint).ok_or_else(|| {
            failure(
                FailureKind::DuplicateDevice,
                None,
                format!("endpoint {endpoint} is already managed or being connected"),
            )
        })?;

        let _permit = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => {
                return Err(failure(FailureKind::Cancelled, None, "fleet is shutting down"));
            }
            permit = inner.connect_slots.acquire() => permit
                .map_err(|_| failure(FailureKind::Cancelled, None, "connection slots closed"))?,
        };
        let _attempt = InFlight::enter(inner);
        let deadline = Instant::now() + timeout;
        debug!(endpoint = %endpoint, "connection attempt started");

        let identity = bootstrap::identify(
            endpoint,
            &inner.config.device_defaults.hsms,
            inner.config.identity_svids,
            Arc::clone(&inner.factory),
            timeout,
        )
        .await
        .map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::ConnectTimeout
            } else {
                FailureKind::HandshakeFailed
            };
            failure(kind, None, e.to_string())
        })?;

        let (id, metadata) = self.validate_identity(&identity, expected.as_ref())?;
        let mut id_claim = Claim::acquire(&inner.id_claims, id.clone()).ok_or_else(|| {
            failure(
                FailureKind::DuplicateDevice,
                Some(id.clone()),
                format!("equipment {id} is already managed"),
            )
        })?;

        let mut config = self.device_config(&id, endpoint).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(failure(
                FailureKind::ConnectTimeout,
                Some(id),
                "connect budget exhausted after handshake",
            ));
        }
        config.settings.connect_timeout = config.settings.connect_timeout.min(remaining);

        let equipment = self.load_or_register(&config, metadata.clone()).await;
        let service = DeviceService::new(
            config,
            equipment,
            Arc::clone(&inner.factory),
            inner.collaborators.clone(),
        );
        if let Err(e) = service.start().await {
            service.dispose().await;
            let kind = match e.kind() {
                ErrorKind::ConnectTimeout => FailureKind::ConnectTimeout,
                ErrorKind::Cancelled => FailureKind::Cancelled,
                _ => FailureKind::StartFailed,
            };
            return Err(failure(kind, Some(id), e.to_string()));
        }

        // A shutdown that began while we were starting must not leak this device.
        if inner.stopping.load(Ordering::SeqCst) {
            service.dispose().await;
            return Err(failure(FailureKind::Cancelled, Some(id), "fleet is shutting down"));
        }

        let connection = Arc::new(DeviceConnection::new(
            id.clone(),
            endpoint,
            metadata,
            service,
            Utc::now(),
        ));
        inner.devices.insert(id, Arc::clone(&connection));
        endpoint_claim.keep();
        id_claim.keep();
        Ok(connection)
    }

    fn validate_identity(
        &self,
        identity: &DeviceIdentity,
        expected: Option<&EquipmentId>,
    ) -> Result<(EquipmentId, MachineMetadata), ConnectionFailure> {
        if !self.inner.config.accepts_model(&identity.model) {
            return Err(failure(
                FailureKind::TypeMismatch,
                None,
                format!("model {:?} is not an accepted equipment type", identity.model),
            ));
        }

        let reported = identity
            .reported_id
            .as_deref()
            .map(EquipmentId::new)
            .transpose()
            .map_err(|e| failure(FailureKind::InvalidMetadata, None, e.to_string()))?;
        let id = match (reported, expected) {
            (Some(reported), Some(expected)) if reported != *expected => {
                return Err(failure(
                    FailureKind::IdMismatch,
                    Some(reported.clone()),
                    format!("expected {expected}, device reports {reported}"),
                ));
            }
            (Some(reported), _) => reported,
            (None, Some(expected)) => expected.clone(),
            (None, None) => {
                return Err(failure(
                    FailureKind::InvalidMetadata,
                    None,
                    "device reports no equipment id and none was expected",
                ));
            }
        };

        let metadata = identity.metadata();
        metadata
            .validate()
            .map_err(|e| failure(FailureKind::InvalidMetadata, Some(id.clone()), e.to_string()))?;
        Ok((id, metadata))
    }

    /// Configured settings for the device, else the fleet defaults. The
    /// endpoint always comes from the attempt.
    async fn device_config(&self, id: &EquipmentId, endpoint: Endpoint) -> DeviceConfig {
        let source = &self.inner.collaborators.config_source;
        let configured = match source.device_config(id).await {
            Ok(Some(config)) => Some(config),
            Ok(None) => source
                .device_config_for_endpoint(&endpoint)
                .await
                .unwrap_or_else(|e| {
                    warn!(equipment_id = %id, error = %e, "device config lookup failed");
                    None
                }),
            Err(e) => {
                warn!(equipment_id = %id, error = %e, "device config lookup failed");
                None
            }
        };
        let mut config = configured.unwrap_or_else(|| {
            DeviceConfig::new(
                id.clone(),
                endpoint,
                self.inner.config.device_defaults.clone(),
            )
        });
        config.equipment_id = id.clone();
        config.endpoint = endpoint;
        config
    }

    /// Reuse the stored aggregate when there is one.
    async fn load_or_register(
        &self,
        config: &DeviceConfig,
        metadata: MachineMetadata,
    ) -> Equipment {
        let now = Utc::now();
        let stored = match self
            .inner
            .collaborators
            .repository
            .load(&config.equipment_id)
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!(equipment_id = %config.equipment_id, error = %e, "aggregate load failed, registering afresh");
                None
            }
        };
        let mut equipment = stored
            .filter(|eq| eq.endpoint() == config.endpoint)
            .unwrap_or_else(|| {
                Equipment::register(
                    config.equipment_id.clone(),
                    config.name.clone(),
                    config.endpoint,
                    now,
                )
            });
        equipment.set_metadata(metadata, now);
        equipment
    }

    /// Bring up every target with at most `min(max_concurrency, ceiling)`
    /// attempts in flight. Results keep input order.
    pub async fn connect_multiple(
        &self,
        targets: Vec<ConnectTarget>,
        max_concurrency: usize,
    ) -> BatchConnectResult {
        let started = Instant::now();
        let workers = max_concurrency
            .min(self.inner.config.max_concurrent_connections)
            .max(1);
        let timeout = self.inner.config.connect_timeout;
        info!(targets = targets.len(), workers, "connecting batch");

        let results: Vec<ConnectionResult> = futures_util::stream::iter(targets)
            .map(|target| {
                let fleet = self.clone();
                async move {
                    fleet
                        .add_and_connect(
                            &target.ip,
                            target.port,
                            target.expected_id.as_deref(),
                            timeout,
                        )
                        .await
                }
            })
            .buffered(workers)
            .collect()
            .await;

        let batch = BatchConnectResult::new(results, started.elapsed());
        info!(
            succeeded = batch.succeeded,
            failed = batch.failed,
            elapsed_ms = batch.elapsed.as_millis(),
            "batch finished"
        );
        batch
    }

    /// Drop a device and run `add_and_connect` again with its reloaded
    /// configuration. The managed entry's endpoint is the fallback when the
    /// device is not configured.
    pub async fn reconnect(&self, id: &EquipmentId) -> ConnectionResult {
        let configured = match self.inner.collaborators.config_source.device_config(id).await {
            Ok(config) => config.map(|c| c.endpoint),
            Err(e) => {
                warn!(equipment_id = %id, error = %e, "device config lookup failed");
                None
            }
        };
        let endpoint = configured.or_else(|| self.device(id).map(|d| d.endpoint));
        let Some(endpoint) = endpoint else {
            return ConnectionResult::Failed(ConnectionFailure {
                kind: FailureKind::NotFound,
                target: id.to_string(),
                equipment_id: Some(id.clone()),
                reason: "no managed device or configuration with this id".into(),
            });
        };

        self.disconnect_device(id, "reconnect requested").await;
        info!(equipment_id = %id, endpoint = %endpoint, "reconnecting device");
        self.add_and_connect(
            &endpoint.ip.to_string(),
            endpoint.port,
            Some(id.as_ref()),
            self.inner.config.connect_timeout,
        )
        .await
    }

    // ── Disconnecting ────────────────────────────────────────────────

    /// Stop a device and forget it. Returns `false` if it was not managed.
    pub async fn disconnect_device(&self, id: &EquipmentId, reason: &str) -> bool {
        let Some((_, connection)) = self.inner.devices.remove(id) else {
            return false;
        };
        connection.service.dispose().await;
        debug!(equipment_id = %id, reason, "device service disposed");
        self.inner.endpoint_claims.remove(&connection.endpoint);
        self.inner.id_claims.remove(id);
        info!(equipment_id = %id, endpoint = %connection.endpoint, reason, "device removed from fleet");
        true
    }

    /// Tear down every device concurrently. Returns how many were removed.
    pub async fn disconnect_all(&self, reason: &str) -> usize {
        let ids: Vec<EquipmentId> = self
            .inner
            .devices
            .iter()
            .map(|r| r.key().clone())
            .collect();
        let removed = join_all(ids.iter().map(|id| self.disconnect_device(id, reason)))
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count();
        info!(removed, "fleet disconnected");
        removed
    }

    /// Stop supervision, refuse new attempts, and disconnect everything.
    pub async fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let handles = std::mem::take(&mut *lock(&self.inner.task_handles));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "fleet supervision task ended abnormally");
            }
        }
        self.disconnect_all("fleet shutdown").await;
    }

    // ── Supervision ──────────────────────────────────────────────────

    /// Launch the health-check and stale-cleanup loops.
    pub fn start_supervision(&self) {
        let mut handles = lock(&self.inner.task_handles);
        if !handles.is_empty() || self.inner.stopping.load(Ordering::SeqCst) {
            return;
        }
        handles.push(tokio::spawn(health_task(
            self.clone(),
            self.inner.config.health_check_interval,
            self.inner.cancel.child_token(),
        )));
        handles.push(tokio::spawn(cleanup_task(
            self.clone(),
            self.inner.config.cleanup_interval,
            self.inner.cancel.child_token(),
        )));
        info!("fleet supervision started");
    }

    /// Health-check every device concurrently and record the verdicts.
    /// Returns how many are unhealthy.
    pub async fn run_health_checks(&self) -> usize {
        let devices = self.devices();
        let results = join_all(devices.iter().map(|d| d.service.health_check())).await;
        let mut unhealthy = 0;
        for (device, result) in devices.iter().zip(results) {
            device.record_health(&result);
            if result.status == HealthStatus::Unhealthy {
                unhealthy += 1;
                warn!(
                    equipment_id = %device.equipment_id,
                    status = %result.status,
                    reasons = ?result.reasons,
                    "device unhealthy"
                );
            }
        }
        unhealthy
    }

    /// Evict devices unhealthy and inactive past the stale threshold.
    pub async fn cleanup_stale(&self) -> Vec<EquipmentId> {
        let now = Utc::now();
        let threshold = self.inner.config.stale_threshold;
        let stale: Vec<EquipmentId> = self
            .devices()
            .into_iter()
            .filter(|d| d.is_stale(threshold, now))
            .map(|d| d.equipment_id.clone())
            .collect();
        for id in &stale {
            if self.disconnect_device(id, "stale connection").await {
                info!(equipment_id = %id, "stale device evicted");
            }
        }
        stale
    }
}

fn failure(
    kind: FailureKind,
    equipment_id: Option<EquipmentId>,
    reason: impl Into<String>,
) -> ConnectionFailure {
    ConnectionFailure {
        kind,
        target: String::new(),
        equipment_id,
        reason: reason.into(),
    }
}

async fn health_task(fleet: FleetManager, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if fleet.inner.stopping.load(Ordering::SeqCst) {
                    continue;
                }
                let unhealthy = fleet.run_health_checks().await;
                debug!(devices = fleet.len(), unhealthy, "fleet health check");
            }
        }
    }
}

async fn cleanup_task(fleet: FleetManager, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if fleet.inner.stopping.load(Ordering::SeqCst) {
                    continue;
                }
                fleet.cleanup_stale().await;
            }
        }
    }
}
