// ── In-memory collaborators ──
//
// Process-local implementations of the port traits. Suitable for tests,
// the simulator, and single-node deployments without external storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use secsgate_hsms::Endpoint;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::collection::EquipmentCollection;
use crate::config::{DeviceConfig, FleetConfig};
use crate::error::CoreError;
use crate::model::{DeviceStatus, DomainEvent, Equipment, EquipmentId, EquipmentState};
use crate::ports::{DeviceConfigSource, EquipmentRepository, EventPublisher, StatusCache};

const EVENT_CHANNEL_SIZE: usize = 1024;

// ── Repository ──────────────────────────────────────────────────────

pub struct InMemoryEquipmentRepository {
    equipment: EquipmentCollection,
}

impl InMemoryEquipmentRepository {
    pub fn new() -> Self {
        Self {
            equipment: EquipmentCollection::new(),
        }
    }

    /// Snapshot of every stored aggregate, ordered by id.
    pub fn all(&self) -> Arc<Vec<Arc<Equipment>>> {
        self.equipment.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Equipment>>>> {
        self.equipment.subscribe()
    }

    pub fn remove(&self, id: &EquipmentId) -> bool {
        self.equipment.remove(id).is_some()
    }

    /// Number of saves and removals so far.
    pub fn version(&self) -> u64 {
        self.equipment.version()
    }

    pub fn len(&self) -> usize {
        self.equipment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEquipmentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EquipmentRepository for InMemoryEquipmentRepository {
    async fn load(&self, id: &EquipmentId) -> Result<Option<Equipment>, CoreError> {
        Ok(self.equipment.get(id).map(|e| (*e).clone()))
    }

    async fn save(&self, equipment: &Equipment) -> Result<(), CoreError> {
        self.equipment.upsert(equipment.clone());
        Ok(())
    }

    async fn find_by_endpoint(&self, endpoint: &Endpoint) -> Result<Option<Equipment>, CoreError> {
        Ok(self
            .equipment
            .get_by_endpoint(endpoint)
            .map(|e| (*e).clone()))
    }

    async fn find_by_state(&self, state: EquipmentState) -> Result<Vec<Equipment>, CoreError> {
        Ok(self
            .equipment
            .snapshot()
            .iter()
            .filter(|e| e.state() == state)
            .map(|e| (**e).clone())
            .collect())
    }
}

// ── Status cache ────────────────────────────────────────────────────

/// TTL cache keyed by equipment id. Expiry uses the tokio clock so tests
/// can drive it with `time::pause`.
#[derive(Default)]
pub struct InMemoryStatusCache {
    entries: DashMap<EquipmentId, (DeviceStatus, Instant)>,
}

impl InMemoryStatusCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusCache for InMemoryStatusCache {
    async fn put(
        &self,
        id: &EquipmentId,
        status: DeviceStatus,
        ttl: Duration,
    ) -> Result<(), CoreError> {
        self.entries
            .insert(id.clone(), (status, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, id: &EquipmentId) -> Result<Option<DeviceStatus>, CoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(id) {
            if entry.1 > now {
                return Ok(Some(entry.0.clone()));
            }
        }
        self.entries.remove_if(id, |_, (_, expires)| *expires <= now);
        Ok(None)
    }

    async fn invalidate(&self, id: &EquipmentId) -> Result<(), CoreError> {
        self.entries.remove(id);
        Ok(())
    }
}

// ── Event publisher ─────────────────────────────────────────────────

/// Fans domain events out over a `broadcast` channel. Publishing with no
/// subscribers succeeds.
pub struct BroadcastEventPublisher {
    tx: broadcast::Sender<DomainEvent>,
    published: AtomicU64,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_SIZE)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, events: &[DomainEvent]) -> Result<(), CoreError> {
        for event in events {
            let _ = self.tx.send(event.clone());
        }
        self.published
            .fetch_add(u64::try_from(events.len()).unwrap_or(u64::MAX), Ordering::Relaxed);
        Ok(())
    }
}

// ── Configuration source ────────────────────────────────────────────

/// Configuration fixed at startup, with devices addable at runtime.
pub struct StaticConfigSource {
    fleet: FleetConfig,
    devices: DashMap<EquipmentId, DeviceConfig>,
}

impl StaticConfigSource {
    pub fn new(fleet: FleetConfig, devices: impl IntoIterator<Item = DeviceConfig>) -> Self {
        Self {
            fleet,
            devices: devices
                .into_iter()
                .map(|d| (d.equipment_id.clone(), d))
                .collect(),
        }
    }

    pub fn insert(&self, config: DeviceConfig) {
        self.devices.insert(config.equipment_id.clone(), config);
    }

    /// Every configured device, ordered by id.
    pub fn devices(&self) -> Vec<DeviceConfig> {
        let mut devices: Vec<_> = self.devices.iter().map(|r| r.value().clone()).collect();
        devices.sort_by(|a, b| a.equipment_id.cmp(&b.equipment_id));
        devices
    }

    pub fn fleet(&self) -> &FleetConfig {
        &self.fleet
    }
}

impl Default for StaticConfigSource {
    fn default() -> Self {
        Self::new(FleetConfig::default(), Vec::new())
    }
}

#[async_trait]
impl DeviceConfigSource for StaticConfigSource {
    async fn device_config(&self, id: &EquipmentId) -> Result<Option<DeviceConfig>, CoreError> {
        Ok(self.devices.get(id).map(|r| r.value().clone()))
    }

    async fn device_config_for_endpoint(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Option<DeviceConfig>, CoreError> {
        Ok(self
            .devices
            .iter()
            .find(|r| r.value().endpoint == *endpoint)
            .map(|r| r.value().clone()))
    }

    async fn fleet_config(&self) -> Result<FleetConfig, CoreError> {
        Ok(self.fleet.clone())
    }
}
