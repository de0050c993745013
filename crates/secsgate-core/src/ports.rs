// ── Outbound collaborators ──
//
// Storage, caching, event publication, and configuration are external to
// the core. The orchestration layer talks to them only through these
// traits; `store` provides in-memory implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secsgate_hsms::Endpoint;

use crate::config::{DeviceConfig, FleetConfig};
use crate::error::CoreError;
use crate::model::{DeviceStatus, DomainEvent, Equipment, EquipmentId, EquipmentState};
use crate::store::{
    BroadcastEventPublisher, InMemoryEquipmentRepository, InMemoryStatusCache, StaticConfigSource,
};

#[async_trait]
pub trait EquipmentRepository: Send + Sync {
    async fn load(&self, id: &EquipmentId) -> Result<Option<Equipment>, CoreError>;
    async fn save(&self, equipment: &Equipment) -> Result<(), CoreError>;
    async fn find_by_endpoint(&self, endpoint: &Endpoint) -> Result<Option<Equipment>, CoreError>;
    async fn find_by_state(&self, state: EquipmentState) -> Result<Vec<Equipment>, CoreError>;
}

#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn put(&self, id: &EquipmentId, status: DeviceStatus, ttl: Duration)
    -> Result<(), CoreError>;
    async fn get(&self, id: &EquipmentId) -> Result<Option<DeviceStatus>, CoreError>;
    async fn invalidate(&self, id: &EquipmentId) -> Result<(), CoreError>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, events: &[DomainEvent]) -> Result<(), CoreError>;
}

#[async_trait]
pub trait DeviceConfigSource: Send + Sync {
    async fn device_config(&self, id: &EquipmentId) -> Result<Option<DeviceConfig>, CoreError>;
    async fn device_config_for_endpoint(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Option<DeviceConfig>, CoreError>;
    async fn fleet_config(&self) -> Result<FleetConfig, CoreError>;
}

/// The collaborator set handed to every device service.
#[derive(Clone)]
pub struct Collaborators {
    pub repository: Arc<dyn EquipmentRepository>,
    pub status_cache: Arc<dyn StatusCache>,
    pub publisher: Arc<dyn EventPublisher>,
    pub config_source: Arc<dyn DeviceConfigSource>,
}

impl Collaborators {
    /// In-memory collaborators around a static configuration.
    pub fn in_memory(config_source: StaticConfigSource) -> Self {
        Self {
            repository: Arc::new(InMemoryEquipmentRepository::new()),
            status_cache: Arc::new(InMemoryStatusCache::new()),
            publisher: Arc::new(BroadcastEventPublisher::default()),
            config_source: Arc::new(config_source),
        }
    }
}
