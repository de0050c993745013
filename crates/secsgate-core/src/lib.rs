// secsgate-core: Equipment domain model and device orchestration on top of secsgate-hsms.

pub mod config;
pub mod error;
pub mod fleet;
pub mod model;
pub mod ports;
pub mod service;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{
    AlarmSettings, DataCollectionSettings, DeviceConfig, DeviceSettings, FleetConfig,
    IdentitySvids, RemoteControlSettings,
};
pub use error::{CoreError, ErrorKind};
pub use fleet::{
    BatchConnectResult, ConnectTarget, ConnectionFailure, ConnectionResult, DeviceConnection,
    FailureKind, FleetManager, FleetSummary,
};
pub use ports::{
    Collaborators, DeviceConfigSource, EquipmentRepository, EventPublisher, StatusCache,
};
pub use service::{DeviceService, HealthCheckResult, ServiceState};
pub use store::{
    BroadcastEventPublisher, InMemoryEquipmentRepository, InMemoryStatusCache, StaticConfigSource,
};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Aggregate
    Equipment, EquipmentId, EquipmentState, HealthStatus,
    // Entities / values
    AlarmEvent, AlarmSeverity, CommandStatus, RemoteCommand, TraceData,
    // Events
    DomainEvent,
    // Supporting types
    Capability, DeviceStatus, MachineMetadata,
};

// Transport types that appear in the public API.
pub use secsgate_hsms::{ConnectionQuality, ConnectionState, Endpoint, HsmsConfig, RetryPolicy};
