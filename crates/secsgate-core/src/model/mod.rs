// ── Domain model ──
//
// Pure in-memory types. Nothing here performs I/O; the orchestration
// layer persists the aggregate and publishes the events it buffers.

pub mod alarm;
pub mod command;
pub mod equipment;
pub mod equipment_id;
pub mod event;
pub mod metadata;
pub mod ring;
pub mod state;
pub mod status;
pub mod trace;

pub use alarm::{AlarmEvent, AlarmSeverity};
pub use command::{CommandStatus, RemoteCommand};
pub use equipment::Equipment;
pub use equipment_id::EquipmentId;
pub use event::DomainEvent;
pub use metadata::{Capability, MachineMetadata};
pub use ring::BoundedRing;
pub use state::{EquipmentState, HealthStatus};
pub use status::DeviceStatus;
pub use trace::TraceData;
