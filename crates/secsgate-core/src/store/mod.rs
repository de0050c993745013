// ── In-memory storage ──

mod collection;
pub mod memory;

pub use memory::{
    BroadcastEventPublisher, InMemoryEquipmentRepository, InMemoryStatusCache, StaticConfigSource,
};
