//! HSMS transport layer for SECS/GEM equipment.
//!
//! This crate owns everything between a gateway and one piece of equipment
//! on the wire side of the domain model:
//!
//! - **[`HsmsClient`]**: one logical session to one tool. Drives the
//!   connect → select → establish-communication sequence, serializes
//!   request/reply exchanges (single-flight per device), runs the link-test
//!   heartbeat, and reconnects with exponential backoff.
//!
//! - **[`SecsMessage`] / [`SecsItem`]**: the typed SECS-II message model the
//!   external codec produces and consumes. [`standard`] builds and parses
//!   the subset of streams/functions the gateway speaks.
//!
//! - **[`SessionFactory`] / [`SecsSession`]**: the seam to the codec. The
//!   binary encoding lives behind these traits; the client never touches
//!   bytes.
//!
//! - **[`ConnectionState`]**: immutable snapshot of logical connectivity
//!   (session id, retries, heartbeat quality) shared with the domain layer.
//!
//! - **`sim`** (feature `sim`): in-memory simulated equipment implementing
//!   the session seam, for tests and dry runs.

pub mod client;
pub mod config;
pub mod connection_state;
pub mod error;
pub mod message;
pub mod session;
pub mod standard;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::{ClientEvent, ClientStatistics, HsmsClient};
pub use config::{ConnectionMode, Endpoint, HsmsConfig, RetryPolicy};
pub use connection_state::{ConnectionQuality, ConnectionState};
pub use error::Error;
pub use message::{MessageCategory, SecsItem, SecsMessage};
pub use session::{SecsSession, SessionFactory, TransportPhase};
pub use standard::OnlineIdentity;
