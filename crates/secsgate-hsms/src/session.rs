// ── Codec seam ──
//
// The SECS-II binary codec and HSMS socket handling are external. They plug
// in through these two traits; everything above them speaks typed messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::{mpsc, watch};

use crate::config::{Endpoint, HsmsConfig};
use crate::error::Error;
use crate::message::SecsMessage;

/// HSMS transport phase reported by the codec.
///
/// Distinct from the logical [`ConnectionState`](crate::ConnectionState):
/// the phase is the *input* that drives it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum TransportPhase {
    #[default]
    Disconnected,
    Connecting,
    /// TCP established, not yet selected.
    Connected,
    /// Both peers completed selection; data messages may flow.
    Selected,
    /// Waiting to re-attempt after a failure.
    Retry,
}

impl TransportPhase {
    pub fn is_selected(self) -> bool {
        matches!(self, Self::Selected)
    }
}

/// One HSMS session as exposed by the codec.
///
/// Implementations correlate replies by system bytes internally; the client
/// verifies the correlation again on receipt.
#[async_trait]
pub trait SecsSession: Send + Sync {
    /// Begin connecting (active mode) or listening (passive mode).
    ///
    /// Returns once the attempt has been started; progress is reported
    /// through [`phase`](Self::phase).
    async fn open(&self) -> Result<(), Error>;

    /// Watch channel tracking the transport phase.
    fn phase(&self) -> watch::Receiver<TransportPhase>;

    /// Send a primary with the W-bit set and wait up to `timeout` for its reply.
    async fn send_and_wait(&self, message: SecsMessage, timeout: Duration)
    -> Result<SecsMessage, Error>;

    /// Send without waiting (secondaries, or primaries without the W-bit).
    async fn send(&self, message: SecsMessage) -> Result<(), Error>;

    /// HSMS `Linktest.req` / `Linktest.rsp` bounded by `timeout` (T6).
    async fn link_test(&self, timeout: Duration) -> Result<(), Error>;

    /// Device-initiated primaries. Yields `Some` exactly once per session.
    fn take_primary_messages(&self) -> Option<mpsc::Receiver<SecsMessage>>;

    /// Send `Separate.req` if selected and release the socket. Idempotent.
    async fn close(&self);
}

/// Creates sessions for endpoints. One factory serves the whole fleet.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        endpoint: &Endpoint,
        config: &HsmsConfig,
    ) -> Result<Arc<dyn SecsSession>, Error>;
}
