// ── Transport client ──
//
// One logical HSMS session to one tool. Drives connect → select →
// establish-communication, serializes request/reply exchanges, runs the
// link-test heartbeat, and reconnects through a supervisor task fed by a
// work queue. Every teardown path funnels through `teardown()`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::Utc;
use futures_core::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Endpoint, HsmsConfig};
use crate::connection_state::ConnectionState;
use crate::error::Error;
use crate::message::{SecsItem, SecsMessage};
use crate::session::{SecsSession, SessionFactory, TransportPhase};
use crate::standard::{self, COMMACK_ACCEPTED, OnlineIdentity};

const EVENT_CHANNEL_SIZE: usize = 64;
const PRIMARY_CHANNEL_SIZE: usize = 256;
const RECONNECT_QUEUE_SIZE: usize = 4;

// ── Public types ────────────────────────────────────────────────────

/// Notifications published by the client. Dropping the receiver
/// unsubscribes.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Logical connectivity changed; carries the new snapshot.
    ConnectionChanged(Arc<ConnectionState>),
    /// A reply-expected message got no answer within T3.
    ReplyTimeout {
        stream: u8,
        function: u8,
        system_bytes: u32,
    },
    HeartbeatFailed { consecutive: u32 },
    Reconnecting { attempt: u64, delay: Duration },
}

/// Point-in-time counters. Reads are lock-free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStatistics {
    pub messages_sent: u64,
    pub replies_received: u64,
    pub primaries_received: u64,
    pub reply_timeouts: u64,
    pub reconnect_attempts: u64,
    pub heartbeats_ok: u64,
    pub consecutive_heartbeat_failures: u32,
}

// ── Internals ───────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    primaries: AtomicU64,
    reply_timeouts: AtomicU64,
    reconnect_attempts: AtomicU64,
    heartbeats_ok: AtomicU64,
    heartbeat_failures: AtomicU32,
}

/// The live session plus the tasks bound to it.
struct ActiveSession {
    id: String,
    session: Arc<dyn SecsSession>,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Work item for the reconnect supervisor.
#[derive(Debug)]
struct ReconnectRequest {
    /// Session the request was raised against. A request for a session
    /// that has since been replaced is dropped.
    session_id: Option<String>,
    reason: String,
    reconnect: bool,
}

/// Closes a session on drop unless disarmed. Guarantees a cancelled or
/// failed connect never leaves a half-open session behind.
struct SessionGuard {
    session: Option<Arc<dyn SecsSession>>,
}

impl SessionGuard {
    fn new(session: Arc<dyn SecsSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn disarm(mut self) -> Option<Arc<dyn SecsSession>> {
        self.session.take()
    }

    async fn close(mut self) {
        if let Some(session) = self.session.as_ref() {
            session.close().await;
        }
        self.session = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { session.close().await });
            }
        }
    }
}

/// Puts the phase back to `Disconnected` if a connect attempt ends
/// without committing, including when its future is dropped.
struct PhaseReset<'a> {
    phase: &'a watch::Sender<TransportPhase>,
    armed: bool,
}

impl<'a> PhaseReset<'a> {
    fn new(phase: &'a watch::Sender<TransportPhase>) -> Self {
        Self { phase, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.phase.send_replace(TransportPhase::Disconnected);
        }
    }
}

struct ClientInner {
    endpoint: Endpoint,
    config: HsmsConfig,
    factory: Arc<dyn SessionFactory>,
    session: ArcSwapOption<ActiveSession>,
    connection_lock: Mutex<()>,
    send_lock: Mutex<()>,
    state: ArcSwap<ConnectionState>,
    identity: ArcSwapOption<OnlineIdentity>,
    phase: watch::Sender<TransportPhase>,
    events: broadcast::Sender<ClientEvent>,
    primary_tx: broadcast::Sender<Arc<SecsMessage>>,
    stats: Counters,
    system_bytes: AtomicU32,
    last_attempt: StdMutex<Option<Instant>>,
    cancel: CancellationToken,
    reconnect_tx: mpsc::Sender<ReconnectRequest>,
    reconnect_rx: StdMutex<Option<mpsc::Receiver<ReconnectRequest>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── HsmsClient ──────────────────────────────────────────────────────

/// Transport client for one piece of equipment.
///
/// Cheaply cloneable via `Arc<ClientInner>`. Does not connect on
/// construction; call [`connect()`](Self::connect).
///
/// Lifecycle operations (`connect`, `disconnect`, `reconnect`) are
/// serialized by a connection lock. Reply-expected sends are serialized
/// by a separate send lock, so at most one request awaits a reply at a
/// time. Status reads never take either lock.
#[derive(Clone)]
pub struct HsmsClient {
    inner: Arc<ClientInner>,
}

impl HsmsClient {
    pub fn new(endpoint: Endpoint, config: HsmsConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let (phase, _) = watch::channel(TransportPhase::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (primary_tx, _) = broadcast::channel(PRIMARY_CHANNEL_SIZE);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_QUEUE_SIZE);
        let state = ConnectionState::new(config.retry.max_retries);

        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                config,
                factory,
                session: ArcSwapOption::empty(),
                connection_lock: Mutex::new(()),
                send_lock: Mutex::new(()),
                state: ArcSwap::from_pointee(state),
                identity: ArcSwapOption::empty(),
                phase,
                events,
                primary_tx,
                stats: Counters::default(),
                system_bytes: AtomicU32::new(1),
                last_attempt: StdMutex::new(None),
                cancel: CancellationToken::new(),
                reconnect_tx,
                reconnect_rx: StdMutex::new(Some(reconnect_rx)),
                supervisor: StdMutex::new(None),
            }),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    pub fn config(&self) -> &HsmsConfig {
        &self.inner.config
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn connection_state(&self) -> Arc<ConnectionState> {
        self.inner.state.load_full()
    }

    /// Watch the transport phase.
    pub fn phase(&self) -> watch::Receiver<TransportPhase> {
        self.inner.phase.subscribe()
    }

    pub fn current_phase(&self) -> TransportPhase {
        *self.inner.phase.borrow()
    }

    /// `true` while a selected session is installed.
    pub fn is_connected(&self) -> bool {
        self.inner.session.load().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.load().as_ref().map(|s| s.id.clone())
    }

    /// Identity reported by the most recent S1F13/S1F14 exchange.
    pub fn identity(&self) -> Option<Arc<OnlineIdentity>> {
        self.inner.identity.load_full()
    }

    pub fn statistics(&self) -> ClientStatistics {
        let s = &self.inner.stats;
        ClientStatistics {
            messages_sent: s.sent.load(Ordering::Relaxed),
            replies_received: s.received.load(Ordering::Relaxed),
            primaries_received: s.primaries.load(Ordering::Relaxed),
            reply_timeouts: s.reply_timeouts.load(Ordering::Relaxed),
            reconnect_attempts: s.reconnect_attempts.load(Ordering::Relaxed),
            heartbeats_ok: s.heartbeats_ok.load(Ordering::Relaxed),
            consecutive_heartbeat_failures: s.heartbeat_failures.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Device-initiated primaries, across reconnects.
    ///
    /// Lazy: only messages arriving after the call are yielded. If the
    /// consumer falls behind, skipped messages are logged and dropped.
    pub fn primary_messages(&self) -> impl Stream<Item = Arc<SecsMessage>> + Send + 'static {
        let mut rx = self.inner.primary_tx.subscribe();
        let cancel = self.inner.cancel.clone();
        let endpoint = self.inner.endpoint;

        async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    r = rx.recv() => Some(r),
                };
                match next {
                    None | Some(Err(RecvError::Closed)) => break,
                    Some(Err(RecvError::Lagged(skipped))) => {
                        warn!(endpoint = %endpoint, skipped, "primary message consumer lagged");
                    }
                    Some(Ok(message)) => yield message,
                }
            }
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Connect, select, and establish communication.
    ///
    /// No-op if a selected session already exists. On any failure the
    /// partially opened session is closed and the retry counter advances.
    /// Dropping the returned future has the same rollback effect.
    pub async fn connect(&self, timeout: Duration) -> Result<(), Error> {
        self.ensure_running()?;
        let _lifecycle = self.inner.connection_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.connect_locked(timeout).await
    }

    async fn connect_locked(&self, timeout: Duration) -> Result<(), Error> {
        let endpoint = self.inner.endpoint;
        self.respect_t5().await?;
        self.inner.phase.send_replace(TransportPhase::Connecting);
        let phase_reset = PhaseReset::new(&self.inner.phase);
        debug!(endpoint = %endpoint, timeout = ?timeout, "connecting");

        let attempt = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(Error::Shutdown),
            r = tokio::time::timeout(timeout, self.open_and_select()) => match r {
                Ok(r) => r,
                Err(_) => Err(Error::ConnectTimeout { endpoint: endpoint.to_string(), timeout }),
            },
        };

        match attempt {
            Ok((session, phase_rx, identity)) => {
                phase_reset.disarm();
                self.commit(session, phase_rx, identity);
                Ok(())
            }
            Err(e) => {
                self.inner.state.rcu(|s| s.retry());
                drop(phase_reset);
                warn!(endpoint = %endpoint, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Space connection attempts by at least T5.
    async fn respect_t5(&self) -> Result<(), Error> {
        let t5 = self.inner.config.t5;
        let wait = (*lock(&self.inner.last_attempt))
            .map(|last| (last + t5).saturating_duration_since(Instant::now()))
            .filter(|w| !w.is_zero());

        if let Some(wait) = wait {
            debug!(endpoint = %self.inner.endpoint, wait = ?wait, "waiting out T5");
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Err(Error::Shutdown),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        *lock(&self.inner.last_attempt) = Some(Instant::now());
        Ok(())
    }

    async fn open_and_select(
        &self,
    ) -> Result<(Arc<dyn SecsSession>, watch::Receiver<TransportPhase>, OnlineIdentity), Error> {
        let session = self
            .inner
            .factory
            .create(&self.inner.endpoint, &self.inner.config)
            .await?;
        let guard = SessionGuard::new(Arc::clone(&session));

        match self.select_and_establish(session.as_ref()).await {
            Ok((phase_rx, identity)) => {
                let session = guard.disarm().ok_or(Error::Closed)?;
                Ok((session, phase_rx, identity))
            }
            Err(e) => {
                guard.close().await;
                Err(e)
            }
        }
    }

    async fn select_and_establish(
        &self,
        session: &dyn SecsSession,
    ) -> Result<(watch::Receiver<TransportPhase>, OnlineIdentity), Error> {
        let config = &self.inner.config;
        session.open().await?;
        self.inner.phase.send_replace(TransportPhase::Connected);

        let mut phase_rx = session.phase();
        let selected = tokio::time::timeout(config.t7, phase_rx.wait_for(|p| p.is_selected()))
            .await
            .map(|r| r.is_ok());
        match selected {
            Ok(true) => {}
            Ok(false) => return Err(Error::Closed),
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    endpoint: self.inner.endpoint.to_string(),
                    timeout: config.t7,
                });
            }
        }
        debug!(endpoint = %self.inner.endpoint, "selected");

        let request =
            standard::establish_communication_request().with_system_bytes(self.next_system_bytes());
        let reply = session.send_and_wait(request.clone(), config.t3).await?;
        let reply = correlate(&request, reply)?;
        let (commack, identity) = standard::parse_establish_communication_ack(&reply)?;
        if commack != COMMACK_ACCEPTED {
            return Err(Error::Rejected {
                exchange: "S1F13",
                code: commack,
            });
        }

        Ok((phase_rx, identity))
    }

    /// Install a selected session and start its tasks.
    fn commit(
        &self,
        session: Arc<dyn SecsSession>,
        phase_rx: watch::Receiver<TransportPhase>,
        identity: OnlineIdentity,
    ) {
        let inner = &self.inner;
        let session_id = Uuid::new_v4().to_string();
        let cancel = inner.cancel.child_token();
        let weak = Arc::downgrade(inner);

        let mut tasks = Vec::with_capacity(3);
        if !inner.config.heartbeat_interval.is_zero() {
            tasks.push(tokio::spawn(heartbeat_task(
                weak.clone(),
                inner.config.heartbeat_interval,
                cancel.clone(),
            )));
        }
        if let Some(rx) = session.take_primary_messages() {
            tasks.push(tokio::spawn(forward_primaries(weak.clone(), rx, cancel.clone())));
        }
        tasks.push(tokio::spawn(watch_phase(
            weak,
            phase_rx,
            session_id.clone(),
            cancel.clone(),
        )));

        inner.session.store(Some(Arc::new(ActiveSession {
            id: session_id.clone(),
            session,
            cancel,
            tasks: StdMutex::new(tasks),
        })));
        inner.stats.heartbeat_failures.store(0, Ordering::Relaxed);
        inner.identity.store(Some(Arc::new(identity)));

        let now = Utc::now();
        inner.state.rcu(|s| s.connect(session_id.as_str(), now));
        inner.phase.send_replace(TransportPhase::Selected);
        let _ = inner
            .events
            .send(ClientEvent::ConnectionChanged(inner.state.load_full()));
        self.ensure_supervisor();

        info!(endpoint = %inner.endpoint, session_id = %session_id, "connected");
    }

    /// Close the session and mark the connection down. Idempotent.
    pub async fn disconnect(&self, reason: &str) {
        let _lifecycle = self.inner.connection_lock.lock().await;
        if !self.teardown(reason).await {
            debug!(endpoint = %self.inner.endpoint, "already disconnected");
        }
    }

    /// Disconnect, wait the back-off delay for the current retry count,
    /// then connect.
    pub async fn reconnect(&self, timeout: Duration) -> Result<(), Error> {
        self.ensure_running()?;
        {
            let _lifecycle = self.inner.connection_lock.lock().await;
            self.teardown("reconnect").await;
        }

        let attempt = self
            .inner
            .stats
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        let delay = self
            .inner
            .config
            .retry
            .delay_for(self.connection_state().retry_count);

        self.inner.phase.send_replace(TransportPhase::Retry);
        let _ = self
            .inner
            .events
            .send(ClientEvent::Reconnecting { attempt, delay });
        info!(
            endpoint = %self.inner.endpoint,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting before reconnect"
        );

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(Error::Shutdown),
            _ = tokio::time::sleep(delay) => {}
        }
        self.connect(timeout).await
    }

    /// Queue a reconnect for the supervisor task. Never blocks; returns
    /// `false` if a reconnect is already queued or the client is shut down.
    pub fn request_reconnect(&self, reason: &str) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        self.ensure_supervisor();
        self.enqueue(ReconnectRequest {
            session_id: self.session_id(),
            reason: reason.to_owned(),
            reconnect: true,
        })
    }

    /// Cancel every task and tear the session down. The client cannot be
    /// reused afterwards.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        let _lifecycle = self.inner.connection_lock.lock().await;
        self.teardown("shutdown").await;
    }

    /// The single teardown path. Takes the session out of its slot
    /// (exactly once), cancels its tasks, and closes it.
    ///
    /// Callers hold the connection lock.
    async fn teardown(&self, reason: &str) -> bool {
        let Some(active) = self.inner.session.swap(None) else {
            return false;
        };
        let guard = SessionGuard::new(Arc::clone(&active.session));
        self.mark_disconnected(reason);

        active.cancel.cancel();
        let tasks = std::mem::take(&mut *lock(&active.tasks));
        for handle in tasks {
            let _ = handle.await;
        }
        guard.close().await;
        info!(endpoint = %self.inner.endpoint, session_id = %active.id, reason, "disconnected");
        true
    }

    fn mark_disconnected(&self, reason: &str) {
        let now = Utc::now();
        self.inner.state.rcu(|s| s.disconnect(reason, now));
        self.inner.phase.send_replace(TransportPhase::Disconnected);
        let _ = self
            .inner
            .events
            .send(ClientEvent::ConnectionChanged(self.inner.state.load_full()));
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.inner.cancel.is_cancelled() {
            Err(Error::Shutdown)
        } else {
            Ok(())
        }
    }

    fn ensure_supervisor(&self) {
        let Some(rx) = lock(&self.inner.reconnect_rx).take() else {
            return;
        };
        let handle = tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            rx,
            self.inner.cancel.clone(),
        ));
        *lock(&self.inner.supervisor) = Some(handle);
    }

    fn enqueue(&self, request: ReconnectRequest) -> bool {
        match self.inner.reconnect_tx.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                debug!(endpoint = %self.inner.endpoint, error = %e, "reconnect request not queued");
                false
            }
        }
    }

    // ── Messaging ───────────────────────────────────────────────────

    fn next_system_bytes(&self) -> u32 {
        loop {
            let n = self.inner.system_bytes.fetch_add(1, Ordering::Relaxed);
            if n != 0 {
                return n;
            }
        }
    }

    fn active(&self) -> Result<Arc<ActiveSession>, Error> {
        self.ensure_running()?;
        self.inner.session.load_full().ok_or(Error::NotConnected)
    }

    /// Send a message.
    ///
    /// Primaries get fresh system bytes; secondaries keep the ones copied
    /// from their primary. Reply-expected messages queue behind the send
    /// lock and wait at most T3 for a correlated reply. A timeout counts
    /// once, is published as [`ClientEvent::ReplyTimeout`], and leaves the
    /// session up.
    pub async fn send(&self, message: SecsMessage) -> Result<Option<SecsMessage>, Error> {
        let active = self.active()?;
        let message = if message.is_primary() {
            message.with_system_bytes(self.next_system_bytes())
        } else {
            message
        };

        if !message.reply_expected {
            debug!(endpoint = %self.inner.endpoint, message = %message, "send");
            active.session.send(message).await?;
            self.inner.stats.sent.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let _in_flight = self.inner.send_lock.lock().await;
        self.exchange(active.session.as_ref(), message).await.map(Some)
    }

    async fn exchange(
        &self,
        session: &dyn SecsSession,
        request: SecsMessage,
    ) -> Result<SecsMessage, Error> {
        let t3 = self.inner.config.t3;
        debug!(endpoint = %self.inner.endpoint, message = %request, "send and wait");
        self.inner.stats.sent.fetch_add(1, Ordering::Relaxed);

        let reply = match tokio::time::timeout(t3, session.send_and_wait(request.clone(), t3)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(Error::ReplyTimeout { .. })) | Err(_) => {
                return Err(self.record_reply_timeout(&request));
            }
            Ok(Err(e)) => return Err(e),
        };
        let reply = correlate(&request, reply)?;
        self.inner.stats.received.fetch_add(1, Ordering::Relaxed);
        Ok(reply)
    }

    fn record_reply_timeout(&self, request: &SecsMessage) -> Error {
        self.inner
            .stats
            .reply_timeouts
            .fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.events.send(ClientEvent::ReplyTimeout {
            stream: request.stream,
            function: request.function,
            system_bytes: request.system_bytes,
        });
        warn!(endpoint = %self.inner.endpoint, message = %request, "reply timeout");
        Error::ReplyTimeout {
            stream: request.stream,
            function: request.function,
            system_bytes: request.system_bytes,
            timeout: self.inner.config.t3,
        }
    }

    /// Send a reply-expected primary and return its reply.
    pub async fn request(&self, message: SecsMessage) -> Result<SecsMessage, Error> {
        let label = message.label();
        self.send(message.with_reply_expected())
            .await?
            .ok_or(Error::UnexpectedReply {
                expected: label,
                got: "nothing".into(),
            })
    }

    /// Answer a device-initiated primary.
    pub async fn reply(&self, primary: &SecsMessage, body: Option<SecsItem>) -> Result<(), Error> {
        self.send(primary.reply_with(body)).await.map(|_| ())
    }

    /// HSMS link test bounded by T6. Returns the round-trip time.
    ///
    /// Success stamps the heartbeat and clears the failure streak; failure
    /// extends it. Callers decide whether to reconnect.
    pub async fn send_heartbeat(&self) -> Result<Duration, Error> {
        let active = self.active()?;
        let t6 = self.inner.config.t6;
        let started = Instant::now();

        let outcome = match tokio::time::timeout(t6, active.session.link_test(t6)).await {
            Ok(r) => r,
            Err(_) => Err(Error::LinkTestTimeout { timeout: t6 }),
        };

        match outcome {
            Ok(()) => {
                let now = Utc::now();
                self.inner.state.rcu(|s| s.update_heartbeat(now));
                self.inner.stats.heartbeat_failures.store(0, Ordering::Relaxed);
                self.inner.stats.heartbeats_ok.fetch_add(1, Ordering::Relaxed);
                Ok(started.elapsed())
            }
            Err(e) => {
                let consecutive = self
                    .inner
                    .stats
                    .heartbeat_failures
                    .fetch_add(1, Ordering::Relaxed)
                    .saturating_add(1);
                let _ = self
                    .inner
                    .events
                    .send(ClientEvent::HeartbeatFailed { consecutive });
                Err(e)
            }
        }
    }

    // ── Standard exchanges ──────────────────────────────────────────

    /// S1F1/S1F2 round trip. Returns the elapsed time.
    pub async fn test_connection(&self) -> Result<Duration, Error> {
        let started = Instant::now();
        let reply = self.request(standard::are_you_there()).await?;
        standard::parse_on_line_data(&reply)?;
        Ok(started.elapsed())
    }

    /// S1F3/S1F4 for the given status variables.
    pub async fn get_equipment_state(&self, svids: &[u32]) -> Result<Vec<SecsItem>, Error> {
        let reply = self
            .request(standard::status_variable_request(svids))
            .await?;
        standard::parse_status_values(&reply)
    }

    /// S1F13/S1F14 on the current session. COMMACK must be 0.
    pub async fn establish_communication(&self) -> Result<OnlineIdentity, Error> {
        let reply = self
            .request(standard::establish_communication_request())
            .await?;
        let (commack, identity) = standard::parse_establish_communication_ack(&reply)?;
        if commack != COMMACK_ACCEPTED {
            return Err(Error::Rejected {
                exchange: "S1F13",
                code: commack,
            });
        }
        self.inner.identity.store(Some(Arc::new(identity.clone())));
        Ok(identity)
    }
}

fn correlate(request: &SecsMessage, reply: SecsMessage) -> Result<SecsMessage, Error> {
    if reply.is_reply_to(request) {
        Ok(reply)
    } else {
        Err(Error::UnexpectedReply {
            expected: request.to_string(),
            got: reply.to_string(),
        })
    }
}

// ── Background tasks ────────────────────────────────────────────────

/// Periodic link test. Reaching the failure threshold queues a reconnect
/// and ends the task; the next session starts a fresh one.
async fn heartbeat_task(inner: Weak<ClientInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        let client = HsmsClient { inner };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = client.send_heartbeat() => r,
        };
        match outcome {
            Ok(rtt) => debug!(endpoint = %client.inner.endpoint, rtt = ?rtt, "heartbeat ok"),
            Err(Error::NotConnected | Error::Shutdown) => break,
            Err(e) => {
                let consecutive = client.inner.stats.heartbeat_failures.load(Ordering::Relaxed);
                warn!(endpoint = %client.inner.endpoint, error = %e, consecutive, "heartbeat failed");

                let config = &client.inner.config;
                if consecutive >= config.heartbeat_failure_threshold && config.auto_reconnect {
                    client.enqueue(ReconnectRequest {
                        session_id: client.session_id(),
                        reason: format!("{consecutive} consecutive heartbeat failures"),
                        reconnect: true,
                    });
                    break;
                }
            }
        }
    }
}

/// Forward device-initiated primaries into the client's broadcast channel.
async fn forward_primaries(
    inner: Weak<ClientInner>,
    mut rx: mpsc::Receiver<SecsMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            m = rx.recv() => m,
        };
        let Some(message) = message else { break };
        let Some(inner) = inner.upgrade() else { break };

        inner.stats.primaries.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = %inner.endpoint, message = %message, "primary received");
        // No subscribers is not an error.
        let _ = inner.primary_tx.send(Arc::new(message));
    }
}

/// Mirror the session phase and report a lost link to the supervisor.
async fn watch_phase(
    inner: Weak<ClientInner>,
    mut phase: watch::Receiver<TransportPhase>,
    session_id: String,
    cancel: CancellationToken,
) {
    loop {
        let changed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            c = phase.changed() => c,
        };
        let current = match changed {
            Ok(()) => *phase.borrow_and_update(),
            Err(_) => TransportPhase::Disconnected,
        };
        let Some(inner) = inner.upgrade() else { return };
        inner.phase.send_replace(current);

        if !current.is_selected() {
            warn!(endpoint = %inner.endpoint, phase = %current, "link lost");
            let client = HsmsClient { inner };
            client.enqueue(ReconnectRequest {
                session_id: Some(session_id),
                reason: "link lost".into(),
                reconnect: client.inner.config.auto_reconnect,
            });
            return;
        }
    }
}

/// Drains reconnect requests one at a time. Holds only a weak reference
/// while idle so an abandoned client can be dropped.
async fn supervise(
    inner: Weak<ClientInner>,
    mut rx: mpsc::Receiver<ReconnectRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = rx.recv() => r,
        };
        let Some(request) = request else { break };
        let Some(inner) = inner.upgrade() else { break };
        let client = HsmsClient { inner };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            () = client.handle_reconnect(request) => {}
        }
    }
    debug!("reconnect supervisor exiting");
}

impl HsmsClient {
    async fn handle_reconnect(&self, request: ReconnectRequest) {
        let current = self.session_id();
        if current.is_some() && current != request.session_id {
            debug!(endpoint = %self.inner.endpoint, "stale reconnect request dropped");
            return;
        }

        {
            let _lifecycle = self.inner.connection_lock.lock().await;
            if request.session_id.is_some() && self.session_id() == request.session_id {
                self.teardown(&request.reason).await;
            }
        }
        if !request.reconnect {
            return;
        }

        info!(endpoint = %self.inner.endpoint, reason = %request.reason, "automatic reconnect");
        let timeout = self.inner.config.t7 + self.inner.config.t3;
        loop {
            if !self.connection_state().can_retry() {
                error!(
                    endpoint = %self.inner.endpoint,
                    max_retries = self.inner.config.retry.max_retries,
                    "reconnection limit reached, giving up"
                );
                return;
            }
            match self.reconnect(timeout).await {
                Ok(()) => return,
                Err(Error::Shutdown) => return,
                Err(e) => warn!(endpoint = %self.inner.endpoint, error = %e, "reconnect attempt failed"),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::sim::{SimulatedEquipment, SimulatedFactory};
    use futures_util::StreamExt;

    fn endpoint() -> Endpoint {
        "10.1.1.10:5000".parse().unwrap()
    }

    fn config() -> HsmsConfig {
        HsmsConfig {
            t3: Duration::from_secs(2),
            t5: Duration::from_millis(10),
            heartbeat_interval: Duration::ZERO,
            retry: RetryPolicy {
                jitter: false,
                initial_delay: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
            ..HsmsConfig::default()
        }
    }

    fn setup(config: HsmsConfig) -> (HsmsClient, SimulatedEquipment, Arc<SimulatedFactory>) {
        let factory = Arc::new(SimulatedFactory::new());
        let tool = factory.add(endpoint(), SimulatedEquipment::new("ETCH-3000", "1.0"));
        let client = HsmsClient::new(endpoint(), config, factory.clone());
        (client, tool, factory)
    }

    #[tokio::test]
    async fn connect_establishes_session_and_identity() {
        let (client, _tool, factory) = setup(config());
        let mut events = client.subscribe();

        client.connect(Duration::from_secs(5)).await.unwrap();

        assert!(client.is_connected());
        assert_eq!(client.current_phase(), TransportPhase::Selected);
        let state = client.connection_state();
        assert!(state.is_connected);
        assert_eq!(state.session_id, client.session_id());
        assert_eq!(client.identity().unwrap().model, "ETCH-3000");
        assert_eq!(factory.open_sessions(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::ConnectionChanged(s) if s.is_connected
        ));

        // second connect is a no-op
        client.connect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(factory.sessions_created(), 1);
    }

    #[tokio::test]
    async fn rejected_commack_rolls_back_session() {
        let (client, tool, factory) = setup(config());
        tool.set_commack(1);

        let err = client.connect(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.reject_code(), Some(1));
        assert!(!client.is_connected());
        assert_eq!(client.connection_state().retry_count, 1);
        assert_eq!(factory.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_never_selected() {
        let (client, tool, factory) = setup(config());
        tool.set_select_delay(Duration::from_secs(3600));

        let err = client.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_timeout());
        // the guard closes the half-open session on a spawned task
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.open_sessions(), 0);
        assert_eq!(client.current_phase(), TransportPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_leaves_nothing_behind() {
        let (client, tool, factory) = setup(config());
        tool.set_select_delay(Duration::from_secs(3600));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), client.connect(Duration::from_secs(60)))
                .await;
        assert!(abandoned.is_err());
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(client.current_phase(), TransportPhase::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(factory.open_sessions(), 0);

        tool.set_select_delay(Duration::ZERO);
        client.connect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.current_phase(), TransportPhase::Selected);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_releases_the_send_slot() {
        let (client, tool, _factory) = setup(config());
        client.connect(Duration::from_secs(5)).await.unwrap();

        tool.set_responding(false);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), client.test_connection()).await;
        assert!(abandoned.is_err());

        tool.set_responding(true);
        client.test_connection().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.statistics().reply_timeouts, 0);
    }

    #[tokio::test]
    async fn send_when_disconnected_is_not_connected() {
        let (client, _tool, _factory) = setup(config());
        let err = client.send(standard::are_you_there()).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_timeout_counts_once_and_keeps_session() {
        let (client, tool, _factory) = setup(config());
        client.connect(Duration::from_secs(5)).await.unwrap();
        let mut events = client.subscribe();

        tool.set_responding(false);
        let err = client.test_connection().await.unwrap_err();

        assert!(matches!(err, Error::ReplyTimeout { stream: 1, function: 1, .. }));
        assert_eq!(client.statistics().reply_timeouts, 1);
        assert!(client.is_connected());
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::ReplyTimeout { stream: 1, function: 1, .. }
        ));

        tool.set_responding(true);
        client.test_connection().await.unwrap();
        assert_eq!(client.statistics().reply_timeouts, 1);
    }

    #[tokio::test]
    async fn concurrent_sends_are_single_flight() {
        let (client, tool, _factory) = setup(config());
        client.connect(Duration::from_secs(5)).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.get_equipment_state(&[1]).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(tool.peak_in_flight_requests(), 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (client, _tool, factory) = setup(config());
        client.connect(Duration::from_secs(5)).await.unwrap();

        client.disconnect("operator").await;
        client.disconnect("again").await;

        let state = client.connection_state();
        assert!(!state.is_connected);
        assert_eq!(state.disconnect_reason.as_deref(), Some("operator"));
        assert_eq!(factory.open_sessions(), 0);
        assert_eq!(factory.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn primary_stream_survives_reconnect() {
        let (client, tool, _factory) = setup(config());
        let mut primaries = Box::pin(client.primary_messages());
        client.connect(Duration::from_secs(5)).await.unwrap();

        tool.raise_alarm(5, 4, "Door Open");
        let first = primaries.next().await.unwrap();
        assert_eq!(first.label(), "S5F1");

        client.reconnect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.statistics().reconnect_attempts, 1);

        tool.clear_alarm(5);
        let second = primaries.next().await.unwrap();
        assert_eq!(second.label(), "S5F1");
        assert_eq!(client.statistics().primaries_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_failures_trigger_reconnect() {
        let (client, tool, factory) = setup(HsmsConfig {
            heartbeat_interval: Duration::from_secs(1),
            ..config()
        });
        client.connect(Duration::from_secs(5)).await.unwrap();
        let first_session = client.session_id();
        let mut events = client.subscribe();

        tool.set_link_test_ok(false);
        let mut failures = 0;
        while failures < 3 {
            if let ClientEvent::HeartbeatFailed { consecutive } = events.recv().await.unwrap() {
                failures = consecutive;
            }
        }
        tool.set_link_test_ok(true);

        loop {
            if let ClientEvent::ConnectionChanged(state) = events.recv().await.unwrap() {
                if state.is_connected {
                    break;
                }
            }
        }
        assert_ne!(client.session_id(), first_session);
        assert_eq!(factory.sessions_created(), 2);
        assert_eq!(client.statistics().consecutive_heartbeat_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_reconnects_automatically() {
        let (client, tool, _factory) = setup(config());
        client.connect(Duration::from_secs(5)).await.unwrap();
        let mut events = client.subscribe();

        tool.drop_link();

        let mut saw_down = false;
        loop {
            if let ClientEvent::ConnectionChanged(state) = events.recv().await.unwrap() {
                if !state.is_connected {
                    saw_down = true;
                    assert_eq!(state.disconnect_reason.as_deref(), Some("link lost"));
                } else {
                    break;
                }
            }
        }
        assert!(saw_down);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn shutdown_prevents_reuse() {
        let (client, _tool, factory) = setup(config());
        client.connect(Duration::from_secs(5)).await.unwrap();
        client.shutdown().await;

        assert!(!client.is_connected());
        assert_eq!(factory.open_sessions(), 0);
        assert!(matches!(
            client.connect(Duration::from_secs(1)).await,
            Err(Error::Shutdown)
        ));
        assert!(!client.request_reconnect("late"));
    }
}
