// ── Simulated equipment ──
//
// In-memory tools implementing the session seam. A `SimulatedFactory`
// maps endpoints to `SimulatedEquipment`; each `create` yields a fresh
// session bound to that tool. Answers the standard exchanges from a
// mutable settings table and lets tests inject device-initiated
// primaries or drop the link.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::config::{Endpoint, HsmsConfig};
use crate::error::Error;
use crate::message::{SecsItem, SecsMessage};
use crate::session::{SecsSession, SessionFactory, TransportPhase};
use crate::standard::{ALCD_SET_BIT, ALED_ENABLE, AlarmReport, hcack};

const PRIMARY_QUEUE_SIZE: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Settings {
    model: String,
    software_revision: String,
    variables: BTreeMap<u32, SecsItem>,
    alarms: BTreeMap<u32, AlarmReport>,
    enabled_alarms: BTreeSet<u32>,
    enabled_events: Option<BTreeSet<u32>>,
    commack: u8,
    hcack: u8,
    command_effects: BTreeMap<String, (u32, SecsItem)>,
    responding: bool,
    link_test_ok: bool,
    select_delay: Duration,
    failing_opens: u32,
}

// ── SimulatedEquipment ──────────────────────────────────────────────

/// One simulated tool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedEquipment {
    inner: Arc<EquipmentInner>,
}

struct EquipmentInner {
    settings: Mutex<Settings>,
    sessions: Mutex<Vec<Weak<SimSession>>>,
    received: Mutex<Vec<SecsMessage>>,
    commands: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    system_bytes: AtomicU32,
}

impl SimulatedEquipment {
    pub fn new(model: &str, software_revision: &str) -> Self {
        Self {
            inner: Arc::new(EquipmentInner {
                settings: Mutex::new(Settings {
                    model: model.to_owned(),
                    software_revision: software_revision.to_owned(),
                    variables: BTreeMap::new(),
                    alarms: BTreeMap::new(),
                    enabled_alarms: BTreeSet::new(),
                    enabled_events: None,
                    commack: 0,
                    hcack: hcack::OK,
                    command_effects: BTreeMap::new(),
                    responding: true,
                    link_test_ok: true,
                    select_delay: Duration::ZERO,
                    failing_opens: 0,
                }),
                sessions: Mutex::new(Vec::new()),
                received: Mutex::new(Vec::new()),
                commands: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                system_bytes: AtomicU32::new(0x1000_0000),
            }),
        }
    }

    #[must_use]
    pub fn with_variable(self, id: u32, value: SecsItem) -> Self {
        self.set_variable(id, value);
        self
    }

    /// Make an accepted S2F41 `rcmd` also set variable `id` to `value`,
    /// e.g. `START` moving the state variable to EXECUTING.
    #[must_use]
    pub fn with_command_effect(self, rcmd: &str, id: u32, value: SecsItem) -> Self {
        lock(&self.inner.settings)
            .command_effects
            .insert(rcmd.to_owned(), (id, value));
        self
    }

    pub fn set_variable(&self, id: u32, value: SecsItem) {
        lock(&self.inner.settings).variables.insert(id, value);
    }

    pub fn variable(&self, id: u32) -> Option<SecsItem> {
        lock(&self.inner.settings).variables.get(&id).cloned()
    }

    pub fn set_commack(&self, code: u8) {
        lock(&self.inner.settings).commack = code;
    }

    pub fn set_hcack(&self, code: u8) {
        lock(&self.inner.settings).hcack = code;
    }

    /// Stop answering data messages; exchanges run into T3.
    pub fn set_responding(&self, responding: bool) {
        lock(&self.inner.settings).responding = responding;
    }

    pub fn set_link_test_ok(&self, ok: bool) {
        lock(&self.inner.settings).link_test_ok = ok;
    }

    /// Delay between `open` and the *Selected* phase.
    pub fn set_select_delay(&self, delay: Duration) {
        lock(&self.inner.settings).select_delay = delay;
    }

    /// Refuse the next `count` session opens.
    pub fn fail_next_opens(&self, count: u32) {
        lock(&self.inner.settings).failing_opens = count;
    }

    /// Alarm ids the host enabled through S5F3.
    pub fn enabled_alarms(&self) -> BTreeSet<u32> {
        lock(&self.inner.settings).enabled_alarms.clone()
    }

    /// Event ids enabled through S2F37; `None` until the first S2F37.
    pub fn enabled_events(&self) -> Option<BTreeSet<u32>> {
        lock(&self.inner.settings).enabled_events.clone()
    }

    /// Remote commands received through S2F41, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.inner.commands).clone()
    }

    /// Every message the host sent, in order.
    pub fn received(&self) -> Vec<SecsMessage> {
        lock(&self.inner.received).clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.live_sessions().len()
    }

    /// Highest number of reply-expected exchanges observed at once.
    pub fn peak_in_flight_requests(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    // ── Device-initiated traffic ────────────────────────────────────

    /// Set an alarm and send S5F1 with the set bit.
    pub fn raise_alarm(&self, alid: u32, category: u8, text: &str) {
        let report = AlarmReport {
            alcd: ALCD_SET_BIT | (category & !ALCD_SET_BIT),
            alid,
            text: text.to_owned(),
        };
        lock(&self.inner.settings)
            .alarms
            .insert(alid, report.clone());
        self.push(alarm_message(&report));
    }

    /// Clear an alarm and send S5F1 without the set bit.
    pub fn clear_alarm(&self, alid: u32) {
        let report = {
            let mut settings = lock(&self.inner.settings);
            let Some(report) = settings.alarms.get_mut(&alid) else {
                return;
            };
            report.alcd &= !ALCD_SET_BIT;
            report.clone()
        };
        self.push(alarm_message(&report));
    }

    /// Send S6F11 with the given `(rptid, values)` reports.
    pub fn send_event_report(&self, ceid: u32, reports: Vec<(u32, Vec<SecsItem>)>) {
        let reports = reports
            .into_iter()
            .map(|(rptid, values)| SecsItem::list([SecsItem::u4(rptid), SecsItem::List(values)]));
        let body = SecsItem::list([
            SecsItem::u4(0),
            SecsItem::u4(ceid),
            SecsItem::list(reports),
        ]);
        self.push(SecsMessage::new(6, 11, true, Some(body)));
    }

    /// Send an arbitrary primary to every open session.
    pub fn push(&self, message: SecsMessage) {
        let message =
            message.with_system_bytes(self.inner.system_bytes.fetch_add(1, Ordering::Relaxed));
        for session in self.live_sessions() {
            session.deliver(message.clone());
        }
    }

    /// Drop every open session as if the cable were pulled.
    pub fn drop_link(&self) {
        for session in self.live_sessions() {
            session.terminate();
        }
    }

    fn live_sessions(&self) -> Vec<Arc<SimSession>> {
        let mut sessions = lock(&self.inner.sessions);
        sessions.retain(|s| s.upgrade().is_some_and(|s| s.is_open()));
        sessions.iter().filter_map(Weak::upgrade).collect()
    }

    fn register(&self, session: &Arc<SimSession>) {
        lock(&self.inner.sessions).push(Arc::downgrade(session));
    }

    fn respond(&self, request: &SecsMessage) -> SecsMessage {
        let mut settings = lock(&self.inner.settings);
        let body = match (request.stream, request.function) {
            (1, 1) => Some(identity_item(&settings)),
            (1, 3) | (2, 13) => Some(SecsItem::list(
                requested_ids(request)
                    .into_iter()
                    .map(|id| {
                        settings
                            .variables
                            .get(&id)
                            .cloned()
                            .unwrap_or_else(SecsItem::empty_list)
                    }),
            )),
            (1, 13) => Some(SecsItem::list([
                SecsItem::binary(settings.commack),
                identity_item(&settings),
            ])),
            (2, 37) => {
                let (enable, ceids) = event_enable(request);
                let enabled = settings.enabled_events.get_or_insert_with(BTreeSet::new);
                for ceid in ceids {
                    if enable {
                        enabled.insert(ceid);
                    } else {
                        enabled.remove(&ceid);
                    }
                }
                Some(SecsItem::binary(0))
            }
            (2, 41) => {
                let rcmd = request
                    .body
                    .as_ref()
                    .and_then(SecsItem::as_list)
                    .and_then(|items| items.first())
                    .and_then(SecsItem::as_ascii)
                    .unwrap_or_default()
                    .to_owned();
                lock(&self.inner.commands).push(rcmd.clone());
                let code = settings.hcack;
                if hcack::is_accepted(code) {
                    if let Some((id, value)) = settings.command_effects.get(&rcmd).cloned() {
                        settings.variables.insert(id, value);
                    }
                }
                Some(SecsItem::list([SecsItem::binary(code), SecsItem::empty_list()]))
            }
            (5, 3) => {
                if let Some((aled, alid)) = alarm_enable(request) {
                    if aled & ALED_ENABLE == 0 {
                        settings.enabled_alarms.remove(&alid);
                    } else {
                        settings.enabled_alarms.insert(alid);
                    }
                }
                Some(SecsItem::binary(0))
            }
            (5, 5) => Some(SecsItem::list(settings.alarms.values().map(|a| {
                SecsItem::list([
                    SecsItem::binary(a.alcd),
                    SecsItem::u4(a.alid),
                    SecsItem::ascii(a.text.clone()),
                ])
            }))),
            // S9F5-style: unrecognized function, does not correlate.
            _ => {
                return SecsMessage::new(9, 5, false, None)
                    .with_system_bytes(request.system_bytes);
            }
        };
        request.reply_with(body)
    }
}

fn identity_item(settings: &Settings) -> SecsItem {
    SecsItem::list([
        SecsItem::ascii(settings.model.clone()),
        SecsItem::ascii(settings.software_revision.clone()),
    ])
}

fn requested_ids(request: &SecsMessage) -> Vec<u32> {
    request
        .body
        .as_ref()
        .and_then(SecsItem::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(|item| item.as_u64().and_then(|v| u32::try_from(v).ok()))
        .collect()
}

fn event_enable(request: &SecsMessage) -> (bool, Vec<u32>) {
    let Some([enable, ceids]) = request.body.as_ref().and_then(SecsItem::as_list) else {
        return (false, Vec::new());
    };
    let ceids = ceids
        .as_list()
        .unwrap_or_default()
        .iter()
        .filter_map(|c| c.as_u64().and_then(|v| u32::try_from(v).ok()))
        .collect();
    (enable.as_u64() == Some(1), ceids)
}

fn alarm_enable(request: &SecsMessage) -> Option<(u8, u32)> {
    let [aled, alid] = request.body.as_ref()?.as_list()? else {
        return None;
    };
    Some((
        u8::try_from(aled.as_u64()?).ok()?,
        u32::try_from(alid.as_u64()?).ok()?,
    ))
}

fn alarm_message(report: &AlarmReport) -> SecsMessage {
    SecsMessage::new(
        5,
        1,
        true,
        Some(SecsItem::list([
            SecsItem::binary(report.alcd),
            SecsItem::u4(report.alid),
            SecsItem::ascii(report.text.clone()),
        ])),
    )
}

// ── SimSession ──────────────────────────────────────────────────────

struct SimSession {
    me: Weak<SimSession>,
    equipment: SimulatedEquipment,
    counters: Arc<FactoryCounters>,
    phase: watch::Sender<TransportPhase>,
    primary_tx: Mutex<Option<mpsc::Sender<SecsMessage>>>,
    primary_rx: Mutex<Option<mpsc::Receiver<SecsMessage>>>,
    opened: AtomicBool,
    closed: AtomicBool,
}

impl SimSession {
    fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, message: SecsMessage) {
        if let Some(tx) = lock(&self.primary_tx).as_ref() {
            let _ = tx.try_send(message);
        }
    }

    /// Release the session. Runs at most once.
    fn terminate(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.primary_tx).take();
        self.phase.send_replace(TransportPhase::Disconnected);
        if self.opened.load(Ordering::SeqCst) {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ensure_selected(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !self.phase.borrow().is_selected() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

/// Counts one outstanding request; released even if the caller gives up.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecsSession for SimSession {
    async fn open(&self) -> Result<(), Error> {
        {
            let mut settings = lock(&self.equipment.inner.settings);
            if settings.failing_opens > 0 {
                settings.failing_opens -= 1;
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "simulated connection refused",
                )));
            }
        }
        if self.closed.load(Ordering::SeqCst) || self.opened.swap(true, Ordering::SeqCst) {
            return Err(Error::Session("session already used".into()));
        }

        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(open, Ordering::SeqCst);
        if let Some(me) = self.me.upgrade() {
            self.equipment.register(&me);
        }
        self.phase.send_replace(TransportPhase::Connected);

        let delay = lock(&self.equipment.inner.settings).select_delay;
        if delay.is_zero() {
            self.phase.send_replace(TransportPhase::Selected);
        } else {
            let session = self.me.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(session) = session.upgrade() {
                    if session.is_open() {
                        session.phase.send_replace(TransportPhase::Selected);
                    }
                }
            });
        }
        Ok(())
    }

    fn phase(&self) -> watch::Receiver<TransportPhase> {
        self.phase.subscribe()
    }

    async fn send_and_wait(
        &self,
        message: SecsMessage,
        timeout: Duration,
    ) -> Result<SecsMessage, Error> {
        self.ensure_selected()?;
        let inner = &self.equipment.inner;
        lock(&inner.received).push(message.clone());

        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&inner.in_flight);
        tokio::task::yield_now().await;

        let responding = lock(&inner.settings).responding;
        let result = if responding {
            Ok(self.equipment.respond(&message))
        } else {
            tokio::time::sleep(timeout).await;
            Err(Error::ReplyTimeout {
                stream: message.stream,
                function: message.function,
                system_bytes: message.system_bytes,
                timeout,
            })
        };
        result
    }

    async fn send(&self, message: SecsMessage) -> Result<(), Error> {
        self.ensure_selected()?;
        lock(&self.equipment.inner.received).push(message);
        Ok(())
    }

    async fn link_test(&self, timeout: Duration) -> Result<(), Error> {
        self.ensure_selected()?;
        if lock(&self.equipment.inner.settings).link_test_ok {
            Ok(())
        } else {
            tokio::time::sleep(timeout).await;
            Err(Error::LinkTestTimeout { timeout })
        }
    }

    fn take_primary_messages(&self) -> Option<mpsc::Receiver<SecsMessage>> {
        lock(&self.primary_rx).take()
    }

    async fn close(&self) {
        self.terminate();
    }
}

// ── SimulatedFactory ────────────────────────────────────────────────

#[derive(Default)]
struct FactoryCounters {
    created: AtomicUsize,
    open: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicUsize,
}

/// Session factory backed by simulated tools. Unknown endpoints refuse
/// the connection.
#[derive(Default)]
pub struct SimulatedFactory {
    tools: DashMap<Endpoint, SimulatedEquipment>,
    counters: Arc<FactoryCounters>,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a tool at `endpoint`, returning a handle to it.
    pub fn add(&self, endpoint: Endpoint, equipment: SimulatedEquipment) -> SimulatedEquipment {
        self.tools.insert(endpoint, equipment.clone());
        equipment
    }

    pub fn equipment(&self, endpoint: &Endpoint) -> Option<SimulatedEquipment> {
        self.tools.get(endpoint).map(|e| e.value().clone())
    }

    pub fn sessions_created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn peak_open_sessions(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for SimulatedFactory {
    async fn create(
        &self,
        endpoint: &Endpoint,
        _config: &HsmsConfig,
    ) -> Result<Arc<dyn SecsSession>, Error> {
        let equipment = self.equipment(endpoint).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("no equipment at {endpoint}"),
            ))
        })?;
        self.counters.created.fetch_add(1, Ordering::SeqCst);

        let (primary_tx, primary_rx) = mpsc::channel(PRIMARY_QUEUE_SIZE);
        let (phase, _) = watch::channel(TransportPhase::Disconnected);
        let session = Arc::new_cyclic(|me| SimSession {
            me: me.clone(),
            equipment,
            counters: Arc::clone(&self.counters),
            phase,
            primary_tx: Mutex::new(Some(primary_tx)),
            primary_rx: Mutex::new(Some(primary_rx)),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok(session)
    }
}
