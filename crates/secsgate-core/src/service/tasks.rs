// ── Background loops ──
//
// Each loop owns a strong service clone and a child token of the current
// run. Cancellation and the service's stopping flag both end them, and
// cancellation also abandons whatever exchange a tick has in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use secsgate_hsms::{ClientEvent, SecsMessage};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeviceService, ServiceState};

pub(super) type PrimaryStream = Pin<Box<dyn Stream<Item = Arc<SecsMessage>> + Send>>;

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn settle(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Drive `work` to completion unless cancelled first. `None` on
/// cancellation; the abandoned future is dropped.
pub(super) async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    work: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        output = work => Some(output),
    }
}

/// Mirror transport connectivity onto the aggregate.
pub(super) async fn watch_connection(
    service: DeviceService,
    mut events: broadcast::Receiver<ClientEvent>,
    cancel: CancellationToken,
) {
    let id = service.equipment_id();
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(equipment_id = %id, skipped, "connection watcher lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if service.is_stopping() {
            continue;
        }

        match event {
            ClientEvent::ConnectionChanged(state) if state.is_connected => {
                if service.equipment().is_connected() {
                    continue;
                }
                info!(equipment_id = %id, session = ?state.session_id, "device reconnected");
                let Some(reconciled) = until_cancelled(&cancel, service.reconcile_connection()).await else {
                    break;
                };
                if let Err(e) = reconciled {
                    warn!(equipment_id = %id, error = %e, "aggregate refused reconnection, retrying after state sync");
                }
                match until_cancelled(&cancel, service.sync_state()).await {
                    None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(equipment_id = %id, error = %e, "state sync after reconnect failed");
                    }
                }
            }
            ClientEvent::ConnectionChanged(state) => {
                let reason = state
                    .disconnect_reason
                    .clone()
                    .unwrap_or_else(|| "connection lost".into());
                if service.equipment().is_connected() {
                    warn!(equipment_id = %id, reason = %reason, "device connection lost");
                    service
                        .mutate(|eq, now| eq.disconnect(&reason, false, now))
                        .await;
                }
                if !service.settings().hsms.auto_reconnect {
                    service.set_state(ServiceState::Faulted);
                }
            }
            ClientEvent::ReplyTimeout {
                stream,
                function,
                system_bytes,
            } => {
                warn!(equipment_id = %id, stream, function, system_bytes, "reply timeout");
            }
            ClientEvent::HeartbeatFailed { consecutive } => {
                warn!(equipment_id = %id, consecutive, "link test failed");
            }
            ClientEvent::Reconnecting { attempt, delay } => {
                debug!(equipment_id = %id, attempt, delay_ms = delay.as_millis(), "reconnecting");
            }
        }
    }
}

/// Periodic state sync.
pub(super) async fn state_sync_task(
    service: DeviceService,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if service.is_stopping() || !service.is_connected() {
                    continue;
                }
                match until_cancelled(&cancel, service.sync_state()).await {
                    None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(equipment_id = %service.equipment_id(), error = %e, "periodic state sync failed");
                    }
                }
            }
        }
    }
}

/// Time out overdue commands.
pub(super) async fn command_sweep_task(
    service: DeviceService,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if service.is_stopping() {
                    continue;
                }
                let expired = service.mutate(|eq, now| eq.expire_commands(now)).await;
                if expired > 0 {
                    warn!(equipment_id = %service.equipment_id(), expired, "remote commands timed out");
                }
            }
        }
    }
}

/// Enable event reports once, then poll data variables.
pub(super) async fn data_collection_task(service: DeviceService, cancel: CancellationToken) {
    let id = service.equipment_id();
    let settings = service.settings().data_collection.clone();
    if !settle(&cancel, service.settings().settle_delay).await {
        return;
    }

    match until_cancelled(&cancel, service.enable_event_reports()).await {
        None => return,
        Some(Ok(())) => {}
        Some(Err(e)) => warn!(equipment_id = %id, error = %e, "enabling event reports failed"),
    }
    if settings.variable_ids.is_empty() {
        debug!(equipment_id = %id, "no data variables configured, polling disabled");
        return;
    }

    let mut interval = tokio::time::interval(settings.interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if service.is_stopping() || !service.is_connected() {
                    continue;
                }
                match until_cancelled(&cancel, service.collect_data()).await {
                    None => break,
                    Some(Ok(Some(trace))) => {
                        debug!(equipment_id = %id, values = trace.values.len(), "data collected");
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => warn!(equipment_id = %id, error = %e, "data collection failed"),
                }
            }
        }
    }
}

/// Enable configured alarms once, then reconcile periodically.
pub(super) async fn alarm_task(service: DeviceService, cancel: CancellationToken) {
    let id = service.equipment_id();
    let period = service.settings().alarms.sync_interval;
    if !settle(&cancel, service.settings().settle_delay).await {
        return;
    }

    match until_cancelled(&cancel, service.enable_alarms()).await {
        None => return,
        Some(Ok(accepted)) => debug!(equipment_id = %id, accepted, "alarm reports enabled"),
        Some(Err(e)) => warn!(equipment_id = %id, error = %e, "enabling alarm reports failed"),
    }

    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if service.is_stopping() || !service.is_connected() {
                    continue;
                }
                match until_cancelled(&cancel, service.sync_alarms()).await {
                    None => break,
                    Some(Ok(0)) => {}
                    Some(Ok(changes)) => info!(equipment_id = %id, changes, "alarms reconciled"),
                    Some(Err(e)) => warn!(equipment_id = %id, error = %e, "alarm sync failed"),
                }
            }
        }
    }
}
