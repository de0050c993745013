// ── Primary message routing ──
//
// Device-initiated primaries are acknowledged first, then applied to the
// aggregate. Unhandled streams are logged and dropped.

use futures_util::StreamExt;
use secsgate_hsms::SecsMessage;
use secsgate_hsms::standard::{self, COMMACK_ACCEPTED};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::DeviceService;
use super::tasks::PrimaryStream;

/// ACKC5 / ACKC6 "accepted".
const ACK_ACCEPTED: u8 = 0;
/// ACKC5 / ACKC6 "error, not accepted".
const ACK_REJECTED: u8 = 1;

pub(super) async fn route_messages(
    service: DeviceService,
    mut primaries: PrimaryStream,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = primaries.next() => message,
        };
        let Some(message) = message else { break };
        if service.is_stopping() {
            continue;
        }
        if super::tasks::until_cancelled(&cancel, handle_primary(&service, &message))
            .await
            .is_none()
        {
            break;
        }
    }
}

pub(super) async fn handle_primary(service: &DeviceService, message: &SecsMessage) {
    let id = service.equipment_id();
    let client = service.client();

    let reply = match (message.stream, message.function) {
        (5, 1) => match standard::parse_alarm_report(message) {
            Ok(report) => {
                let ack = client
                    .send(standard::alarm_report_ack(message, ACK_ACCEPTED))
                    .await;
                service.apply_alarm_report(&report).await;
                ack
            }
            Err(e) => {
                warn!(equipment_id = %id, error = %e, "malformed alarm report");
                client
                    .send(standard::alarm_report_ack(message, ACK_REJECTED))
                    .await
            }
        },
        (6, 11) => match standard::parse_event_report(message) {
            Ok(report) => {
                let ack = client
                    .send(standard::event_report_ack(message, ACK_ACCEPTED))
                    .await;
                debug!(equipment_id = %id, ceid = report.ceid, reports = report.reports.len(), "event report");
                service.apply_event_report(&report).await;
                ack
            }
            Err(e) => {
                warn!(equipment_id = %id, error = %e, "malformed event report");
                client
                    .send(standard::event_report_ack(message, ACK_REJECTED))
                    .await
            }
        },
        (1, 1) => client.send(standard::on_line_data_reply(message)).await,
        (1, 13) => {
            client
                .send(standard::establish_communication_ack(message, COMMACK_ACCEPTED))
                .await
        }
        (1 | 2, _) => {
            debug!(equipment_id = %id, message = %message.label(), "status primary, resyncing state");
            if let Err(e) = service.sync_state().await {
                warn!(equipment_id = %id, error = %e, "state sync on device primary failed");
            }
            return;
        }
        _ => {
            debug!(equipment_id = %id, message = %message.label(), "unhandled primary");
            return;
        }
    };

    if let Err(e) = reply {
        warn!(equipment_id = %id, message = %message.label(), error = %e, "reply to device primary failed");
    }
}
