// ── Standard SECS-II exchanges ──
//
// Builders for the primaries the gateway sends and parsers for the replies
// and device-initiated primaries it consumes. Only the subset needed for
// identification, state sync, data collection, alarms, and remote control
// is modelled.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::{SecsItem, SecsMessage};

/// S1F14 COMMACK value meaning "accepted".
pub const COMMACK_ACCEPTED: u8 = 0;
/// S5F3 ALED value enabling an alarm report.
pub const ALED_ENABLE: u8 = 0x80;
/// S5F3 ALED value disabling an alarm report.
pub const ALED_DISABLE: u8 = 0x00;
/// ALCD bit set while the alarm condition is present.
pub const ALCD_SET_BIT: u8 = 0x80;

/// S2F42 host command acknowledge codes.
pub mod hcack {
    pub const OK: u8 = 0;
    pub const INVALID_COMMAND: u8 = 1;
    pub const CANNOT_PERFORM_NOW: u8 = 2;
    pub const PARAMETER_INVALID: u8 = 3;
    pub const ACCEPTED_LATER: u8 = 4;
    pub const ALREADY_IN_CONDITION: u8 = 5;
    pub const NO_SUCH_OBJECT: u8 = 6;

    /// Human-readable meaning of an HCACK value.
    pub fn describe(code: u8) -> &'static str {
        match code {
            OK => "acknowledged, command performed",
            INVALID_COMMAND => "command does not exist",
            CANNOT_PERFORM_NOW => "cannot perform now",
            PARAMETER_INVALID => "at least one parameter is invalid",
            ACCEPTED_LATER => "acknowledged, completion signalled later",
            ALREADY_IN_CONDITION => "rejected, already in desired condition",
            NO_SUCH_OBJECT => "no such object exists",
            _ => "unknown acknowledge code",
        }
    }

    /// Codes that mean the equipment accepted the command.
    pub fn is_accepted(code: u8) -> bool {
        matches!(code, OK | ACCEPTED_LATER)
    }
}

// ── Parsed payloads ─────────────────────────────────────────────────

/// Model name and software revision reported by S1F2 / S1F14.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineIdentity {
    pub model: String,
    pub software_revision: String,
}

/// S2F42 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommandAck {
    pub hcack: u8,
    /// Per-parameter rejections (`CPNAME`, `CPACK`).
    pub parameter_errors: Vec<(String, u8)>,
}

/// S5F1 alarm report (also the element shape of S5F6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmReport {
    pub alcd: u8,
    pub alid: u32,
    pub text: String,
}

impl AlarmReport {
    /// Alarm condition is present (bit 8 of ALCD).
    pub fn is_set(&self) -> bool {
        self.alcd & ALCD_SET_BIT != 0
    }

    /// Alarm category code (ALCD bits 1–7).
    pub fn category(&self) -> u8 {
        self.alcd & !ALCD_SET_BIT
    }
}

/// One report inside an S6F11 event report.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub rptid: u32,
    pub values: Vec<SecsItem>,
}

/// S6F11 event report.
#[derive(Debug, Clone, PartialEq)]
pub struct EventReport {
    pub dataid: u32,
    pub ceid: u32,
    pub reports: Vec<Report>,
}

// ── Builders ────────────────────────────────────────────────────────

/// S1F1 W: Are You There.
pub fn are_you_there() -> SecsMessage {
    SecsMessage::new(1, 1, true, None)
}

/// S1F2 for a device-initiated S1F1. Hosts answer with an empty list.
pub fn on_line_data_reply(primary: &SecsMessage) -> SecsMessage {
    primary.reply_with(Some(SecsItem::empty_list()))
}

/// S1F3 W: Selected Equipment Status Request.
pub fn status_variable_request(svids: &[u32]) -> SecsMessage {
    SecsMessage::new(
        1,
        3,
        true,
        Some(SecsItem::list(svids.iter().map(|&id| SecsItem::u4(id)))),
    )
}

/// S1F13 W: Establish Communications Request (host side: empty list).
pub fn establish_communication_request() -> SecsMessage {
    SecsMessage::new(1, 13, true, Some(SecsItem::empty_list()))
}

/// S1F14 for a device-initiated S1F13.
pub fn establish_communication_ack(primary: &SecsMessage, commack: u8) -> SecsMessage {
    primary.reply_with(Some(SecsItem::list([
        SecsItem::binary(commack),
        SecsItem::empty_list(),
    ])))
}

/// S2F13 W: Equipment Constant / data variable request.
pub fn data_variable_request(ids: &[u32]) -> SecsMessage {
    SecsMessage::new(
        2,
        13,
        true,
        Some(SecsItem::list(ids.iter().map(|&id| SecsItem::u4(id)))),
    )
}

/// S2F37 W: Enable/Disable Event Report. Empty `ceids` means all events.
pub fn enable_event_reports(enable: bool, ceids: &[u32]) -> SecsMessage {
    SecsMessage::new(
        2,
        37,
        true,
        Some(SecsItem::list([
            SecsItem::boolean(enable),
            SecsItem::list(ceids.iter().map(|&id| SecsItem::u4(id))),
        ])),
    )
}

/// S2F41 W: Host Command Send.
pub fn host_command(rcmd: &str, params: &[(String, SecsItem)]) -> SecsMessage {
    let params = params.iter().map(|(name, value)| {
        SecsItem::list([SecsItem::ascii(name.clone()), value.clone()])
    });
    SecsMessage::new(
        2,
        41,
        true,
        Some(SecsItem::list([
            SecsItem::ascii(rcmd),
            SecsItem::list(params),
        ])),
    )
}

/// S5F3 W: Enable/Disable Alarm Send.
pub fn alarm_enable(enable: bool, alid: u32) -> SecsMessage {
    let aled = if enable { ALED_ENABLE } else { ALED_DISABLE };
    SecsMessage::new(
        5,
        3,
        true,
        Some(SecsItem::list([SecsItem::binary(aled), SecsItem::u4(alid)])),
    )
}

/// S5F5 W: List Alarms Request. Empty `alids` means all alarms.
pub fn list_alarms_request(alids: &[u32]) -> SecsMessage {
    SecsMessage::new(5, 5, true, Some(SecsItem::U4(alids.to_vec())))
}

/// S5F2 acknowledging an S5F1.
pub fn alarm_report_ack(primary: &SecsMessage, ackc5: u8) -> SecsMessage {
    primary.reply_with(Some(SecsItem::binary(ackc5)))
}

/// S6F12 acknowledging an S6F11.
pub fn event_report_ack(primary: &SecsMessage, ackc6: u8) -> SecsMessage {
    primary.reply_with(Some(SecsItem::binary(ackc6)))
}

// ── Parsers ─────────────────────────────────────────────────────────

fn body<'a>(
    msg: &'a SecsMessage,
    stream: u8,
    function: u8,
    name: &'static str,
) -> Result<&'a SecsItem, Error> {
    if msg.stream != stream || msg.function != function {
        return Err(Error::UnexpectedReply {
            expected: name.into(),
            got: msg.label(),
        });
    }
    msg.body.as_ref().ok_or_else(|| Error::Malformed {
        message: name,
        reason: "missing body".into(),
    })
}

fn list<'a>(item: &'a SecsItem, len: usize, name: &'static str) -> Result<&'a [SecsItem], Error> {
    match item.as_list() {
        Some(items) if items.len() == len => Ok(items),
        Some(items) => Err(Error::Malformed {
            message: name,
            reason: format!("expected list of {len}, got {}", items.len()),
        }),
        None => Err(Error::Malformed {
            message: name,
            reason: "expected list".into(),
        }),
    }
}

fn code(item: &SecsItem, name: &'static str) -> Result<u8, Error> {
    item.as_u64()
        .and_then(|c| u8::try_from(c).ok())
        .ok_or_else(|| Error::Malformed {
            message: name,
            reason: "expected single-byte acknowledge code".into(),
        })
}

fn id(item: &SecsItem, name: &'static str) -> Result<u32, Error> {
    item.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::Malformed {
            message: name,
            reason: "expected unsigned identifier".into(),
        })
}

fn identity_from(item: &SecsItem, name: &'static str) -> Result<OnlineIdentity, Error> {
    match item.as_list() {
        // Hosts and some tools send an empty list.
        Some([]) => Ok(OnlineIdentity::default()),
        Some([model, revision]) => Ok(OnlineIdentity {
            model: model.as_ascii().unwrap_or_default().trim().to_owned(),
            software_revision: revision.as_ascii().unwrap_or_default().trim().to_owned(),
        }),
        _ => Err(Error::Malformed {
            message: name,
            reason: "expected <L[2] MDLN SOFTREV>".into(),
        }),
    }
}

/// S1F2 On Line Data.
pub fn parse_on_line_data(reply: &SecsMessage) -> Result<OnlineIdentity, Error> {
    identity_from(body(reply, 1, 2, "S1F2")?, "S1F2")
}

/// S1F14: returns COMMACK and the reported identity.
pub fn parse_establish_communication_ack(
    reply: &SecsMessage,
) -> Result<(u8, OnlineIdentity), Error> {
    let items = list(body(reply, 1, 14, "S1F14")?, 2, "S1F14")?;
    let commack = code(&items[0], "S1F14")?;
    let identity = identity_from(&items[1], "S1F14")?;
    Ok((commack, identity))
}

/// S1F4 status variable values, in request order.
pub fn parse_status_values(reply: &SecsMessage) -> Result<Vec<SecsItem>, Error> {
    values_of(body(reply, 1, 4, "S1F4")?, "S1F4")
}

/// S2F14 data variable values, in request order.
pub fn parse_data_values(reply: &SecsMessage) -> Result<Vec<SecsItem>, Error> {
    values_of(body(reply, 2, 14, "S2F14")?, "S2F14")
}

fn values_of(item: &SecsItem, name: &'static str) -> Result<Vec<SecsItem>, Error> {
    item.as_list().map(<[SecsItem]>::to_vec).ok_or_else(|| Error::Malformed {
        message: name,
        reason: "expected list of values".into(),
    })
}

/// Single acknowledge code replies: S2F38 ERACK, S5F4 ACKC5, S5F2, S6F12.
pub fn parse_ack(
    reply: &SecsMessage,
    stream: u8,
    function: u8,
    name: &'static str,
) -> Result<u8, Error> {
    code(body(reply, stream, function, name)?, name)
}

/// S2F42 Host Command Acknowledge.
pub fn parse_host_command_ack(reply: &SecsMessage) -> Result<HostCommandAck, Error> {
    let items = list(body(reply, 2, 42, "S2F42")?, 2, "S2F42")?;
    let hcack = code(&items[0], "S2F42")?;
    let parameter_errors = items[1]
        .as_list()
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| match entry.as_list() {
            Some([name, ack]) => Some((
                name.as_ascii().unwrap_or_default().to_owned(),
                ack.as_u64().and_then(|c| u8::try_from(c).ok()).unwrap_or(u8::MAX),
            )),
            _ => None,
        })
        .collect();
    Ok(HostCommandAck {
        hcack,
        parameter_errors,
    })
}

fn alarm_from(item: &SecsItem, name: &'static str) -> Result<AlarmReport, Error> {
    let items = list(item, 3, name)?;
    Ok(AlarmReport {
        alcd: code(&items[0], name)?,
        alid: id(&items[1], name)?,
        text: items[2].as_ascii().unwrap_or_default().trim().to_owned(),
    })
}

/// S5F1 Alarm Report Send.
pub fn parse_alarm_report(msg: &SecsMessage) -> Result<AlarmReport, Error> {
    alarm_from(body(msg, 5, 1, "S5F1")?, "S5F1")
}

/// S5F6 List Alarm Data.
pub fn parse_alarm_list(reply: &SecsMessage) -> Result<Vec<AlarmReport>, Error> {
    let item = body(reply, 5, 6, "S5F6")?;
    item.as_list()
        .ok_or_else(|| Error::Malformed {
            message: "S5F6",
            reason: "expected list of alarms".into(),
        })?
        .iter()
        .map(|entry| alarm_from(entry, "S5F6"))
        .collect()
}

/// S6F11 Event Report Send.
pub fn parse_event_report(msg: &SecsMessage) -> Result<EventReport, Error> {
    let items = list(body(msg, 6, 11, "S6F11")?, 3, "S6F11")?;
    let dataid = id(&items[0], "S6F11")?;
    let ceid = id(&items[1], "S6F11")?;
    let reports = items[2]
        .as_list()
        .ok_or_else(|| Error::Malformed {
            message: "S6F11",
            reason: "expected report list".into(),
        })?
        .iter()
        .map(|entry| {
            let pair = list(entry, 2, "S6F11")?;
            Ok(Report {
                rptid: id(&pair[0], "S6F11")?,
                values: pair[1].as_list().map(<[SecsItem]>::to_vec).unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    Ok(EventReport {
        dataid,
        ceid,
        reports,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn establish_communication_ack_parses_identity() {
        let request = establish_communication_request().with_system_bytes(9);
        let reply = request.reply_with(Some(SecsItem::list([
            SecsItem::binary(0),
            SecsItem::list([SecsItem::ascii("ETCH-3000 "), SecsItem::ascii("v2.1")]),
        ])));
        let (commack, identity) = parse_establish_communication_ack(&reply).unwrap();
        assert_eq!(commack, COMMACK_ACCEPTED);
        assert_eq!(identity.model, "ETCH-3000");
        assert_eq!(identity.software_revision, "v2.1");
    }

    #[test]
    fn parser_rejects_wrong_function() {
        let msg = SecsMessage::new(1, 4, false, Some(SecsItem::empty_list()));
        assert!(matches!(
            parse_establish_communication_ack(&msg),
            Err(Error::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn host_command_round_trip_shape() {
        let msg = host_command("START", &[("LOTID".into(), SecsItem::ascii("L-1"))]);
        let items = msg.body.as_ref().unwrap().as_list().unwrap();
        assert_eq!(items[0].as_ascii(), Some("START"));
        assert_eq!(items[1].len(), 1);

        let reply = msg.reply_with(Some(SecsItem::list([
            SecsItem::binary(hcack::PARAMETER_INVALID),
            SecsItem::list([SecsItem::list([
                SecsItem::ascii("LOTID"),
                SecsItem::binary(2),
            ])]),
        ])));
        let ack = parse_host_command_ack(&reply).unwrap();
        assert_eq!(ack.hcack, 3);
        assert_eq!(ack.parameter_errors, vec![("LOTID".to_owned(), 2)]);
        assert!(!hcack::is_accepted(ack.hcack));
        assert!(hcack::is_accepted(hcack::ACCEPTED_LATER));
    }

    #[test]
    fn alarm_report_set_and_category() {
        let msg = SecsMessage::new(
            5,
            1,
            true,
            Some(SecsItem::list([
                SecsItem::binary(0x80 | 4),
                SecsItem::u4(5),
                SecsItem::ascii("Door Open"),
            ])),
        );
        let report = parse_alarm_report(&msg).unwrap();
        assert!(report.is_set());
        assert_eq!(report.category(), 4);
        assert_eq!(report.alid, 5);
        assert_eq!(report.text, "Door Open");
    }

    #[test]
    fn event_report_parses_nested_reports() {
        let msg = SecsMessage::new(
            6,
            11,
            true,
            Some(SecsItem::list([
                SecsItem::u4(1),
                SecsItem::u4(4000),
                SecsItem::list([SecsItem::list([
                    SecsItem::u4(10),
                    SecsItem::list([SecsItem::f8(1.5), SecsItem::ascii("RUN")]),
                ])]),
            ])),
        );
        let report = parse_event_report(&msg).unwrap();
        assert_eq!(report.ceid, 4000);
        assert_eq!(report.reports.len(), 1);
        assert_eq!(report.reports[0].rptid, 10);
        assert_eq!(report.reports[0].values.len(), 2);
    }

    #[test]
    fn alarm_list_parses_all_entries() {
        let reply = list_alarms_request(&[]).with_system_bytes(3).reply_with(Some(
            SecsItem::list([
                SecsItem::list([SecsItem::binary(0x85), SecsItem::u4(1), SecsItem::ascii("A")]),
                SecsItem::list([SecsItem::binary(0x05), SecsItem::u4(2), SecsItem::ascii("B")]),
            ]),
        ));
        let alarms = parse_alarm_list(&reply).unwrap();
        assert_eq!(alarms.len(), 2);
        assert!(alarms[0].is_set());
        assert!(!alarms[1].is_set());
    }
}
