// ── Equipment aggregate ──
//
// One physical tool: operating state machine, active alarms, the recent
// trace window, and command history. Every mutation stamps `updated_at`,
// bumps `version`, and buffers domain events for the orchestration layer
// to drain with `take_events`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secsgate_hsms::{ConnectionState, Endpoint, RetryPolicy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::alarm::{AlarmEvent, AlarmSeverity};
use super::command::{CommandStatus, RemoteCommand, command_allowed};
use super::equipment_id::EquipmentId;
use super::event::DomainEvent;
use super::metadata::MachineMetadata;
use super::ring::BoundedRing;
use super::state::{EquipmentState, HealthStatus};
use super::status::DeviceStatus;
use super::trace::TraceData;
use crate::error::CoreError;

pub const TRACE_CAPACITY: usize = 100;
pub const COMMAND_HISTORY_CAPACITY: usize = 50;

const SYSTEM_ACTOR: &str = "system";
const ATTENTION_REASON: &str = "equipment in attention state";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Equipment {
    id: EquipmentId,
    name: String,
    description: Option<String>,
    endpoint: Endpoint,

    state: EquipmentState,
    sub_state: Option<String>,
    state_changed_at: Option<DateTime<Utc>>,
    state_changed_by: Option<String>,
    state_reason: Option<String>,

    connection: ConnectionState,
    health: HealthStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    last_data_update: Option<DateTime<Utc>>,

    active_alarms: BTreeMap<u32, AlarmEvent>,
    trace: BoundedRing<TraceData>,
    commands: BoundedRing<RemoteCommand>,

    metadata: Option<MachineMetadata>,
    config_valid: bool,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,

    #[serde(skip)]
    pending_events: Vec<DomainEvent>,
}

impl Equipment {
    /// Create the aggregate for a newly configured tool.
    pub fn register(
        id: EquipmentId,
        name: impl Into<String>,
        endpoint: Endpoint,
        now: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        let mut equipment = Self {
            id: id.clone(),
            name: name.clone(),
            description: None,
            endpoint,
            state: EquipmentState::Unknown,
            sub_state: None,
            state_changed_at: None,
            state_changed_by: None,
            state_reason: None,
            connection: ConnectionState::new(RetryPolicy::default().max_retries),
            health: HealthStatus::Unknown,
            last_heartbeat: None,
            last_data_update: None,
            active_alarms: BTreeMap::new(),
            trace: BoundedRing::new(TRACE_CAPACITY),
            commands: BoundedRing::new(COMMAND_HISTORY_CAPACITY),
            metadata: None,
            config_valid: true,
            created_at: now,
            updated_at: now,
            version: 0,
            pending_events: Vec::new(),
        };
        equipment.pending_events.push(DomainEvent::Registered {
            equipment_id: id,
            name,
            endpoint: endpoint.to_string(),
            at: now,
        });
        equipment
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> &EquipmentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn state(&self) -> EquipmentState {
        self.state
    }

    pub fn sub_state(&self) -> Option<&str> {
        self.sub_state.as_deref()
    }

    pub fn state_changed_at(&self) -> Option<DateTime<Utc>> {
        self.state_changed_at
    }

    pub fn state_changed_by(&self) -> Option<&str> {
        self.state_changed_by.as_deref()
    }

    pub fn state_reason(&self) -> Option<&str> {
        self.state_reason.as_deref()
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected
    }

    pub fn health(&self) -> HealthStatus {
        self.health
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    pub fn last_data_update(&self) -> Option<DateTime<Utc>> {
        self.last_data_update
    }

    /// Active alarms ordered by alarm id.
    pub fn active_alarms(&self) -> impl ExactSizeIterator<Item = &AlarmEvent> {
        self.active_alarms.values()
    }

    pub fn active_alarm(&self, alarm_id: u32) -> Option<&AlarmEvent> {
        self.active_alarms.get(&alarm_id)
    }

    pub fn has_major_alarm(&self) -> bool {
        self.active_alarms
            .values()
            .any(|a| a.severity.is_major_or_worse())
    }

    pub fn highest_severity(&self) -> Option<AlarmSeverity> {
        self.active_alarms.values().map(|a| a.severity).max()
    }

    /// Trace window, oldest first.
    pub fn recent_trace(&self) -> impl DoubleEndedIterator<Item = &TraceData> + ExactSizeIterator {
        self.trace.iter()
    }

    /// Command history, oldest first.
    pub fn command_history(
        &self,
    ) -> impl DoubleEndedIterator<Item = &RemoteCommand> + ExactSizeIterator {
        self.commands.iter()
    }

    pub fn command(&self, id: Uuid) -> Option<&RemoteCommand> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn metadata(&self) -> Option<&MachineMetadata> {
        self.metadata.as_ref()
    }

    pub fn config_valid(&self) -> bool {
        self.config_valid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Events buffered since the last `take_events`.
    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.pending_events
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }

    pub fn status(&self, now: DateTime<Utc>) -> DeviceStatus {
        DeviceStatus {
            equipment_id: self.id.clone(),
            state: self.state,
            health: self.health,
            connected: self.connection.is_connected,
            quality: self.connection.quality(now),
            active_alarms: self.active_alarms.len(),
            highest_severity: self.highest_severity(),
            pending_commands: self
                .commands
                .iter()
                .filter(|c| !c.is_finished())
                .count(),
            last_heartbeat: self.last_heartbeat,
            last_data_update: self.last_data_update,
            version: self.version,
            captured_at: now,
        }
    }

    // ── State machine ────────────────────────────────────────────────

    /// Move to `new_state` through the transition table.
    ///
    /// A same-state update is a no-op. A rejected transition leaves the
    /// aggregate untouched.
    pub fn update_state(
        &mut self,
        new_state: EquipmentState,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if new_state == self.state {
            return Ok(());
        }
        if !self.state.can_transition_to(new_state) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }
        self.apply_state(new_state, actor, reason, now);
        Ok(())
    }

    /// Free-form detail under the operating state. Stamps the aggregate but
    /// publishes nothing; the owning `StateChanged` event already went out.
    pub fn set_sub_state(&mut self, sub_state: Option<String>, now: DateTime<Utc>) {
        if self.sub_state != sub_state {
            self.sub_state = sub_state;
            self.touch(now);
        }
    }

    /// Unconditional transition used by the rules that override the table
    /// (alarm escalation, unexpected disconnect).
    fn apply_state(
        &mut self,
        new_state: EquipmentState,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let from = self.state;
        self.state = new_state;
        self.state_changed_at = Some(now);
        self.state_changed_by = Some(actor.to_owned());
        self.state_reason = Some(reason.to_owned());
        self.touch(now);
        self.rederive_health();
        self.pending_events.push(DomainEvent::StateChanged {
            equipment_id: self.id.clone(),
            from,
            to: new_state,
            actor: actor.to_owned(),
            reason: reason.to_owned(),
            at: now,
        });

        if new_state.requires_attention() {
            let cancelled = self.cancel_pending(ATTENTION_REASON, now);
            self.pending_events.push(DomainEvent::AttentionRequired {
                equipment_id: self.id.clone(),
                state: new_state,
                reason: reason.to_owned(),
                cancelled_commands: cancelled,
                at: now,
            });
        }
    }

    fn cancel_pending(&mut self, reason: &str, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for command in self.commands.iter_mut() {
            if command.status == CommandStatus::Pending {
                command.status = CommandStatus::Cancelled;
                command.result_message = Some(reason.to_owned());
                command.completed_at = Some(now);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn rederive_health(&mut self) {
        self.health = HealthStatus::derive(
            self.state,
            self.connection.is_connected,
            self.has_major_alarm(),
        );
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }

    // ── Connectivity ─────────────────────────────────────────────────

    pub fn connect(&mut self, session_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.connection.is_connected {
            return Err(CoreError::AlreadyConnected {
                id: self.id.to_string(),
            });
        }
        if self.state == EquipmentState::Maintenance {
            return Err(CoreError::ConnectRejected {
                reason: "equipment is in maintenance".into(),
            });
        }
        if !self.config_valid {
            return Err(CoreError::ConnectRejected {
                reason: "equipment configuration is invalid".into(),
            });
        }

        self.connection = self.connection.connect(session_id, now);
        self.touch(now);
        self.pending_events.push(DomainEvent::Connected {
            equipment_id: self.id.clone(),
            session_id: session_id.to_owned(),
            at: now,
        });

        if self.state == EquipmentState::Unknown {
            self.apply_state(EquipmentState::Idle, SYSTEM_ACTOR, "first connection", now);
        } else {
            self.rederive_health();
        }
        Ok(())
    }

    /// Idempotent. An unexpected drop while EXECUTING faults the tool.
    pub fn disconnect(&mut self, reason: &str, expected: bool, now: DateTime<Utc>) {
        if !self.connection.is_connected {
            return;
        }
        self.connection = self.connection.disconnect(reason, now);
        self.touch(now);
        self.pending_events.push(DomainEvent::Disconnected {
            equipment_id: self.id.clone(),
            reason: reason.to_owned(),
            expected,
            at: now,
        });

        if !expected && self.state == EquipmentState::Executing {
            let why = format!("unexpected disconnect while executing: {reason}");
            self.apply_state(EquipmentState::Fault, SYSTEM_ACTOR, &why, now);
        } else {
            self.rederive_health();
        }
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
        if self.connection.is_connected {
            self.connection = self.connection.update_heartbeat(now);
        }
        self.touch(now);
    }

    // ── Alarms ───────────────────────────────────────────────────────

    /// Returns `false` if an alarm with the same id is already active.
    pub fn add_alarm(&mut self, alarm: AlarmEvent, now: DateTime<Utc>) -> bool {
        if self.active_alarms.contains_key(&alarm.alarm_id) {
            return false;
        }
        let escalate = alarm.severity.is_major_or_worse()
            && !matches!(self.state, EquipmentState::Fault | EquipmentState::Alarm);
        let reason = format!("alarm {} set: {}", alarm.alarm_id, alarm.text);

        self.active_alarms.insert(alarm.alarm_id, alarm.clone());
        self.touch(now);
        self.pending_events.push(DomainEvent::AlarmTriggered {
            equipment_id: self.id.clone(),
            alarm,
            at: now,
        });

        if escalate {
            self.apply_state(EquipmentState::Alarm, SYSTEM_ACTOR, &reason, now);
        } else {
            self.rederive_health();
        }
        true
    }

    /// Remove an active alarm, returning the cleared copy. Unknown ids are
    /// a no-op.
    pub fn clear_alarm(&mut self, alarm_id: u32, now: DateTime<Utc>) -> Option<AlarmEvent> {
        let mut cleared = self.active_alarms.remove(&alarm_id)?;
        cleared.cleared_at = Some(now);
        self.touch(now);
        self.pending_events.push(DomainEvent::AlarmCleared {
            equipment_id: self.id.clone(),
            alarm: cleared.clone(),
            at: now,
        });

        if self.state == EquipmentState::Alarm && !self.has_major_alarm() {
            let reason = format!("alarm {alarm_id} cleared");
            self.apply_state(EquipmentState::Idle, SYSTEM_ACTOR, &reason, now);
        } else {
            self.rederive_health();
        }
        Some(cleared)
    }

    /// Returns `Ok(false)` if the alarm was already acknowledged.
    pub fn acknowledge_alarm(
        &mut self,
        alarm_id: u32,
        by: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let alarm = self
            .active_alarms
            .get_mut(&alarm_id)
            .ok_or_else(|| CoreError::NotFound {
                entity_type: "alarm",
                identifier: alarm_id.to_string(),
            })?;
        if alarm.is_acknowledged() {
            return Ok(false);
        }
        alarm.acknowledged_at = Some(now);
        alarm.acknowledged_by = Some(by.to_owned());
        self.touch(now);
        self.pending_events.push(DomainEvent::AlarmAcknowledged {
            equipment_id: self.id.clone(),
            alarm_id,
            by: by.to_owned(),
            at: now,
        });
        Ok(true)
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn can_execute_command(&self, name: &str) -> bool {
        command_allowed(name, self.state)
    }

    /// Record a command as Pending. Rejected commands leave no history.
    pub fn execute_remote_command(
        &mut self,
        name: &str,
        parameters: serde_json::Value,
        requested_by: &str,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<RemoteCommand, CoreError> {
        if !self.can_execute_command(name) {
            return Err(CoreError::CommandNotAllowed {
                command: name.to_owned(),
                state: self.state,
            });
        }
        let command = RemoteCommand::new(name, parameters, requested_by, timeout, now);
        self.commands.push(command.clone());
        self.touch(now);
        self.pending_events.push(DomainEvent::CommandRequested {
            equipment_id: self.id.clone(),
            command_id: command.id,
            name: command.name.clone(),
            requested_by: command.requested_by.clone(),
            at: now,
        });
        Ok(command)
    }

    /// Advance a command. Terminal statuses are applied at most once.
    pub fn update_command_status(
        &mut self,
        id: Uuid,
        status: CommandStatus,
        message: Option<String>,
        data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<RemoteCommand, CoreError> {
        let command = self
            .commands
            .find_mut(|c| c.id == id)
            .ok_or_else(|| CoreError::NotFound {
                entity_type: "command",
                identifier: id.to_string(),
            })?;
        if command.is_finished() {
            return Err(CoreError::CommandAlreadyFinished { id: id.to_string() });
        }
        if status == CommandStatus::Pending {
            return Err(CoreError::validation(
                "command status",
                "cannot return a command to Pending",
            ));
        }

        command.status = status;
        if status.is_terminal() {
            command.result_message = message;
            command.result_data = data;
            command.completed_at = Some(now);
        }
        let updated = command.clone();

        self.touch(now);
        if status.is_terminal() {
            self.pending_events.push(DomainEvent::CommandCompleted {
                equipment_id: self.id.clone(),
                command_id: id,
                name: updated.name.clone(),
                status,
                message: updated.result_message.clone(),
                at: now,
            });
        }
        Ok(updated)
    }

    /// Time out every unfinished command past its deadline.
    pub fn expire_commands(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for command in self.commands.iter_mut() {
            if command.is_overdue(now) {
                command.status = CommandStatus::Timeout;
                command.result_message = Some("timed out".into());
                command.completed_at = Some(now);
                expired.push((command.id, command.name.clone()));
            }
        }
        if expired.is_empty() {
            return 0;
        }
        self.touch(now);
        let count = expired.len();
        for (command_id, name) in expired {
            self.pending_events.push(DomainEvent::CommandCompleted {
                equipment_id: self.id.clone(),
                command_id,
                name,
                status: CommandStatus::Timeout,
                message: Some("timed out".into()),
                at: now,
            });
        }
        count
    }

    // ── Data and configuration ───────────────────────────────────────

    pub fn add_trace_data(&mut self, trace: TraceData) {
        self.last_data_update = Some(trace.timestamp);
        self.touch(trace.timestamp);
        self.trace.push(trace);
    }

    pub fn set_metadata(&mut self, metadata: MachineMetadata, now: DateTime<Utc>) {
        self.metadata = Some(metadata);
        self.touch(now);
    }

    pub fn set_description(&mut self, description: Option<String>, now: DateTime<Utc>) {
        self.description = description;
        self.touch(now);
    }

    pub fn set_config_valid(&mut self, valid: bool, now: DateTime<Utc>) {
        if self.config_valid != valid {
            self.config_valid = valid;
            self.touch(now);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn equipment() -> Equipment {
        let mut eq = Equipment::register(
            EquipmentId::new("ETCH-01").unwrap(),
            "Etcher 1",
            "10.0.0.5:5000".parse().unwrap(),
            t(0),
        );
        eq.take_events();
        eq
    }

    fn connected_in(state: EquipmentState) -> Equipment {
        let mut eq = equipment();
        eq.connect("session-1", t(1)).unwrap();
        if state != EquipmentState::Idle {
            eq.apply_state(state, "test", "setup", t(2));
        }
        eq.take_events();
        eq
    }

    fn alarm(id: u32, severity: AlarmSeverity) -> AlarmEvent {
        AlarmEvent::new(id, "Door Open", severity, t(5))
    }

    #[test]
    fn registration_emits_event() {
        let mut eq = Equipment::register(
            EquipmentId::new("CVD-2").unwrap(),
            "CVD",
            "10.0.0.6:5000".parse().unwrap(),
            t(0),
        );
        assert_eq!(eq.state(), EquipmentState::Unknown);
        let events = eq.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "registered");
        assert!(eq.pending_events().is_empty());
    }

    #[test]
    fn every_table_pair_is_enforced() {
        for from in EquipmentState::iter().filter(|s| *s != EquipmentState::Unknown) {
            for to in EquipmentState::iter().filter(|s| *s != from) {
                let mut eq = connected_in(from);
                let before_version = eq.version();
                let result = eq.update_state(to, "op", "test", t(10));

                if from.can_transition_to(to) {
                    result.unwrap();
                    assert_eq!(eq.state(), to);
                    assert_eq!(eq.health(), HealthStatus::derive(to, true, false));
                    assert_eq!(eq.state_changed_by(), Some("op"));
                    assert!(matches!(
                        eq.pending_events()[0],
                        DomainEvent::StateChanged { .. }
                    ));
                } else {
                    let err = result.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::InvalidTransition, "{from} -> {to}");
                    assert_eq!(eq.state(), from);
                    assert_eq!(eq.version(), before_version);
                    assert!(eq.pending_events().is_empty());
                }
            }
        }
    }

    #[test]
    fn same_state_update_is_silent() {
        let mut eq = connected_in(EquipmentState::Idle);
        let version = eq.version();
        eq.update_state(EquipmentState::Idle, "op", "again", t(3))
            .unwrap();
        assert_eq!(eq.version(), version);
        assert!(eq.pending_events().is_empty());
    }

    #[test]
    fn first_connect_moves_unknown_to_idle() {
        let mut eq = equipment();
        eq.connect("s1", t(1)).unwrap();
        assert_eq!(eq.state(), EquipmentState::Idle);
        assert_eq!(eq.health(), HealthStatus::Healthy);
        let names: Vec<_> = eq.take_events().iter().map(DomainEvent::name).collect();
        assert_eq!(names, vec!["connected", "state_changed"]);

        let err = eq.connect("s2", t(2)).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyConnected { .. }));
    }

    #[test]
    fn connect_rejected_in_maintenance_or_invalid_config() {
        let mut eq = connected_in(EquipmentState::Maintenance);
        eq.disconnect("service", true, t(3));
        assert!(matches!(
            eq.connect("s2", t(4)).unwrap_err(),
            CoreError::ConnectRejected { .. }
        ));

        let mut eq = equipment();
        eq.set_config_valid(false, t(1));
        assert!(eq.connect("s1", t(2)).is_err());
        assert!(!eq.is_connected());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut eq = connected_in(EquipmentState::Idle);
        eq.disconnect("bye", true, t(3));
        let version = eq.version();
        eq.disconnect("bye again", true, t(4));
        assert_eq!(eq.version(), version);
        assert_eq!(eq.take_events().len(), 1);
        assert_eq!(eq.health(), HealthStatus::Degraded);
    }

    #[test]
    fn connect_then_disconnect_restores_retry_count() {
        let mut eq = equipment();
        let before = eq.connection_state().retry_count;
        eq.connect("s1", t(1)).unwrap();
        eq.disconnect("done", true, t(2));
        assert_eq!(eq.connection_state().retry_count, before);
        assert_eq!(eq.connection_state().disconnect_reason.as_deref(), Some("done"));
    }

    #[test]
    fn unexpected_disconnect_while_executing_faults_and_cancels_pending() {
        let mut eq = connected_in(EquipmentState::Idle);
        let cmd = eq
            .execute_remote_command("START", serde_json::json!({}), "host", chrono::Duration::seconds(30), t(3))
            .unwrap();
        eq.apply_state(EquipmentState::Executing, "test", "running", t(4));
        eq.take_events();

        eq.disconnect("link lost", false, t(5));

        assert_eq!(eq.state(), EquipmentState::Fault);
        assert_eq!(eq.health(), HealthStatus::Unhealthy);
        let recorded = eq.command(cmd.id).unwrap();
        assert_eq!(recorded.status, CommandStatus::Cancelled);
        assert_eq!(recorded.result_message.as_deref(), Some(ATTENTION_REASON));
        let names: Vec<_> = eq.take_events().iter().map(DomainEvent::name).collect();
        assert_eq!(
            names,
            vec!["disconnected", "state_changed", "attention_required"]
        );
    }

    #[test]
    fn expected_disconnect_while_executing_keeps_state() {
        let mut eq = connected_in(EquipmentState::Executing);
        eq.disconnect("operator stop", true, t(5));
        assert_eq!(eq.state(), EquipmentState::Executing);
        assert_eq!(eq.health(), HealthStatus::Degraded);
    }

    #[test]
    fn add_alarm_is_idempotent_per_id() {
        let mut eq = connected_in(EquipmentState::Idle);
        assert!(eq.add_alarm(alarm(7, AlarmSeverity::Minor), t(5)));
        assert!(!eq.add_alarm(alarm(7, AlarmSeverity::Minor), t(6)));
        assert_eq!(eq.active_alarms().len(), 1);
        assert_eq!(eq.state(), EquipmentState::Idle);
        assert!(eq.clear_alarm(99, t(7)).is_none());
    }

    #[test]
    fn major_alarm_escalates_from_working_states() {
        for state in [
            EquipmentState::Idle,
            EquipmentState::Executing,
            EquipmentState::Setup,
            EquipmentState::Pause,
        ] {
            let mut eq = connected_in(state);
            eq.add_alarm(alarm(1, AlarmSeverity::Major), t(5));
            assert_eq!(eq.state(), EquipmentState::Alarm, "from {state}");
            eq.clear_alarm(1, t(6)).unwrap();
            assert_eq!(eq.state(), EquipmentState::Idle, "from {state}");
        }
    }

    #[test]
    fn alarm_does_not_override_fault() {
        let mut eq = connected_in(EquipmentState::Fault);
        eq.add_alarm(alarm(1, AlarmSeverity::Emergency), t(5));
        assert_eq!(eq.state(), EquipmentState::Fault);
    }

    #[test]
    fn door_open_scenario() {
        let mut eq = connected_in(EquipmentState::Idle);
        eq.add_alarm(
            AlarmEvent::new(5, "Door Open", AlarmSeverity::Critical, t(5)),
            t(5),
        );
        assert_eq!(eq.state(), EquipmentState::Alarm);
        assert!(matches!(
            eq.health(),
            HealthStatus::Degraded | HealthStatus::Unhealthy
        ));
        let triggered = eq
            .take_events()
            .iter()
            .filter(|e| matches!(e, DomainEvent::AlarmTriggered { .. }))
            .count();
        assert_eq!(triggered, 1);

        let cleared = eq.clear_alarm(5, t(6)).unwrap();
        assert_eq!(cleared.cleared_at, Some(t(6)));
        assert_eq!(eq.state(), EquipmentState::Idle);
        assert_eq!(eq.health(), HealthStatus::Healthy);
        assert_eq!(eq.active_alarms().len(), 0);
    }

    #[test]
    fn clearing_one_of_two_major_alarms_stays_in_alarm() {
        let mut eq = connected_in(EquipmentState::Idle);
        eq.add_alarm(alarm(1, AlarmSeverity::Major), t(5));
        eq.add_alarm(alarm(2, AlarmSeverity::Critical), t(5));
        eq.clear_alarm(1, t(6));
        assert_eq!(eq.state(), EquipmentState::Alarm);
        assert_eq!(eq.highest_severity(), Some(AlarmSeverity::Critical));
    }

    #[test]
    fn acknowledge_is_stamped_once() {
        let mut eq = connected_in(EquipmentState::Idle);
        eq.add_alarm(alarm(3, AlarmSeverity::Minor), t(5));
        assert!(eq.acknowledge_alarm(3, "alice", t(6)).unwrap());
        assert!(!eq.acknowledge_alarm(3, "bob", t(7)).unwrap());
        let active = eq.active_alarm(3).unwrap();
        assert_eq!(active.acknowledged_by.as_deref(), Some("alice"));
        assert_eq!(active.acknowledged_at, Some(t(6)));
        assert_eq!(
            eq.acknowledge_alarm(4, "alice", t(8)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn start_from_idle_is_recorded_and_rejected_while_executing() {
        let mut eq = connected_in(EquipmentState::Idle);
        let cmd = eq
            .execute_remote_command("START", serde_json::json!({"recipe": "R1"}), "mes", chrono::Duration::seconds(30), t(3))
            .unwrap();
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert_eq!(eq.command_history().len(), 1);

        let mut eq = connected_in(EquipmentState::Executing);
        let err = eq
            .execute_remote_command("START", serde_json::Value::Null, "mes", chrono::Duration::seconds(30), t(3))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(eq.command_history().len(), 0);
        assert!(eq.pending_events().is_empty());
    }

    #[test]
    fn terminal_status_is_applied_once() {
        let mut eq = connected_in(EquipmentState::Idle);
        let cmd = eq
            .execute_remote_command("START", serde_json::Value::Null, "mes", chrono::Duration::seconds(30), t(3))
            .unwrap();
        eq.update_command_status(cmd.id, CommandStatus::Executing, None, None, t(4))
            .unwrap();
        let done = eq
            .update_command_status(cmd.id, CommandStatus::Completed, Some("ok".into()), None, t(5))
            .unwrap();
        assert_eq!(done.completed_at, Some(t(5)));

        let err = eq
            .update_command_status(cmd.id, CommandStatus::Failed, None, None, t(6))
            .unwrap_err();
        assert!(matches!(err, CoreError::CommandAlreadyFinished { .. }));
        assert_eq!(eq.command(cmd.id).unwrap().status, CommandStatus::Completed);
    }

    #[test]
    fn overdue_commands_time_out() {
        let mut eq = connected_in(EquipmentState::Idle);
        let cmd = eq
            .execute_remote_command("START", serde_json::Value::Null, "mes", chrono::Duration::seconds(10), t(3))
            .unwrap();
        eq.take_events();
        assert_eq!(eq.expire_commands(t(5)), 0);
        assert_eq!(eq.expire_commands(t(13)), 1);
        assert_eq!(eq.command(cmd.id).unwrap().status, CommandStatus::Timeout);
        assert_eq!(eq.take_events().len(), 1);
        assert_eq!(eq.expire_commands(t(20)), 0);
    }

    #[test]
    fn histories_are_bounded() {
        let mut eq = connected_in(EquipmentState::Idle);
        for i in 0..150 {
            eq.add_trace_data(TraceData::new(i, t(i64::from(i))));
        }
        assert_eq!(eq.recent_trace().len(), TRACE_CAPACITY);
        assert_eq!(eq.recent_trace().next().unwrap().report_id, 50);

        for _ in 0..60 {
            eq.execute_remote_command("LOCAL", serde_json::Value::Null, "mes", chrono::Duration::seconds(10), t(3))
                .unwrap();
        }
        assert_eq!(eq.command_history().len(), COMMAND_HISTORY_CAPACITY);
    }

    #[test]
    fn status_snapshot_reflects_aggregate() {
        let mut eq = connected_in(EquipmentState::Idle);
        eq.record_heartbeat(t(10));
        eq.add_alarm(alarm(9, AlarmSeverity::Minor), t(10));
        let status = eq.status(t(20));
        assert!(status.connected);
        assert_eq!(status.active_alarms, 1);
        assert_eq!(status.highest_severity, Some(AlarmSeverity::Minor));
        assert_eq!(status.quality, secsgate_hsms::ConnectionQuality::Excellent);
        assert_eq!(status.last_heartbeat, Some(t(10)));
    }

    #[test]
    fn heartbeats_and_samples_bump_the_version() {
        let mut eq = connected_in(EquipmentState::Idle);
        let version = eq.version();

        eq.record_heartbeat(t(11));
        assert_eq!(eq.version(), version + 1);
        assert_eq!(eq.updated_at(), t(11));

        eq.add_trace_data(TraceData::new(1, t(12)));
        assert_eq!(eq.version(), version + 2);
        assert_eq!(eq.last_data_update(), Some(t(12)));
        assert!(eq.pending_events().is_empty());
    }
}
