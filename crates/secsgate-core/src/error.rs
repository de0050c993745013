// ── Core error types ──
//
// Domain-facing errors from secsgate-core. Callers never see codec or
// session details directly; the `From<secsgate_hsms::Error>` impl
// translates transport failures into the domain taxonomy.

use serde::Serialize;
use strum::Display;
use thiserror::Error;

use crate::model::EquipmentState;

/// Discriminant of the failure taxonomy, stable across error variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum ErrorKind {
    NotConnected,
    ConnectTimeout,
    ReplyTimeout,
    ProtocolReject,
    InvalidTransition,
    DuplicateDevice,
    ValidationError,
    Cancelled,
    NotFound,
    Collaborator,
    Internal,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Equipment not connected")]
    NotConnected,

    #[error("Cannot reach equipment: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Connection to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("No reply to {message} within {timeout_ms}ms")]
    ReplyTimeout { message: String, timeout_ms: u64 },

    // ── Protocol errors ──────────────────────────────────────────────
    #[error("{exchange} rejected by equipment (code {code}): {reason}")]
    ProtocolReject {
        exchange: String,
        code: u8,
        reason: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Domain rule violations ───────────────────────────────────────
    #[error("Transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: EquipmentState,
        to: EquipmentState,
    },

    #[error("Command {command} not allowed in state {state}")]
    CommandNotAllowed {
        command: String,
        state: EquipmentState,
    },

    #[error("Command {id} already finished")]
    CommandAlreadyFinished { id: String },

    #[error("Equipment {id} is already connected")]
    AlreadyConnected { id: String },

    #[error("Connection refused by domain rules: {reason}")]
    ConnectRejected { reason: String },

    #[error("Remote control is disabled for {id}")]
    RemoteControlDisabled { id: String },

    #[error("Service cannot {operation} while {state}")]
    ServiceState {
        operation: &'static str,
        state: String,
    },

    #[error("Duplicate device: {identifier}")]
    DuplicateDevice { identifier: String },

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    // ── Lookup ───────────────────────────────────────────────────────
    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: &'static str,
        identifier: String,
    },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Operation cancelled")]
    Cancelled,

    // ── External collaborators ───────────────────────────────────────
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected | Self::ConnectionFailed { .. } => ErrorKind::NotConnected,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::ReplyTimeout { .. } => ErrorKind::ReplyTimeout,
            Self::ProtocolReject { .. } | Self::Protocol { .. } => ErrorKind::ProtocolReject,
            Self::InvalidTransition { .. }
            | Self::CommandNotAllowed { .. }
            | Self::CommandAlreadyFinished { .. }
            | Self::AlreadyConnected { .. }
            | Self::ConnectRejected { .. }
            | Self::RemoteControlDisabled { .. }
            | Self::ServiceState { .. } => ErrorKind::InvalidTransition,
            Self::DuplicateDevice { .. } => ErrorKind::DuplicateDevice,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Collaborator { .. } => ErrorKind::Collaborator,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Timeouts and lost connections, which the retry machinery absorbs.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotConnected | ErrorKind::ConnectTimeout | ErrorKind::ReplyTimeout
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConnectTimeout | ErrorKind::ReplyTimeout)
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<secsgate_hsms::Error> for CoreError {
    fn from(err: secsgate_hsms::Error) -> Self {
        use secsgate_hsms::Error as E;

        match err {
            E::NotConnected | E::Closed => CoreError::NotConnected,
            E::ConnectTimeout { endpoint, timeout } => CoreError::ConnectTimeout {
                endpoint,
                timeout_ms: millis(timeout),
            },
            E::Session(reason) => CoreError::ConnectionFailed { reason },
            E::Io(e) => CoreError::ConnectionFailed {
                reason: e.to_string(),
            },
            E::ReplyTimeout {
                stream,
                function,
                timeout,
                ..
            } => CoreError::ReplyTimeout {
                message: format!("S{stream}F{function}"),
                timeout_ms: millis(timeout),
            },
            E::LinkTestTimeout { timeout } => CoreError::ReplyTimeout {
                message: "link test".into(),
                timeout_ms: millis(timeout),
            },
            E::Rejected { exchange, code } => CoreError::ProtocolReject {
                exchange: exchange.into(),
                code,
                reason: "non-zero acknowledge code".into(),
            },
            e @ (E::UnexpectedReply { .. } | E::Malformed { .. }) => CoreError::Protocol {
                message: e.to_string(),
            },
            E::Cancelled | E::Shutdown => CoreError::Cancelled,
            E::InvalidConfig { field, reason } => CoreError::Validation {
                field: field.into(),
                reason,
            },
        }
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
