use std::time::Duration;

use thiserror::Error;

/// Top-level error type for the `secsgate-hsms` crate.
///
/// Covers every failure mode of the transport layer: session setup,
/// selection, request/reply exchanges, and the codec boundary.
/// `secsgate-core` maps these into domain diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// Operation requires a selected session and there is none.
    #[error("Not connected to equipment")]
    NotConnected,

    /// The session did not reach the *Selected* phase in time.
    #[error("Connection to {endpoint} timed out after {}ms", timeout.as_millis())]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// The codec failed to open or maintain the session.
    #[error("Session error: {0}")]
    Session(String),

    /// Socket-level failure surfaced by the codec.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session closed while an exchange was in flight.
    #[error("Session closed")]
    Closed,

    // ── Exchanges ───────────────────────────────────────────────────
    /// No reply arrived within T3.
    #[error("No reply to S{stream}F{function} (system bytes {system_bytes:#010x}) within {}ms", timeout.as_millis())]
    ReplyTimeout {
        stream: u8,
        function: u8,
        system_bytes: u32,
        timeout: Duration,
    },

    /// HSMS link test (control transaction) exceeded T6.
    #[error("Link test timed out after {}ms", timeout.as_millis())]
    LinkTestTimeout { timeout: Duration },

    /// Equipment answered with a non-zero acknowledge code.
    #[error("{exchange} rejected by equipment (code {code})")]
    Rejected { exchange: &'static str, code: u8 },

    /// The reply did not correlate with the request.
    #[error("Unexpected reply {got} to {expected}")]
    UnexpectedReply { expected: String, got: String },

    /// Message body did not have the expected item structure.
    #[error("Malformed {message}: {reason}")]
    Malformed {
        message: &'static str,
        reason: String,
    },

    // ── Lifecycle ───────────────────────────────────────────────────
    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// The client has been shut down and cannot be reused.
    #[error("Client has been shut down")]
    Shutdown,

    // ── Configuration ───────────────────────────────────────────────
    /// Endpoint or timer configuration is invalid.
    #[error("Invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
}

impl Error {
    /// Returns `true` if this is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ReplyTimeout { .. } | Self::LinkTestTimeout { .. }
        )
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectTimeout { .. }
            | Self::ReplyTimeout { .. }
            | Self::LinkTestTimeout { .. }
            | Self::Session(_)
            | Self::Io(_)
            | Self::Closed => true,
            _ => false,
        }
    }

    /// Returns `true` if the session is gone and the caller should reconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed | Self::Io(_))
    }

    /// The acknowledge code carried by a rejection, if any.
    pub fn reject_code(&self) -> Option<u8> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_timeout_is_transient_timeout() {
        let err = Error::ReplyTimeout {
            stream: 1,
            function: 3,
            system_bytes: 7,
            timeout: Duration::from_secs(45),
        };
        assert!(err.is_timeout());
        assert!(err.is_transient());
        assert!(!err.is_disconnect());
        assert_eq!(
            err.to_string(),
            "No reply to S1F3 (system bytes 0x00000007) within 45000ms"
        );
    }

    #[test]
    fn rejection_exposes_code() {
        let err = Error::Rejected {
            exchange: "S1F13",
            code: 1,
        };
        assert_eq!(err.reject_code(), Some(1));
        assert!(!err.is_transient());
    }
}
