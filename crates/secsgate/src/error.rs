//! CLI error types with miette diagnostics.
//!
//! Maps `ConfigError` and `CoreError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use secsgate_config::ConfigError;
use secsgate_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const VALIDATION: i32 = 3;
    pub const CONNECTION: i32 = 4;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Could not load configuration from {path}")]
    #[diagnostic(
        code(secsgate::config),
        help("Check the TOML syntax and any SECSGATE_* environment overrides.")
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Invalid {field}: {reason}")]
    #[diagnostic(
        code(secsgate::validation),
        help("Run: secsgate validate --effective to see the merged configuration")
    )]
    Validation { field: String, reason: String },

    #[error("No devices to run")]
    #[diagnostic(
        code(secsgate::no_devices),
        help("Add [[devices]] entries to {path} or pass --tools N")
    )]
    NoDevices { path: String },

    // ── Connection ───────────────────────────────────────────────────

    #[error("None of the {attempted} devices connected")]
    #[diagnostic(
        code(secsgate::connection_failed),
        help("First failure: {first_failure}")
    )]
    ConnectionFailed {
        attempted: usize,
        first_failure: String,
    },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error(transparent)]
    #[diagnostic(code(secsgate::core))]
    Core(CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not render output: {0}")]
    #[diagnostic(code(secsgate::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn config(path: &std::path::Path, err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            source => Self::Config {
                path: path.display().to_string(),
                source,
            },
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::CONFIG,
            Self::Validation { .. } | Self::NoDevices { .. } => exit_code::VALIDATION,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Core(err) if err.is_transient() => exit_code::CONNECTION,
            Self::Core(CoreError::Validation { .. }) => exit_code::VALIDATION,
            Self::Core(_) | Self::Io(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Core(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failures_exit_with_the_validation_code() {
        let err = CliError::config(
            std::path::Path::new("gw.toml"),
            ConfigError::Validation {
                field: "devices[0].endpoint".into(),
                reason: "expected ip:port".into(),
            },
        );
        assert!(matches!(err, CliError::Validation { .. }));
        assert_eq!(err.exit_code(), exit_code::VALIDATION);
    }

    #[test]
    fn io_failures_while_loading_are_config_errors() {
        let err = CliError::config(
            std::path::Path::new("gw.toml"),
            ConfigError::Io(std::io::Error::other("denied")),
        );
        assert_eq!(err.exit_code(), exit_code::CONFIG);
    }

    #[test]
    fn core_errors_map_by_kind() {
        assert_eq!(CliError::from(CoreError::NotConnected).exit_code(), exit_code::CONNECTION);
        assert_eq!(
            CliError::from(CoreError::validation("name", "empty")).exit_code(),
            exit_code::VALIDATION
        );
        assert_eq!(
            CliError::from(CoreError::Internal("boom".into())).exit_code(),
            exit_code::GENERAL
        );
    }
}
