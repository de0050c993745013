// ── Transport configuration ──
//
// HSMS timers, connection mode, endpoint, and the reconnect policy.
// These types never touch disk; `secsgate-config` builds them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ── Endpoint ────────────────────────────────────────────────────────

/// Network address of one tool (`ip:port`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    /// Validated constructor. Port 0 and unspecified addresses are rejected.
    pub fn new(ip: IpAddr, port: u16) -> Result<Self, Error> {
        if port == 0 {
            return Err(Error::InvalidConfig {
                field: "endpoint",
                reason: "port must be non-zero".into(),
            });
        }
        if ip.is_unspecified() {
            return Err(Error::InvalidConfig {
                field: "endpoint",
                reason: format!("{ip} is not a routable equipment address"),
            });
        }
        Ok(Self { ip, port })
    }

    /// Parse an address string and port as given by an operator.
    pub fn parse(ip: &str, port: u16) -> Result<Self, Error> {
        let ip = ip.trim().parse::<IpAddr>().map_err(|_| Error::InvalidConfig {
            field: "endpoint",
            reason: format!("invalid IP address '{ip}'"),
        })?;
        Self::new(ip, port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s.trim().parse::<SocketAddr>().map_err(|_| Error::InvalidConfig {
            field: "endpoint",
            reason: format!("expected ip:port, got '{s}'"),
        })?;
        Self::new(addr.ip(), addr.port())
    }
}

impl TryFrom<String> for Endpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(ep: Endpoint) -> Self {
        ep.to_string()
    }
}

// ── ConnectionMode ──────────────────────────────────────────────────

/// Which side opens the TCP connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Gateway connects out to the tool (the usual host role).
    #[default]
    Active,
    /// Gateway listens and the tool connects in.
    Passive,
}

// ── RetryPolicy ─────────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum reconnection attempts before giving up. Default: 10.
    pub max_retries: u32,

    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Growth factor per attempt. Default: 2.0.
    pub multiplier: f64,

    /// Upper bound on backoff delay. Default: 60s.
    pub max_delay: Duration,

    /// Spread delays by ±25% to avoid reconnection storms.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with optional jitter.
    ///
    /// `delay = min(initial * multiplier^attempt, max) * jitter`
    ///
    /// Jitter is ±25%, deterministic in the attempt number so retries stay
    /// reproducible in tests.
    #[allow(
        clippy::as_conversions,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter {
            1.0 + 0.25 * (f64::from(attempt) * 7.3).sin()
        } else {
            1.0
        };

        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.initial_delay.is_zero() {
            return Err(Error::InvalidConfig {
                field: "retry.initial_delay",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::InvalidConfig {
                field: "retry.max_delay",
                reason: "must not be shorter than initial_delay".into(),
            });
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::InvalidConfig {
                field: "retry.multiplier",
                reason: format!("must be >= 1.0, got {}", self.multiplier),
            });
        }
        Ok(())
    }
}

// ── HsmsConfig ──────────────────────────────────────────────────────

/// Per-device transport configuration.
///
/// Timer defaults follow SEMI E37.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HsmsConfig {
    /// HSMS session (device) id.
    pub device_id: u16,
    pub mode: ConnectionMode,
    /// T3: reply timeout for data messages.
    pub t3: Duration,
    /// T5: minimum spacing between connection attempts.
    pub t5: Duration,
    /// T6: control transaction (select, link test) timeout.
    pub t6: Duration,
    /// T7: time allowed to reach *Selected* after the socket opens.
    pub t7: Duration,
    /// T8: inter-byte timeout, enforced by the codec.
    pub t8: Duration,
    /// Link-test heartbeat period. Zero disables the heartbeat loop.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures that trigger a reconnect.
    pub heartbeat_failure_threshold: u32,
    pub auto_reconnect: bool,
    pub retry: RetryPolicy,
}

impl Default for HsmsConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            mode: ConnectionMode::Active,
            t3: Duration::from_secs(45),
            t5: Duration::from_secs(10),
            t6: Duration::from_secs(5),
            t7: Duration::from_secs(10),
            t8: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_failure_threshold: 3,
            auto_reconnect: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl HsmsConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (field, value) in [
            ("t3", self.t3),
            ("t5", self.t5),
            ("t6", self.t6),
            ("t7", self.t7),
            ("t8", self.t8),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig {
                    field,
                    reason: "timer must be greater than zero".into(),
                });
            }
        }
        if self.heartbeat_failure_threshold == 0 {
            return Err(Error::InvalidConfig {
                field: "heartbeat_failure_threshold",
                reason: "must be at least 1".into(),
            });
        }
        self.retry.validate()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_and_displays() {
        let ep: Endpoint = "10.0.0.5:5000".parse().unwrap();
        assert_eq!(ep.port, 5000);
        assert_eq!(ep.to_string(), "10.0.0.5:5000");
        assert_eq!(Endpoint::parse("10.0.0.5", 5000).unwrap(), ep);
    }

    #[test]
    fn endpoint_rejects_bad_input() {
        assert!("10.0.0.5".parse::<Endpoint>().is_err());
        assert!("10.0.0.5:0".parse::<Endpoint>().is_err());
        assert!("0.0.0.0:5000".parse::<Endpoint>().is_err());
        assert!(Endpoint::parse("tool-7", 5000).is_err());
    }

    #[test]
    fn default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let policy = RetryPolicy::default();

        let d0 = policy.delay_for(0);
        let d1 = policy.delay_for(1);
        let d2 = policy.delay_for(2);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_without_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: false,
            multiplier: 3.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(9));
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        let d10 = policy.delay_for(10);
        // With jitter factor up to 1.25, max effective is 12.5s
        assert!(
            d10 <= Duration::from_millis(12_500),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }

    #[test]
    fn zero_timer_is_invalid() {
        let config = HsmsConfig {
            t7: Duration::ZERO,
            ..HsmsConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { field: "t7", .. })
        ));
        assert!(HsmsConfig::default().validate().is_ok());
    }
}
