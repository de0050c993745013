// ── Operating state and health ──
//
// SEMI E30 style operating states with the transition table the
// aggregate enforces, plus the derived health verdict.

use secsgate_hsms::SecsItem;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Operating state of a tool.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum EquipmentState {
    #[default]
    Unknown,
    Idle,
    Setup,
    Executing,
    Pause,
    Down,
    Maintenance,
    Fault,
    Alarm,
}

impl EquipmentState {
    /// Whether the transition table admits `self -> target`.
    ///
    /// `UNKNOWN` is an initial state only: anything may leave it and
    /// nothing may enter it.
    pub fn can_transition_to(self, target: Self) -> bool {
        use EquipmentState::{
            Alarm, Down, Executing, Fault, Idle, Maintenance, Pause, Setup, Unknown,
        };

        if target == Unknown {
            return false;
        }
        match self {
            Unknown | Idle | Alarm => true,
            Setup => matches!(target, Executing | Idle | Fault | Alarm),
            Executing => matches!(target, Pause | Idle | Fault | Alarm),
            Pause => matches!(target, Executing | Idle | Fault),
            Down => matches!(target, Maintenance | Idle),
            Maintenance => matches!(target, Idle),
            Fault => matches!(target, Maintenance | Idle | Down),
        }
    }

    /// States that cancel pending commands and raise an attention event.
    pub fn requires_attention(self) -> bool {
        matches!(self, Self::Fault | Self::Alarm | Self::Maintenance)
    }

    /// Whether the tool is actively processing.
    pub fn is_processing(self) -> bool {
        matches!(self, Self::Setup | Self::Executing | Self::Pause)
    }

    /// Numeric code reported by the state status variable.
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Idle => 1,
            Self::Setup => 2,
            Self::Executing => 3,
            Self::Pause => 4,
            Self::Down => 5,
            Self::Maintenance => 6,
            Self::Fault => 7,
            Self::Alarm => 8,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::iter().find(|s| u64::from(s.code()) == code)
    }

    /// Decode the value of the state status variable: either a numeric
    /// code or the ASCII state name.
    pub fn from_device(item: &SecsItem) -> Option<Self> {
        if let Some(name) = item.as_ascii() {
            let name = name.trim();
            return name
                .parse()
                .ok()
                .or_else(|| name.parse::<u64>().ok().and_then(Self::from_code));
        }
        item.as_u64().and_then(Self::from_code)
    }
}

/// Derived health verdict. Never set directly by the transport.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn derive(state: EquipmentState, connected: bool, has_major_alarm: bool) -> Self {
        match state {
            EquipmentState::Fault => Self::Unhealthy,
            EquipmentState::Alarm if has_major_alarm => Self::Degraded,
            EquipmentState::Idle | EquipmentState::Executing => {
                if connected {
                    Self::Healthy
                } else {
                    Self::Degraded
                }
            }
            EquipmentState::Maintenance => Self::Degraded,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use EquipmentState::{
        Alarm, Down, Executing, Fault, Idle, Maintenance, Pause, Setup, Unknown,
    };

    fn allowed(from: EquipmentState) -> Vec<EquipmentState> {
        EquipmentState::iter()
            .filter(|to| from.can_transition_to(*to))
            .collect()
    }

    #[test]
    fn transition_table() {
        let everything_but_unknown: Vec<_> =
            EquipmentState::iter().filter(|s| *s != Unknown).collect();

        assert_eq!(allowed(Unknown), everything_but_unknown);
        assert_eq!(allowed(Idle), everything_but_unknown);
        assert_eq!(allowed(Alarm), everything_but_unknown);
        assert_eq!(allowed(Setup), vec![Idle, Executing, Fault, Alarm]);
        assert_eq!(allowed(Executing), vec![Idle, Pause, Fault, Alarm]);
        assert_eq!(allowed(Pause), vec![Idle, Executing, Fault]);
        assert_eq!(allowed(Down), vec![Idle, Maintenance]);
        assert_eq!(allowed(Maintenance), vec![Idle]);
        assert_eq!(allowed(Fault), vec![Idle, Down, Maintenance]);
    }

    #[test]
    fn device_values_decode_by_code_or_name() {
        assert_eq!(EquipmentState::from_device(&SecsItem::u1(3)), Some(Executing));
        assert_eq!(EquipmentState::from_device(&SecsItem::u4(8)), Some(Alarm));
        assert_eq!(EquipmentState::from_device(&SecsItem::ascii("idle")), Some(Idle));
        assert_eq!(EquipmentState::from_device(&SecsItem::ascii(" 7 ")), Some(Fault));
        assert_eq!(EquipmentState::from_device(&SecsItem::u1(42)), None);
        assert_eq!(EquipmentState::from_device(&SecsItem::empty_list()), None);
    }

    #[test]
    fn codes_round_trip() {
        for state in EquipmentState::iter() {
            assert_eq!(EquipmentState::from_code(u64::from(state.code())), Some(state));
        }
    }

    #[test]
    fn health_derivation() {
        assert_eq!(HealthStatus::derive(Fault, true, false), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::derive(Alarm, true, true), HealthStatus::Degraded);
        assert_eq!(HealthStatus::derive(Alarm, true, false), HealthStatus::Unknown);
        assert_eq!(HealthStatus::derive(Idle, true, false), HealthStatus::Healthy);
        assert_eq!(HealthStatus::derive(Executing, false, false), HealthStatus::Degraded);
        assert_eq!(HealthStatus::derive(Maintenance, true, false), HealthStatus::Degraded);
        assert_eq!(HealthStatus::derive(Setup, true, false), HealthStatus::Unknown);
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(Executing.to_string(), "EXECUTING");
        assert_eq!("maintenance".parse::<EquipmentState>().unwrap(), Maintenance);
    }
}
