use num_enum::FromPrimitive;
use serde::{Serialize, Serializer};

/// Run status reported in input register 0.
///
/// Only 0, 1 and 3 are documented. Anything else (2 included) is kept as
/// `Unknown` with its raw code rather than guessed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum OperatingState {
    /// Idle or unpowered. Most registers cannot be read in this state.
    Waiting = 0,
    Normal = 1,
    Fault = 3,
    #[num_enum(catch_all)]
    Unknown(u16),
}

impl OperatingState {
    pub fn code(&self) -> u16 {
        match self {
            Self::Waiting => 0,
            Self::Normal => 1,
            Self::Fault => 3,
            Self::Unknown(code) => *code,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Waiting => "waiting".to_string(),
            Self::Normal => "normal".to_string(),
            Self::Fault => "fault".to_string(),
            Self::Unknown(code) => format!("unknown({})", code),
        }
    }

    pub fn is_waiting(&self) -> bool {
        *self == Self::Waiting
    }
}

// assume the inverter is dark until proven otherwise
impl Default for OperatingState {
    fn default() -> Self {
        Self::Waiting
    }
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for OperatingState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes() {
        assert_eq!(OperatingState::from(0), OperatingState::Waiting);
        assert_eq!(OperatingState::from(1), OperatingState::Normal);
        assert_eq!(OperatingState::from(3), OperatingState::Fault);
        assert_eq!(OperatingState::Normal.label(), "normal");
    }

    #[test]
    fn unknown_codes_keep_their_value() {
        assert_eq!(OperatingState::from(2), OperatingState::Unknown(2));
        assert_eq!(OperatingState::from(999), OperatingState::Unknown(999));
        assert_eq!(OperatingState::Unknown(2).code(), 2);
        assert_eq!(OperatingState::Unknown(2).label(), "unknown(2)");
        assert_ne!(OperatingState::Unknown(2), OperatingState::Unknown(4));
    }

    #[test]
    fn serializes_as_label() {
        assert_eq!(
            serde_json::to_string(&OperatingState::Fault).unwrap(),
            "\"fault\""
        );
        assert_eq!(
            serde_json::to_string(&OperatingState::Unknown(7)).unwrap(),
            "\"unknown(7)\""
        );
    }

    #[test]
    fn defaults_to_waiting() {
        assert!(OperatingState::default().is_waiting());
    }
}
