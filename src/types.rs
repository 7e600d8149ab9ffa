//! Core addressing types for PDU routing

use serde::Deserialize;
use std::fmt;

/// Direction of an endpoint or comm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    /// Parse a config direction string. Unknown values fall back to `InOut`.
    pub fn parse(s: &str) -> Self {
        match s {
            "in" => Direction::In,
            "out" => Direction::Out,
            _ => Direction::InOut,
        }
    }
}

/// Name-based PDU address, resolved through a PDU definition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PduKey {
    pub robot: String,
    pub pdu: String,
}

impl PduKey {
    pub fn new(robot: impl Into<String>, pdu: impl Into<String>) -> Self {
        Self {
            robot: robot.into(),
            pdu: pdu.into(),
        }
    }
}

/// Resolved PDU address used for routing, cache keys and subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct PduResolvedKey {
    pub robot: String,
    pub channel_id: u32,
}

impl PduResolvedKey {
    pub fn new(robot: impl Into<String>, channel_id: u32) -> Self {
        Self {
            robot: robot.into(),
            channel_id,
        }
    }
}

impl fmt::Display for PduResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.robot, self.channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse() {
        assert_eq!(Direction::parse("in"), Direction::In);
        assert_eq!(Direction::parse("out"), Direction::Out);
        assert_eq!(Direction::parse("inout"), Direction::InOut);
        assert_eq!(Direction::parse("sideways"), Direction::InOut);
    }

    #[test]
    fn test_resolved_key_equality() {
        let a = PduResolvedKey::new("drone", 3);
        let b = PduResolvedKey::new("drone", 3);
        let c = PduResolvedKey::new("drone", 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
