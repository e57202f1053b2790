use serde::Serialize;
use std::fmt;

/// State of the ICE candidate gathering process.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum GatheringState {
    #[default]
    #[serde(rename = "new")]
    New,
    #[serde(rename = "gathering")]
    Gathering,
    #[serde(rename = "complete")]
    Complete,
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            GatheringState::New => "new",
            GatheringState::Gathering => "gathering",
            GatheringState::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// State of the ICE connectivity establishment, RFC 8445 section 6.1.3.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    #[serde(rename = "new")]
    New,
    #[serde(rename = "checking")]
    Checking,
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "closed")]
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}
