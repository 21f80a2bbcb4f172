//! Call session management
//!
//! One `SessionController` per (room, local user) pair reconciles relay
//! connectivity, local media readiness, and peer-link negotiation into a
//! single call lifecycle.

pub mod controller;
pub mod state;

pub use controller::{CallSnapshot, ControllerHandle, SessionController};
pub use state::CallState;

use std::error::Error;
use std::fmt;

/// Call-session errors
#[derive(Debug)]
pub enum CallError {
    /// Local media acquisition failed (permission or device)
    CaptureFailure(String),
    /// The relay connection could not be established within the attempt budget
    ChannelConnectFailure(String),
    /// An inbound message that has no matching peer link; discarded, non-fatal
    ProtocolViolation(String),
    /// SDP generation or application was rejected by the peer link
    NegotiationFailure(String),
    /// Relay message could not be encoded or decoded
    SignalingError(String),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::CaptureFailure(msg) => write!(f, "Capture failure: {}", msg),
            CallError::ChannelConnectFailure(msg) => write!(f, "Channel connect failure: {}", msg),
            CallError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            CallError::NegotiationFailure(msg) => write!(f, "Negotiation failure: {}", msg),
            CallError::SignalingError(msg) => write!(f, "Signaling error: {}", msg),
        }
    }
}

impl Error for CallError {}
