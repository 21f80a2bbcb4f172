//! Call lifecycle state machine
//!
//! `CallState` is the single authoritative field the UI reads. All
//! transitions happen inside the controller's event dispatch; nothing
//! else writes it.

use std::fmt;

/// Lifecycle state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call requested yet
    Idle,
    /// Waiting for relay connectivity and local media to both become ready
    JoiningChannel,
    /// Room joined, waiting for a counterpart to show up
    AwaitingPeer,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Peer link transport established
    Connected,
    /// Torn down; a fresh start re-enters JoiningChannel
    Disconnected,
    /// Unrecoverable capture or connection error (absorbing until restarted)
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::JoiningChannel => "joining_channel",
            CallState::AwaitingPeer => "awaiting_peer",
            CallState::Negotiating => "negotiating",
            CallState::Connected => "connected",
            CallState::Disconnected => "disconnected",
            CallState::Failed => "failed",
        }
    }

    /// True while the session holds or is acquiring resources.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::JoiningChannel
                | CallState::AwaitingPeer
                | CallState::Negotiating
                | CallState::Connected
        )
    }

    /// States from which `start_call` begins a new lifecycle.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            CallState::Idle | CallState::Disconnected | CallState::Failed
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
