//! Signaling relay client
//!
//! Maintains one logical WebSocket connection to the rendezvous relay
//! and exchanges the JSON messages that drive session negotiation.

pub mod channel;
pub mod protocol;

pub use channel::{ChannelCommand, ChannelEvent, SignalingChannel};
pub use protocol::RelayMessage;

/// Connectivity of the relay link, independent of any call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempt budget exhausted
    Failed,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }
}
