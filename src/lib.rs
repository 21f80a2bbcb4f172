//! roomcall-core - two-party WebRTC call session negotiation
//!
//! Drives one call lifecycle per room: relay signaling, local media
//! acquisition, and peer-link negotiation reconciled by a single
//! controller task.

pub mod config;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

// Re-exports
pub use config::{Config, SignalingConfig, WebRTCConfig};
pub use media::{MediaCapture, MediaTracks, TrackCapture};
pub use peer::{PeerLink, PeerLinkFactory, RtcPeerLinkFactory};
pub use session::{CallError, CallSnapshot, CallState, ControllerHandle, SessionController};
pub use signaling::channel::SignalingChannel;
pub use signaling::protocol::RelayMessage;
