//! Peer link abstraction
//!
//! A peer link is one negotiated direct transport to the counterpart.
//! The controller is its sole owner and sole writer; everything else
//! observes it through events.

pub mod link;

pub use link::{RtcPeerLink, RtcPeerLinkFactory};

use crate::media::MediaTracks;
use crate::session::CallError;
use crate::signaling::protocol::{CandidatePayload, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Transport state of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

/// Events emitted by a live peer link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A locally gathered connectivity candidate
    Candidate(CandidatePayload),
    /// Transport state change
    StateChanged(LinkState),
    /// A remote media track arrived; the link keeps ownership
    RemoteTrack { kind: String, id: String },
}

/// One negotiated peer connection
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), CallError>;
    async fn close(&self);
}

/// Creation seam for peer links.
///
/// `tracks` is the currently held local media, if capture has already
/// completed; a link created without tracks stays trackless.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync + 'static {
    type Link: PeerLink;

    async fn create(
        &self,
        tracks: Option<&MediaTracks>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<Self::Link>, CallError>;
}
