//! Relay wire protocol
//!
//! JSON messages exchanged with the rendezvous relay, tagged by a
//! `type` field. Targeted messages carry `from` so the receiving side
//! can suppress its own echoes.

use crate::session::CallError;
use serde::{Deserialize, Serialize};

/// An SDP session description as exchanged over the relay.
///
/// Browser-shaped: `{"type": "offer"|"answer", "sdp": "v=0..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
        }
    }
}

/// A connectivity candidate payload, browser field names preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Relay message kinds for session negotiation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Request membership in a room
    JoinRoom { room_id: String, user_id: String },

    /// Leave a room
    LeaveRoom { room_id: String, user_id: String },

    /// Hang-up notice to the room
    EndCall { room_id: String, user_id: String },

    /// SDP offer addressed to a peer
    Offer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// SDP answer addressed to a peer
    Answer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Connectivity candidate addressed to a peer
    IceCandidate {
        candidate: CandidatePayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// A participant entered the room
    UserConnected { user_id: String },

    /// A participant left the room
    UserDisconnected { user_id: String },

    /// Roster snapshot of the room
    RoomUsers { users: Vec<String> },
}

impl RelayMessage {
    /// Parse a relay message from JSON
    pub fn from_json(json: &str) -> Result<Self, CallError> {
        serde_json::from_str(json)
            .map_err(|e| CallError::SignalingError(format!("Invalid relay message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, CallError> {
        serde_json::to_string(self)
            .map_err(|e| CallError::SignalingError(format!("Failed to serialize message: {}", e)))
    }

    /// Short kind label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::JoinRoom { .. } => "join-room",
            RelayMessage::LeaveRoom { .. } => "leave-room",
            RelayMessage::EndCall { .. } => "end-call",
            RelayMessage::Offer { .. } => "offer",
            RelayMessage::Answer { .. } => "answer",
            RelayMessage::IceCandidate { .. } => "ice-candidate",
            RelayMessage::UserConnected { .. } => "user-connected",
            RelayMessage::UserDisconnected { .. } => "user-disconnected",
            RelayMessage::RoomUsers { .. } => "room-users",
        }
    }

    /// The originating user, when the message names one.
    ///
    /// Used for self-echo suppression: inbound traffic whose sender is
    /// the local user must cause no transition.
    pub fn sender(&self) -> Option<&str> {
        match self {
            RelayMessage::Offer { from, .. }
            | RelayMessage::Answer { from, .. }
            | RelayMessage::IceCandidate { from, .. } => Some(from),
            RelayMessage::UserConnected { user_id }
            | RelayMessage::UserDisconnected { user_id } => Some(user_id),
            RelayMessage::JoinRoom { user_id, .. }
            | RelayMessage::LeaveRoom { user_id, .. }
            | RelayMessage::EndCall { user_id, .. } => Some(user_id),
            RelayMessage::RoomUsers { .. } => None,
        }
    }
}
