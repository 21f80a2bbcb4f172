//! Local media acquisition
//!
//! The controller treats capture as an opaque capability: one async
//! `acquire` that either yields an audio+video track pair or a
//! permission/device failure. The provided implementation builds
//! sample-fed local tracks; feeding frames into them is the rendering
//! side's concern, not ours.

use crate::config::MediaConfig;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Capture errors surfaced by the media collaborator
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// The user or platform denied access to capture devices
    PermissionDenied,
    /// No usable capture device
    DeviceUnavailable(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::PermissionDenied => write!(f, "Capture permission denied"),
            CaptureError::DeviceUnavailable(msg) => write!(f, "Capture device unavailable: {}", msg),
        }
    }
}

impl Error for CaptureError {}

/// A locally captured audio+video track pair.
///
/// Cloning shares the underlying tracks by reference; the controller
/// owns the pair for the session's lifetime and hands the peer link a
/// shared reference, never a duplicate acquisition.
#[derive(Clone)]
pub struct MediaTracks {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
}

/// Media acquisition capability
#[async_trait]
pub trait MediaCapture: Send + Sync + 'static {
    /// Acquire the local track set. Idempotent: repeated calls yield
    /// the same handles, never a second acquisition.
    async fn acquire(&self) -> Result<MediaTracks, CaptureError>;
}

/// Default capture: Opus audio + VP8 video sample tracks.
pub struct TrackCapture {
    stream_id: String,
    cached: Mutex<Option<MediaTracks>>,
}

impl TrackCapture {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            stream_id: config.stream_id.clone(),
            cached: Mutex::new(None),
        }
    }

    fn build_tracks(&self) -> MediaTracks {
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            self.stream_id.clone(),
        );

        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", uuid::Uuid::new_v4()),
            self.stream_id.clone(),
        );

        MediaTracks {
            audio: Arc::new(audio),
            video: Arc::new(video),
        }
    }
}

#[async_trait]
impl MediaCapture for TrackCapture {
    async fn acquire(&self) -> Result<MediaTracks, CaptureError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref tracks) = *cached {
            return Ok(tracks.clone());
        }
        let tracks = self.build_tracks();
        *cached = Some(tracks.clone());
        Ok(tracks)
    }
}
