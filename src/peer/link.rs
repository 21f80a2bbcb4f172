//! webrtc-rs backed peer link
//!
//! Wraps an `RTCPeerConnection` behind the `PeerLink` trait and turns
//! its callbacks into `LinkEvent`s on a plain mpsc channel.

use super::{LinkEvent, LinkState, PeerLink, PeerLinkFactory};
use crate::config::WebRTCConfig;
use crate::media::MediaTracks;
use crate::session::CallError;
use crate::signaling::protocol::{CandidatePayload, SessionDescription};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::TrackLocal;

/// Factory creating webrtc-rs peer links from one shared configuration
pub struct RtcPeerLinkFactory {
    config: WebRTCConfig,
}

impl RtcPeerLinkFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Register the audio/video codecs the call negotiates.
    fn register_codecs(media_engine: &mut MediaEngine) -> Result<(), CallError> {
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| CallError::NegotiationFailure(format!("Failed to register Opus: {}", e)))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: "".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| CallError::NegotiationFailure(format!("Failed to register VP8: {}", e)))?;

        Ok(())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    type Link = RtcPeerLink;

    async fn create(
        &self,
        tracks: Option<&MediaTracks>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<RtcPeerLink>, CallError> {
        let mut media_engine = MediaEngine::default();
        Self::register_codecs(&mut media_engine)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            CallError::NegotiationFailure(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_configuration()).await.map_err(
            |e| CallError::NegotiationFailure(format!("Failed to create peer connection: {}", e)),
        )?);

        if let Some(tracks) = tracks {
            pc.add_track(tracks.audio.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    CallError::NegotiationFailure(format!("Failed to add audio track: {}", e))
                })?;
            pc.add_track(tracks.video.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    CallError::NegotiationFailure(format!("Failed to add video track: {}", e))
                })?;
        } else {
            // Trackless link: capture has not completed yet. It will send
            // no outbound media and is deliberately not rebuilt later.
            debug!("Creating peer link without local tracks");
        }

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(LinkEvent::Candidate(CandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let _ = state_tx.send(LinkEvent::StateChanged(LinkState::from(state)));
            })
        }));

        let track_tx = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            Box::pin(async move {
                let _ = track_tx.send(LinkEvent::RemoteTrack {
                    kind: track.kind().to_string(),
                    id: track.id(),
                });
            })
        }));

        Ok(Arc::new(RtcPeerLink { pc }))
    }
}

/// A peer link backed by an `RTCPeerConnection`
pub struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, CallError> {
        let result = match desc.kind.as_str() {
            "offer" => RTCSessionDescription::offer(desc.sdp.clone()),
            "answer" => RTCSessionDescription::answer(desc.sdp.clone()),
            other => {
                return Err(CallError::NegotiationFailure(format!(
                    "Unsupported description type: {}",
                    other
                )))
            }
        };
        result.map_err(|e| CallError::NegotiationFailure(format!("Invalid SDP: {}", e)))
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::NegotiationFailure(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            CallError::NegotiationFailure(format!("Failed to create answer: {}", e))
        })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = Self::to_rtc(&desc)?;
        self.pc.set_local_description(desc).await.map_err(|e| {
            CallError::NegotiationFailure(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let desc = Self::to_rtc(&desc)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            CallError::NegotiationFailure(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(|e| {
            CallError::NegotiationFailure(format!("Failed to add ICE candidate: {}", e))
        })
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Peer link close failed: {}", e);
        }
    }
}
