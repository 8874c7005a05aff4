//! Peer connection manager: one WebRTC peer per session, configured for a
//! host-network deployment (no STUN, host candidates rewritten to the LAN
//! address, container bridge interfaces excluded).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use airbridge_protocol::{CandidateInit, IceConfig, SignalMessage};
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::capture::VIDEO_PAYLOAD_TYPE;
use crate::controller::Controller;
use crate::debug::DebugHub;
use crate::signaling::SignalWriter;

/// fmtp matching what the encoder produces; registered on the payload type
/// the encoder is told to emit so the browser binds the right stream.
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f";

struct MediaTracks {
    video: Arc<TrackLocalStaticRTP>,
    audio: Arc<TrackLocalStaticRTP>,
}

/// One peer connection and its (lazily created) local tracks.
pub struct PeerHandle {
    pc: Arc<RTCPeerConnection>,
    media: Mutex<Option<MediaTracks>>,
    /// Set by `close()` so the post-close callback storm is not mistaken
    /// for a terminal failure.
    closed: Arc<AtomicBool>,
}

impl PeerHandle {
    /// Build the peer connection. Codecs: the defaults plus H.264 pinned to
    /// the encoder's payload type.
    pub async fn new(ice: &IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("failed to register default codecs")?;
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: H264_FMTP.to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: VIDEO_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .context("failed to register H.264 codec")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("failed to register interceptors")?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Udp6]);
        // Host networking: candidates on the Docker bridge are unreachable
        // from the browser and only slow down ICE.
        setting_engine.set_interface_filter(Box::new(|name: &str| {
            name != "docker0" && !name.starts_with("br-") && !name.starts_with("veth")
        }));
        if !ice.nat_host_ip.is_empty() {
            setting_engine
                .set_nat_1to1_ips(vec![ice.nat_host_ip.clone()], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        // No STUN servers: host candidates only.
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .context("failed to create peer connection")?;

        Ok(Self {
            pc: Arc::new(pc),
            media: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Accept a remote offer. Track setup and capture start happen between
    /// this and [`create_answer`] so the answer advertises the media.
    pub async fn accept_offer(&self, sdp: &str) -> Result<()> {
        for line in sdp.lines() {
            if line.starts_with("m=") || line.starts_with("a=rtpmap:") {
                debug!(sdp_line = line, "offer SDP");
            }
        }

        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("failed to parse SDP offer")?;
        self.pc
            .set_remote_description(offer)
            .await
            .context("failed to set remote description")?;
        Ok(())
    }

    /// Produce and install the local answer for the accepted offer.
    pub async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("failed to set local description")?;

        for line in answer.sdp.lines() {
            if line.starts_with("m=") || line.starts_with("a=rtpmap:") {
                debug!(sdp_line = line, "answer SDP");
            }
        }
        Ok(answer.sdp)
    }

    /// Create the H.264 + Opus track pair and add them to the peer
    /// connection. Idempotent: later calls return the existing tracks.
    pub async fn ensure_tracks(
        &self,
    ) -> Result<(Arc<TrackLocalStaticRTP>, Arc<TrackLocalStaticRTP>)> {
        let mut media = self.media.lock().await;
        if let Some(m) = media.as_ref() {
            return Ok((Arc::clone(&m.video), Arc::clone(&m.audio)));
        }

        let video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "airbridge".to_string(),
        ));
        let audio = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "airbridge".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add video track")?;
        self.pc
            .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add audio track")?;

        info!("media tracks added to peer connection");
        *media = Some(MediaTracks {
            video: Arc::clone(&video),
            audio: Arc::clone(&audio),
        });
        Ok((video, audio))
    }

    /// Whether the track pair has been created (i.e. a first offer has been
    /// fully processed).
    pub async fn has_media(&self) -> bool {
        self.media.lock().await.is_some()
    }

    /// Add a trickled remote candidate. Callers drop failures: duplicate or
    /// late candidates are expected around renegotiation.
    pub async fn add_remote_candidate(&self, candidate: &CandidateInit) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("failed to add ICE candidate")?;
        debug!(candidate = %candidate.candidate, "ICE candidate added");
        Ok(())
    }

    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.pc.ice_connection_state()
    }

    /// Idempotent teardown.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .close()
            .await
            .context("failed to close peer connection")?;
        info!("peer connection closed");
        Ok(())
    }
}

/// Build a peer with all callbacks wired: trickled candidates out through
/// the signaling channel, terminal states into the controller.
pub async fn create_peer(
    ice: &IceConfig,
    controller: Arc<Controller>,
    signal: Arc<SignalWriter>,
    session_id: Uuid,
    debug_hub: Arc<DebugHub>,
) -> Result<Arc<PeerHandle>> {
    let peer = Arc::new(PeerHandle::new(ice).await?);

    let sig = Arc::clone(&signal);
    peer.pc.on_ice_candidate(Box::new(move |candidate| {
        let sig = Arc::clone(&sig);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("ICE gathering completed");
                return;
            };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!("failed to serialize ICE candidate: {e}");
                    return;
                }
            };
            let msg = SignalMessage::IceCandidate {
                candidate: CandidateInit {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                },
            };
            if let Err(e) = sig.send(&msg).await {
                warn!("failed to send ICE candidate: {e}");
            }
        })
    }));

    {
        let controller = Arc::clone(&controller);
        let sig = Arc::clone(&signal);
        let dbg = Arc::clone(&debug_hub);
        let closed = Arc::clone(&peer.closed);
        peer.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                info!(%state, "ICE connection state changed");
                let controller = Arc::clone(&controller);
                let sig = Arc::clone(&sig);
                let dbg = Arc::clone(&dbg);
                let closed = Arc::clone(&closed);
                Box::pin(async move {
                    match state {
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                            dbg.success(
                                "WEBRTC",
                                "ice_connected",
                                "ICE connection established",
                                Some(serde_json::json!({"sessionID": session_id.to_string()})),
                            );
                            let _ = sig
                                .send(&SignalMessage::Status {
                                    message: "ICE connected - media flowing".to_string(),
                                })
                                .await;
                        }
                        RTCIceConnectionState::Failed
                        | RTCIceConnectionState::Disconnected
                        | RTCIceConnectionState::Closed => {
                            if !closed.load(Ordering::SeqCst) {
                                dbg.error(
                                    "WEBRTC",
                                    "ice_terminal",
                                    format!("ICE connection {state}"),
                                    None,
                                );
                                tokio::spawn(async move {
                                    controller
                                        .on_peer_terminal(session_id, &format!("ice {state}"))
                                        .await;
                                });
                            }
                        }
                        _ => {}
                    }
                })
            }));
    }

    {
        let controller = Arc::clone(&controller);
        let closed = Arc::clone(&peer.closed);
        peer.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                info!(%state, "peer connection state changed");
                let controller = Arc::clone(&controller);
                let closed = Arc::clone(&closed);
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) && !closed.load(Ordering::SeqCst)
                    {
                        tokio::spawn(async move {
                            controller
                                .on_peer_terminal(session_id, &format!("peer connection {state}"))
                                .await;
                        });
                    }
                })
            }));
    }

    info!(%session_id, "peer connection created");
    Ok(peer)
}

/// Log connection/ICE state every 3 s until the session is cancelled or the
/// peer reaches a terminal state.
pub fn spawn_state_ticker(peer: Arc<PeerHandle>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let conn = peer.connection_state();
                    let ice = peer.ice_connection_state();
                    debug!(%conn, %ice, "peer connection state");
                    if matches!(
                        conn,
                        RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
                    ) {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ice() -> IceConfig {
        IceConfig {
            nat_host_ip: String::new(),
        }
    }

    #[tokio::test]
    async fn tracks_are_created_once() {
        let peer = PeerHandle::new(&test_ice()).await.unwrap();
        assert!(!peer.has_media().await);
        let (v1, a1) = peer.ensure_tracks().await.unwrap();
        let (v2, a2) = peer.ensure_tracks().await.unwrap();
        assert!(Arc::ptr_eq(&v1, &v2));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(peer.has_media().await);
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_offer_is_rejected() {
        let peer = PeerHandle::new(&test_ice()).await.unwrap();
        assert!(peer.accept_offer("this is not sdp").await.is_err());
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let peer = PeerHandle::new(&test_ice()).await.unwrap();
        peer.close().await.unwrap();
        peer.close().await.unwrap();
    }
}
