//! `webrtc` crate backend
//!
//! Implements [`Connection`], [`ConnectionFactory`] and [`MediaSource`] over
//! `RTCPeerConnection`. Local tracks are `TrackLocalStaticSample`s (Opus for
//! audio, VP8 for video); feeding them samples is up to the capture side.

use crate::connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionFactory,
    ConnectionState, RtpSender, SignalingState,
};
use crate::media::{LocalTrack, MediaError, MediaSource};
use crate::types::{IceCandidate, MediaConstraints, MediaKind, PeerId, SdpKind, SessionDescription};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn backend(err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Backend(err.to_string())
}

fn build_api() -> anyhow::Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("Failed to register default codecs")?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .context("Failed to register default interceptors")?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_description(desc: SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).context("Malformed offer")?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).context("Malformed answer")?,
    };
    Ok(rtc)
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

/// Local track backed by a `TrackLocalStaticSample`
#[derive(Debug)]
pub struct RtcLocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
}

impl RtcLocalTrack {
    /// Create a track of `kind` with the default codec for it
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            "peercall".to_string(),
        ));
        Self { id, kind, track }
    }

    /// Underlying sample track, for writing media
    #[must_use]
    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }
}

impl LocalTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn rtc_track(track: &dyn LocalTrack) -> Result<&RtcLocalTrack, ConnectionError> {
    track.as_any().downcast_ref::<RtcLocalTrack>().ok_or_else(|| {
        ConnectionError::Track(format!("Track {} is not backed by webrtc", track.id()))
    })
}

/// Media source producing sample tracks
///
/// Keeps the ids of tracks handed out and not yet stopped.
#[derive(Debug, Default)]
pub struct WebRtcMediaSource {
    live: Mutex<HashSet<String>>,
}

impl WebRtcMediaSource {
    /// Create new media source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracks handed out and not yet stopped
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl MediaSource for WebRtcMediaSource {
    async fn get_local_tracks(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        let mut live = self.live.lock();
        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let track = RtcLocalTrack::new(kind);
                live.insert(track.id.clone());
                Arc::new(track) as Arc<dyn LocalTrack>
            })
            .collect();
        Ok(tracks)
    }

    fn stop_track(&self, track: &dyn LocalTrack) {
        if !self.live.lock().remove(track.id()) {
            tracing::debug!(track_id = %track.id(), "Track already stopped");
        }
    }
}

/// Sender created when a local track was attached
pub struct WebRtcSender {
    kind: MediaKind,
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl RtpSender for WebRtcSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        if track.kind() != self.kind {
            return Err(ConnectionError::Track(format!(
                "Cannot send {} on a {} sender",
                track.kind(),
                self.kind
            )));
        }
        let rtc = rtc_track(track.as_ref())?;
        self.sender
            .replace_track(Some(rtc.as_track_local()))
            .await
            .map_err(|e| ConnectionError::Track(e.to_string()))
    }
}

/// `RTCPeerConnection` behind the [`Connection`] capability
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<WebRtcSender>>>,
}

impl WebRtcConnection {
    /// Underlying peer connection
    #[must_use]
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl Connection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let rtc = to_rtc_description(desc)
            .map_err(|e| ConnectionError::InvalidDescription(format!("{e:#}")))?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| ConnectionError::InvalidDescription(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let rtc = to_rtc_description(desc)
            .map_err(|e| ConnectionError::InvalidDescription(format!("{e:#}")))?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| ConnectionError::InvalidDescription(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| ConnectionError::InvalidCandidate(e.to_string()))
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        let rtc = rtc_track(track.as_ref())?;
        let sender = self
            .pc
            .add_track(rtc.as_track_local())
            .await
            .map_err(|e| ConnectionError::Track(e.to_string()))?;

        self.senders.lock().push(Arc::new(WebRtcSender {
            kind: track.kind(),
            sender,
        }));
        Ok(())
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn RtpSender>)
            .collect()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.pc.close().await.map_err(backend)
    }
}

/// Creates `RTCPeerConnection`s sharing one API instance
pub struct WebRtcConnectionFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcConnectionFactory {
    /// Create a factory with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, ConnectionError> {
        let api = build_api().map_err(|e| ConnectionError::Backend(format!("{e:#}")))?;
        Ok(Self {
            api,
            ice_servers: Vec::new(),
        })
    }

    /// Use STUN/TURN servers; host candidates only by default
    #[must_use]
    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = urls;
        self
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn Connection>, ConnectionEvents), ConnectionError> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);
        let (tx, rx) = mpsc::unbounded_channel();

        let candidates = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode local candidate"),
                }
            })
        }));

        let states = tx;
        let remote = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(peer = %remote, state = ?state, "Peer connection state changed");
            if let Some(state) = map_connection_state(state) {
                let _ = states.send(ConnectionEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        tracing::debug!(peer = %peer, "Peer connection created");
        let connection = WebRtcConnection {
            pc,
            senders: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(connection), rx))
    }
}
