//! Scripted collaborators for driving `CallManager` in tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_core::{
    connection::{
        Connection, ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionFactory,
        RtpSender, SignalingState,
    },
    media::{LocalTrack, MediaError, MediaSource},
    signaling::{SignalingHandler, SignalingMessage, SignalingTransport},
    types::{IceCandidate, MediaConstraints, MediaKind, PeerId, SdpKind, SessionDescription},
    CallId, CallManager, CallManagerConfig,
};
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";

pub fn peer(name: &str) -> PeerId {
    PeerId::new(name)
}

pub fn candidate(n: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MockTrack {
    pub fn new(id: &str, kind: MediaKind) -> Arc<dyn LocalTrack> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
        })
    }
}

impl LocalTrack for MockTrack {
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

#[derive(Default)]
pub struct MockMediaSource {
    pub deny: AtomicBool,
    pub requests: AtomicUsize,
    pub live: Mutex<HashSet<String>>,
    pub stopped: Mutex<Vec<String>>,
    /// When set, acquisition waits for a notification
    pub gate: Mutex<Option<Arc<Notify>>>,
}

impl MockMediaSource {
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn get_local_tracks(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("camera blocked".to_string()));
        }

        let tracks: Vec<Arc<dyn LocalTrack>> = constraints
            .kinds()
            .into_iter()
            .map(|kind| MockTrack::new(&format!("{kind}-{n}"), kind))
            .collect();
        let mut live = self.live.lock();
        for track in &tracks {
            live.insert(track.id().to_string());
        }
        Ok(tracks)
    }

    fn stop_track(&self, track: &dyn LocalTrack) {
        self.live.lock().remove(track.id());
        self.stopped.lock().push(track.id().to_string());
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct MockSender {
    pub kind: MediaKind,
    pub track: Mutex<String>,
    pub fail: AtomicBool,
}

#[async_trait]
impl RtpSender for MockSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Track("sender gone".to_string()));
        }
        *self.track.lock() = track.id().to_string();
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MockState {
    pub signaling: Option<SignalingState>,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub remote_sets: usize,
    pub applied_candidates: Vec<String>,
    pub tracks: Vec<String>,
    pub closed: bool,
}

/// Peer connection that enforces JSEP ordering rules
pub struct MockConnection {
    pub label: String,
    pub state: Mutex<MockState>,
    pub senders: Mutex<Vec<Arc<MockSender>>>,
    pub offers_created: AtomicUsize,
    /// When set, `set_remote_description` waits for a notification
    pub remote_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockConnection {
    fn new(label: String) -> Self {
        Self {
            label,
            state: Mutex::new(MockState {
                signaling: Some(SignalingState::Stable),
                ..Default::default()
            }),
            senders: Mutex::new(Vec::new()),
            offers_created: AtomicUsize::new(0),
            remote_gate: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> MockState {
        self.state.lock().clone()
    }

    pub fn signaling_state_now(&self) -> SignalingState {
        self.state.lock().signaling.unwrap_or(SignalingState::Stable)
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn sender(&self, kind: MediaKind) -> Option<Arc<MockSender>> {
        self.senders.lock().iter().find(|s| s.kind == kind).cloned()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        if self.state.lock().closed {
            return Err(ConnectionError::Closed);
        }
        let n = self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("v=0 offer {} #{n}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let state = self.state.lock();
        if state.signaling != Some(SignalingState::HaveRemoteOffer) {
            return Err(ConnectionError::InvalidDescription(
                "no remote offer to answer".to_string(),
            ));
        }
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.label)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, Some(SignalingState::Stable)) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, Some(SignalingState::HaveRemoteOffer)) => SignalingState::Stable,
            (kind, current) => {
                return Err(ConnectionError::InvalidDescription(format!(
                    "local {kind:?} in {current:?}"
                )))
            }
        };
        state.signaling = Some(next);
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let gate = self.remote_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if desc.sdp.contains("malformed") {
            return Err(ConnectionError::InvalidDescription(
                "unparseable SDP".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let next = match (desc.kind, state.signaling) {
            (SdpKind::Offer, Some(SignalingState::Stable)) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, Some(SignalingState::HaveLocalOffer)) => SignalingState::Stable,
            (kind, current) => {
                return Err(ConnectionError::InvalidDescription(format!(
                    "remote {kind:?} in {current:?}"
                )))
            }
        };
        state.signaling = Some(next);
        state.remote = Some(desc);
        state.remote_sets += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling.unwrap_or(SignalingState::Stable)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(ConnectionError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }
        state.applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError> {
        self.state.lock().tracks.push(track.id().to_string());
        self.senders.lock().push(Arc::new(MockSender {
            kind: track.kind(),
            track: Mutex::new(track.id().to_string()),
            fail: AtomicBool::new(false),
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
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = Some(SignalingState::Closed);
        Ok(())
    }
}

pub struct CreatedConnection {
    pub peer: PeerId,
    pub connection: Arc<MockConnection>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

#[derive(Default)]
pub struct MockConnectionFactory {
    pub created: Mutex<Vec<CreatedConnection>>,
    pub fail: AtomicBool,
}

impl MockConnectionFactory {
    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.created.lock().last().map(|c| Arc::clone(&c.connection))
    }

    pub fn events(&self) -> Option<mpsc::UnboundedSender<ConnectionEvent>> {
        self.created.lock().last().map(|c| c.events.clone())
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn Connection>, ConnectionEvents), ConnectionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Backend("no network".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection::new(peer.to_string()));
        self.created.lock().push(CreatedConnection {
            peer: peer.clone(),
            connection: Arc::clone(&connection),
            events: tx,
        });
        Ok((connection, rx))
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockTransportError;

impl std::fmt::Display for MockTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay unreachable")
    }
}

impl std::error::Error for MockTransportError {}

/// Records outbound messages; never delivers anything inbound
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(PeerId, SignalingMessage)>>,
    pub offline: AtomicBool,
}

impl RecordingTransport {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|(_, m)| m.kind()).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|(_, m)| m.kind() == kind).count()
    }

    pub fn last(&self) -> Option<SignalingMessage> {
        self.sent.lock().last().map(|(_, m)| m.clone())
    }

    pub fn offer_sdp(&self) -> Option<String> {
        self.sent.lock().iter().find_map(|(_, m)| match m {
            SignalingMessage::Offer { sdp, .. } => Some(sdp.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    type Error = MockTransportError;

    async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), MockTransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MockTransportError);
        }
        self.sent.lock().push((peer.clone(), message));
        Ok(())
    }

    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), MockTransportError> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub manager: CallManager<RecordingTransport>,
    pub transport: Arc<RecordingTransport>,
    pub factory: Arc<MockConnectionFactory>,
    pub media: Arc<MockMediaSource>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallManagerConfig::default())
    }

    pub fn with_config(config: CallManagerConfig) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let factory = Arc::new(MockConnectionFactory::default());
        let media = Arc::new(MockMediaSource::default());
        let manager = CallManager::new(
            config,
            Arc::new(SignalingHandler::new(Arc::clone(&transport))),
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            Arc::clone(&media) as Arc<dyn MediaSource>,
        )
        .unwrap();
        Self {
            manager,
            transport,
            factory,
            media,
        }
    }

    /// Bob calls us: `initiate` followed by `offer`
    pub async fn ring(&self, call_id: CallId) {
        self.manager
            .handle_signal(
                &peer(BOB),
                SignalingMessage::Initiate {
                    call_id,
                    constraints: MediaConstraints::audio_only(),
                },
            )
            .await
            .unwrap();
    }

    pub async fn offer(&self, call_id: CallId) {
        self.manager
            .handle_remote_offer(&peer(BOB), call_id, "v=0 offer from bob".to_string())
            .await
            .unwrap();
    }
}
