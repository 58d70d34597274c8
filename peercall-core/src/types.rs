//! Call types and data structures

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a remote participant
///
/// Opaque to the engine; the signaling transport decides what it means.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for one call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the call the local participant is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Started the call and sends the offer
    Caller,
    /// Received the call and sends the answer
    Callee,
}

/// Kind of an outgoing media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera or screen video
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Media kinds requested by these constraints
    pub fn kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Which half of an offer/answer exchange a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media line hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Call status as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Call announced, nothing negotiated yet
    Ringing,
    /// Connection exists, media path being established
    Connecting,
    /// Media is flowing
    Connected,
    /// Terminal
    Ended,
}

impl CallStatus {
    /// Whether the lifecycle allows moving from `self` to `to`
    ///
    /// Reconnection inside the grace window is not a transition: the status
    /// stays where it was while the timer is armed.
    #[must_use]
    pub fn can_transition_to(self, to: CallStatus) -> bool {
        matches!(
            (self, to),
            (CallStatus::Ringing, CallStatus::Connecting)
                | (CallStatus::Ringing, CallStatus::Ended)
                | (CallStatus::Connecting, CallStatus::Connected)
                | (CallStatus::Connecting, CallStatus::Ended)
                | (CallStatus::Connected, CallStatus::Ended)
        )
    }

    /// Whether the status owns a live connection
    #[must_use]
    pub fn has_connection(self) -> bool {
        matches!(self, CallStatus::Connecting | CallStatus::Connected)
    }

    /// `Ended` is absorbing
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == CallStatus::Ended
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Why a call reached `Ended`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local hangup
    LocalHangup,
    /// Remote sent `end`
    RemoteHangup,
    /// Local side declined a ringing call
    Rejected,
    /// Remote sent `reject`
    RemoteRejected,
    /// Description could not be applied
    NegotiationFailed(String),
    /// Transport reported an unrecoverable failure
    ConnectionFailed(String),
    /// Transport stayed disconnected for the whole grace window
    DisconnectTimeout,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("hung up"),
            Self::RemoteHangup => f.write_str("remote hung up"),
            Self::Rejected => f.write_str("rejected"),
            Self::RemoteRejected => f.write_str("remote rejected"),
            Self::NegotiationFailed(e) => write!(f, "negotiation failed: {e}"),
            Self::ConnectionFailed(e) => write!(f, "connection failed: {e}"),
            Self::DisconnectTimeout => f.write_str("connection lost"),
        }
    }
}

/// Read-only view of a session for the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Remote participant
    pub peer: PeerId,
    /// Call identifier
    pub call_id: CallId,
    /// Local role
    pub role: CallRole,
    /// Current status
    pub status: CallStatus,
    /// Time spent connected, if the call ever connected
    pub duration: Option<std::time::Duration>,
    /// Last user-visible error
    pub last_error: Option<String>,
    /// Why the call ended, once it has
    pub end_reason: Option<EndReason>,
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// A remote peer announced a call
    IncomingCall {
        /// Who is calling
        peer: PeerId,
        /// Call identifier
        call_id: CallId,
        /// Requested media
        constraints: MediaConstraints,
    },
    /// Status transition
    StatusChanged {
        /// Remote participant
        peer: PeerId,
        /// Call identifier
        call_id: CallId,
        /// Previous status
        from: CallStatus,
        /// New status
        to: CallStatus,
    },
    /// Call reached `Ended`
    CallEnded {
        /// Remote participant
        peer: PeerId,
        /// Call identifier
        call_id: CallId,
        /// Why
        reason: EndReason,
    },
    /// User-visible error that did not end the call
    Error {
        /// Remote participant
        peer: PeerId,
        /// Error description
        error: String,
    },
}
