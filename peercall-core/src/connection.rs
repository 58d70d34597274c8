//! Peer connection capability
//!
//! The engine never touches a concrete peer connection. It drives the
//! [`Connection`] trait, which exposes only what offer/answer negotiation and
//! in-place track replacement need. Any standards-compliant real-time
//! transport can implement it; see `webrtc_backend` for the `webrtc` crate.

use crate::media::LocalTrack;
use crate::types::{IceCandidate, MediaKind, PeerId, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Connection backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Description was rejected by the backend
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Candidate could not be applied
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Track could not be attached or swapped
    #[error("Track error: {0}")]
    Track(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,

    /// Anything else the backend reports
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Offer/answer state of a connection, as defined by JSEP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer set, waiting for the answer
    HaveLocalOffer,
    /// Remote offer set, answer not yet set
    HaveRemoteOffer,
    /// Connection closed
    Closed,
}

/// Transport-level state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing attempted
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path up
    Connected,
    /// Media path lost; may recover on its own
    Disconnected,
    /// Media path lost for good
    Failed,
    /// Closed locally
    Closed,
}

/// Notification raised by a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A local candidate was gathered and must be sent to the remote peer
    LocalCandidate(IceCandidate),
    /// Transport state changed
    StateChanged(ConnectionState),
}

/// Receiving half of a connection's event stream
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Outgoing media sender of a connection
#[async_trait]
pub trait RtpSender: Send + Sync {
    /// Kind of media this sender carries
    fn kind(&self) -> MediaKind;

    /// Swap the outgoing track without renegotiation
    async fn replace_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError>;
}

/// Peer connection capability
#[async_trait]
pub trait Connection: Send + Sync {
    /// Generate an offer; does not apply it
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Generate an answer to the applied remote offer; does not apply it
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Apply a locally generated description
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), ConnectionError>;

    /// Apply the remote peer's description
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Whether a remote description has been applied
    async fn has_remote_description(&self) -> bool;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Attach a local track, creating its sender
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), ConnectionError>;

    /// Senders created by `add_track`
    async fn senders(&self) -> Vec<Arc<dyn RtpSender>>;

    /// Close the connection; further calls fail with `Closed`
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Creates one connection per call
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection towards `peer` together with its event stream
    async fn create(
        &self,
        peer: &PeerId,
    ) -> Result<(Arc<dyn Connection>, ConnectionEvents), ConnectionError>;
}
