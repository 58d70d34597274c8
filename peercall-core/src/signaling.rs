//! Call signaling protocol
//!
//! Carries offers, answers and ICE candidates between the two participants
//! through an external relay. Delivery is at-least-once and kinds are not
//! ordered relative to each other.

use crate::types::{CallId, IceCandidate, MediaConstraints, PeerId, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Maximum SDP string length accepted from the wire
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum candidate line length accepted from the wire
pub const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Message failed validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Transport shut down
    #[error("Transport closed")]
    Closed,
}

/// Signaling transport trait
///
/// Implement this for the relay in use (websocket, DHT, in-memory...).
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a signaling message; fire-and-forget
    async fn send_message(&self, peer: &PeerId, message: SignalingMessage)
        -> Result<(), Self::Error>;

    /// Receive the next signaling message from any peer
    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), Self::Error>;

    /// Whether `error` means the transport is gone for good
    fn is_closed(&self, _error: &Self::Error) -> bool {
        false
    }
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Announce a call so the callee can ring
    Initiate {
        /// Call identifier
        call_id: CallId,
        /// Requested media
        constraints: MediaConstraints,
    },

    /// SDP offer
    Offer {
        /// Call identifier
        call_id: CallId,
        /// SDP content
        sdp: String,
    },

    /// SDP answer
    Answer {
        /// Call identifier
        call_id: CallId,
        /// SDP content
        sdp: String,
    },

    /// ICE candidate
    IceCandidate {
        /// Call identifier
        call_id: CallId,
        /// Candidate string
        candidate: String,
        /// SDP mid
        sdp_mid: Option<String>,
        /// SDP mline index
        sdp_mline_index: Option<u16>,
    },

    /// Hang up
    End {
        /// Call identifier
        call_id: CallId,
        /// Optional reason
        reason: Option<String>,
    },

    /// Decline a ringing call
    Reject {
        /// Call identifier
        call_id: CallId,
        /// Optional reason
        reason: Option<String>,
    },
}

impl SignalingMessage {
    /// Get the call ID
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::Initiate { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::End { call_id, .. }
            | Self::Reject { call_id, .. } => *call_id,
        }
    }

    /// Wire name of the message kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "initiate",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::End { .. } => "end",
            Self::Reject { .. } => "reject",
        }
    }

    /// Build an offer or answer message from a description
    #[must_use]
    pub fn description(call_id: CallId, desc: SessionDescription) -> Self {
        match desc.kind {
            crate::types::SdpKind::Offer => Self::Offer {
                call_id,
                sdp: desc.sdp,
            },
            crate::types::SdpKind::Answer => Self::Answer {
                call_id,
                sdp: desc.sdp,
            },
        }
    }

    /// Build a candidate message
    #[must_use]
    pub fn candidate(call_id: CallId, candidate: IceCandidate) -> Self {
        Self::IceCandidate {
            call_id,
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }

    /// Check size limits before the message reaches the engine
    ///
    /// # Errors
    ///
    /// Returns error if a field exceeds its limit
    pub fn validate(&self) -> Result<(), SignalingError> {
        match self {
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } if sdp.len() > MAX_SDP_LENGTH => {
                Err(SignalingError::InvalidMessage(format!(
                    "SDP length {} exceeds maximum of {}",
                    sdp.len(),
                    MAX_SDP_LENGTH
                )))
            }
            Self::IceCandidate { candidate, .. } if candidate.len() > MAX_CANDIDATE_LENGTH => {
                Err(SignalingError::InvalidMessage(format!(
                    "Candidate length {} exceeds maximum of {}",
                    candidate.len(),
                    MAX_CANDIDATE_LENGTH
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Upper bound for the receive back-off multiplier
const MAX_BACKOFF_STEPS: u32 = 10;

/// Signaling handler with receive back-off
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    error_count: Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            error_count: Mutex::new(0),
        }
    }

    /// Send a signaling message to a peer
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(peer = %peer, kind = message.kind(), call_id = %message.call_id()))]
    pub async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport
            .send_message(peer, message)
            .await
            .map_err(|e| SignalingError::TransportError(e.to_string()))
    }

    /// Receive a signaling message, backing off after consecutive errors
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails or the message is invalid
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), SignalingError> {
        match self.transport.receive_message().await {
            Ok((peer, message)) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(peer = %peer, kind = message.kind(), "Received signaling message");
                message.validate()?;
                Ok((peer, message))
            }
            Err(e) if self.transport.is_closed(&e) => {
                tracing::info!("Signaling transport closed");
                Err(SignalingError::Closed)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff = Duration::from_millis(100 * u64::from(count.min(MAX_BACKOFF_STEPS)));
                tracing::warn!(
                    error_count = count,
                    backoff = ?backoff,
                    error = %e,
                    "Error receiving message, backing off"
                );
                sleep(backoff).await;

                Err(SignalingError::TransportError(e.to_string()))
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}
