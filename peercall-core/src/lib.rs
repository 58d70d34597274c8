//! peercall - offer/answer negotiation engine for one-to-one calls
//!
//! The engine sits between a signaling relay, a local capture subsystem and a
//! peer connection. It gets SDP and ICE candidates across in the right order
//! even when signaling reorders or duplicates them:
//!
//! - **Offer buffering**: an offer that arrives while the callee is still
//!   ringing waits until local media is ready
//! - **Candidate queueing**: candidates that beat their description are
//!   applied in arrival order once it lands
//! - **Guards**: duplicate offers and stale answers are dropped
//! - **Disconnect grace**: a transient transport drop only ends the call if it
//!   outlasts a configurable window
//! - **Track replacement**: swap camera or microphone without renegotiating
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use peercall_core::transport::MemorySignalingBus;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = MemorySignalingBus::new();
//! let signaling = Arc::new(SignalingHandler::new(Arc::new(bus.connect("alice"))));
//!
//! let service = CallService::builder(signaling).build()?;
//! service.start()?;
//!
//! let call_id = service
//!     .start_call(PeerId::new("bob"), MediaConstraints::video_call())
//!     .await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core types and data structures
pub mod types;

/// Signaling protocol and handlers
pub mod signaling;

/// In-process signaling transport
pub mod transport;

/// Local media boundary
pub mod media;

/// Peer connection capability
pub mod connection;

/// Remote ICE candidate buffering
pub mod candidate_queue;

/// Per-call state
pub mod session;

/// Call management and negotiation
pub mod call;

/// Service orchestration
pub mod service;

/// `webrtc` crate backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

pub use call::{CallError, CallManager, CallManagerConfig, NegotiationSnapshot};
pub use candidate_queue::{CandidateQueue, DrainReport};
pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionFactory,
    ConnectionState, RtpSender, SignalingState,
};
pub use media::{LocalTrack, MediaError, MediaSource};
pub use service::{CallService, CallServiceBuilder, ServiceConfig, ServiceError};
pub use session::CallSession;
pub use signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
pub use types::*;

#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{RtcLocalTrack, WebRtcConnectionFactory, WebRtcMediaSource};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CallError, CallEvent, CallId, CallManager, CallManagerConfig, CallService, CallSnapshot,
        CallStatus, EndReason, MediaConstraints, PeerId, ServiceConfig, SignalingHandler,
        SignalingMessage, SignalingTransport,
    };
}
