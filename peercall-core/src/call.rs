//! Call management and offer/answer negotiation
//!
//! [`CallManager`] owns every [`CallSession`] and is the only thing that
//! mutates them. All inputs (UI calls, inbound signaling, connection events,
//! timer firings) take the registry lock for the whole transition, so they
//! never interleave. Two slow steps run outside the lock: local media
//! acquisition, and applying a remote offer (guarded by
//! `negotiation_in_flight`). The session is re-validated once they complete.
//!
//! # Call Flow
//!
//! ```text
//!   caller                                   callee
//!   start_call ── initiate ─────────────▶  Ringing
//!   Connecting ── offer ────────────────▶  (buffered until media ready)
//!              ◀─ ice-candidate ──────────  accept_call ─▶ Connecting
//!              ◀─ answer ─────────────────
//!   Connected  ◀═══════ media ═══════════▶  Connected
//!   end_call   ── end ──────────────────▶  Ended
//! ```
//!
//! Candidates that beat their description are parked in the session's
//! [`CandidateQueue`](crate::candidate_queue::CandidateQueue) and applied in
//! arrival order as soon as the description is set.

use crate::connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionEvents, ConnectionFactory,
    ConnectionState, SignalingState,
};
use crate::media::{self, LocalTrack, MediaError, MediaSource};
use crate::session::{CallSession, GraceTimer};
use crate::signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{
    CallEvent, CallId, CallRole, CallSnapshot, CallStatus, EndReason, IceCandidate, MediaKind,
    MediaConstraints, PeerId, SessionDescription,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Call management errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Capture denied or missing; retry is possible
    #[error("Local media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    /// Description could not be generated or applied; the call is over
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Message discarded by a guard; never surfaced to callers
    #[error("Stale message: {0}")]
    StaleMessage(String),

    /// Outbound signaling failed
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Operation needs a live connection
    #[error("No active session with {0}")]
    NoActiveSession(PeerId),

    /// No session with that peer
    #[error("Call not found: {0}")]
    CallNotFound(PeerId),

    /// A call with that peer is already in progress
    #[error("Call with {0} already in progress")]
    SessionExists(PeerId),

    /// Lifecycle forbids the transition
    #[error("Invalid call state transition from {from} to {to}")]
    InvalidState {
        /// Current status
        from: CallStatus,
        /// Requested status
        to: CallStatus,
    },

    /// Connection has no sender for that kind
    #[error("No {0} sender on the connection")]
    NoSender(MediaKind),

    /// Connection backend failure outside negotiation
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::TransportFailure(err.to_string())
    }
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// How long a transient disconnect may last before the call is ended
    pub disconnect_grace: Duration,
    /// Maximum concurrent calls
    pub max_concurrent_calls: usize,
    /// Constraints assumed for incoming calls until `initiate` says otherwise
    pub default_constraints: MediaConstraints,
    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_secs(5),
            max_concurrent_calls: 10,
            default_constraints: MediaConstraints::video_call(),
            event_channel_capacity: 100,
        }
    }
}

impl CallManagerConfig {
    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the offending field
    pub fn validate(&self) -> Result<(), CallError> {
        if self.disconnect_grace.is_zero() {
            return Err(CallError::ConfigError(
                "disconnect_grace must be non-zero".to_string(),
            ));
        }
        if self.max_concurrent_calls == 0 {
            return Err(CallError::ConfigError(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CallError::ConfigError(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Negotiation internals of a session, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationSnapshot {
    /// Current status
    pub status: CallStatus,
    /// Whether a connection exists
    pub has_connection: bool,
    /// Whether local tracks are acquired
    pub media_ready: bool,
    /// Whether an offer waits for local media
    pub pending_remote_offer: bool,
    /// Remote candidates waiting for a remote description
    pub queued_candidates: usize,
    /// Whether an offer is being processed
    pub negotiation_in_flight: bool,
    /// Whether the disconnect grace timer is armed
    pub grace_armed: bool,
}

/// Message to send to the remote peer on teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    End,
    Reject,
}

/// How an inbound message relates to the registry
enum Route {
    /// Matches the live session for that peer
    Existing,
    /// Nothing live for that peer; message may open a new session
    New,
    /// Belongs to a call that already ended
    Ended,
    /// Peer has a different live call
    Busy,
}

fn route(sessions: &HashMap<PeerId, CallSession>, peer: &PeerId, call_id: CallId) -> Route {
    match sessions.get(peer) {
        None => Route::New,
        Some(s) if s.call_id == call_id && s.status.is_terminal() => Route::Ended,
        Some(s) if s.call_id == call_id => Route::Existing,
        Some(s) if !s.is_live() => Route::New,
        Some(_) => Route::Busy,
    }
}

fn stale(kind: &str, reason: impl std::fmt::Display) -> CallError {
    CallError::StaleMessage(format!("{kind}: {reason}"))
}

/// Swallow guard rejections; they are expected races, not failures
fn absorb(result: Result<(), CallError>) -> Result<(), CallError> {
    match result {
        Err(CallError::StaleMessage(msg)) => {
            tracing::debug!(reason = %msg, "Discarding stale message");
            Ok(())
        }
        other => other,
    }
}

fn negotiation(context: &str, err: ConnectionError) -> CallError {
    CallError::Negotiation(format!("{context}: {err}"))
}

struct Inner<T: SignalingTransport> {
    sessions: Mutex<HashMap<PeerId, CallSession>>,
    signaling: Arc<SignalingHandler<T>>,
    connections: Arc<dyn ConnectionFactory>,
    media: Arc<dyn MediaSource>,
    event_sender: broadcast::Sender<CallEvent>,
    config: CallManagerConfig,
    next_generation: AtomicU64,
}

/// Call manager
///
/// Cheap to clone; clones share the same registry.
pub struct CallManager<T: SignalingTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SignalingTransport> Clone for CallManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SignalingTransport> CallManager<T> {
    /// Create new call manager
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        config: CallManagerConfig,
        signaling: Arc<SignalingHandler<T>>,
        connections: Arc<dyn ConnectionFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let (event_sender, _) = broadcast::channel(config.event_channel_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                signaling,
                connections,
                media,
                event_sender,
                config,
                next_generation: AtomicU64::new(0),
            }),
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Status of the call with `peer`
    pub async fn status(&self, peer: &PeerId) -> Option<CallStatus> {
        self.inner.sessions.lock().await.get(peer).map(CallSession::status)
    }

    /// UI view of the call with `peer`
    pub async fn snapshot(&self, peer: &PeerId) -> Option<CallSnapshot> {
        self.inner.sessions.lock().await.get(peer).map(CallSession::snapshot)
    }

    /// Negotiation internals of the call with `peer`
    pub async fn negotiation_state(&self, peer: &PeerId) -> Option<NegotiationSnapshot> {
        let sessions = self.inner.sessions.lock().await;
        sessions.get(peer).map(|s| NegotiationSnapshot {
            status: s.status(),
            has_connection: s.connection.is_some(),
            media_ready: s.media_ready(),
            pending_remote_offer: s.has_pending_offer(),
            queued_candidates: s.queued_candidates(),
            negotiation_in_flight: s.negotiation_in_flight(),
            grace_armed: s.grace_armed(),
        })
    }

    /// Snapshots of every call that has not ended
    pub async fn active_calls(&self) -> Vec<CallSnapshot> {
        let sessions = self.inner.sessions.lock().await;
        let mut calls: Vec<_> = sessions
            .values()
            .filter(|s| s.is_live())
            .map(CallSession::snapshot)
            .collect();
        calls.sort_by(|a, b| a.peer.cmp(&b.peer));
        calls
    }

    /// Drop the record of the call with `peer`, ending it first if needed
    pub async fn remove_session(&self, peer: &PeerId) -> Option<CallSnapshot> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.get_mut(peer)?;
        self.teardown(session, EndReason::LocalHangup, Some(Notice::End))
            .await;
        sessions.remove(peer).map(|s| s.snapshot())
    }

    // ------------------------------------------------------------------
    // UI-driven operations
    // ------------------------------------------------------------------

    /// Call `peer`
    ///
    /// Acquires local media, creates the connection, and sends `initiate`
    /// followed by the offer. The session is `Connecting` on return.
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if capture fails (no session is left
    /// behind), `SessionExists` if a call with `peer` is in progress, or
    /// `Negotiation` if the offer cannot be generated.
    #[tracing::instrument(skip(self, constraints), fields(peer = %peer))]
    pub async fn start_call(
        &self,
        peer: PeerId,
        constraints: MediaConstraints,
    ) -> Result<CallId, CallError> {
        self.check_can_open(&*self.inner.sessions.lock().await, &peer)?;

        let tracks = self.inner.media.get_local_tracks(&constraints).await?;

        let mut sessions = self.inner.sessions.lock().await;
        if let Err(e) = self.check_can_open(&sessions, &peer) {
            media::stop_all(self.inner.media.as_ref(), &tracks);
            return Err(e);
        }

        let call_id = CallId::new();
        tracing::info!(call_id = %call_id, "Starting call");

        let mut session = CallSession::new(peer.clone(), call_id, CallRole::Caller, constraints);
        session.local_tracks = Some(tracks);
        if let Some(stale) = sessions.insert(peer.clone(), session) {
            tracing::debug!(replaced = %stale.call_id, "Replacing finished or unannounced session");
        }
        let session = sessions
            .get_mut(&peer)
            .ok_or_else(|| CallError::CallNotFound(peer.clone()))?;

        if let Err(e) = self.send_initial_offer(session).await {
            let reason = match &e {
                CallError::Negotiation(msg) => EndReason::NegotiationFailed(msg.clone()),
                other => EndReason::ConnectionFailed(other.to_string()),
            };
            self.teardown(session, reason, None).await;
            return Err(e);
        }

        Ok(call_id)
    }

    /// Accept the ringing call from `peer`
    ///
    /// Acquires local media and creates the connection. A remote offer that
    /// arrived earlier is consumed now and answered; otherwise the session
    /// waits for it.
    ///
    /// # Errors
    ///
    /// Returns `MediaUnavailable` if capture fails (the call keeps ringing),
    /// `CallNotFound` if nothing is ringing, or `Negotiation` if the buffered
    /// offer cannot be applied.
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn accept_call(&self, peer: &PeerId) -> Result<(), CallError> {
        let (call_id, constraints) = {
            let sessions = self.inner.sessions.lock().await;
            let session = Self::ringing_callee(&sessions, peer)?;
            (session.call_id, session.constraints.clone())
        };

        let tracks = match self.inner.media.get_local_tracks(&constraints).await {
            Ok(tracks) => tracks,
            Err(e) => {
                let mut sessions = self.inner.sessions.lock().await;
                if let Some(session) = sessions.get_mut(peer) {
                    session.last_error = Some(e.to_string());
                }
                self.publish(CallEvent::Error {
                    peer: peer.clone(),
                    error: e.to_string(),
                });
                tracing::warn!(error = %e, "Local media unavailable, call keeps ringing");
                return Err(e.into());
            }
        };

        let mut sessions = self.inner.sessions.lock().await;
        let session = match sessions.get_mut(peer) {
            Some(s) if s.call_id == call_id && s.status() == CallStatus::Ringing => s,
            _ => {
                // Ended or replaced while the permission prompt was up
                media::stop_all(self.inner.media.as_ref(), &tracks);
                return Err(CallError::CallNotFound(peer.clone()));
            }
        };

        tracing::info!(call_id = %call_id, "Accepting call");
        session.local_tracks = Some(tracks);

        if let Err(e) = self.prepare_connection(session).await {
            self.teardown(
                session,
                EndReason::ConnectionFailed(e.to_string()),
                Some(Notice::End),
            )
            .await;
            return Err(e);
        }

        let Some(sdp) = session.pending_remote_offer.take() else {
            tracing::debug!("No offer yet, waiting for remote offer");
            return Ok(());
        };
        tracing::debug!("Consuming buffered remote offer");
        let connection = self.begin_negotiation(session).await?;
        drop(sessions);
        self.negotiate_offer(peer, call_id, connection, sdp).await
    }

    /// Decline the ringing call from `peer`
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound` if nothing is ringing
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn reject_call(&self, peer: &PeerId) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        Self::ringing_callee(&sessions, peer)?;
        if let Some(session) = sessions.get_mut(peer) {
            tracing::info!(call_id = %session.call_id, "Rejecting call");
            self.teardown(session, EndReason::Rejected, Some(Notice::Reject))
                .await;
        }
        Ok(())
    }

    /// Hang up the call with `peer`
    ///
    /// Stops local tracks, closes the connection and tells the remote peer.
    /// Calling it again after the call ended does nothing.
    ///
    /// # Errors
    ///
    /// Returns `CallNotFound` if there was never a call with `peer`
    #[tracing::instrument(skip(self), fields(peer = %peer))]
    pub async fn end_call(&self, peer: &PeerId) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .get_mut(peer)
            .ok_or_else(|| CallError::CallNotFound(peer.clone()))?;
        self.teardown(session, EndReason::LocalHangup, Some(Notice::End))
            .await;
        Ok(())
    }

    /// Swap the outgoing track of `new_track.kind()` without renegotiating
    ///
    /// The replaced track is stopped.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` without a live connection, or `NoSender` if
    /// the connection sends no media of that kind.
    #[tracing::instrument(skip(self, new_track), fields(peer = %peer, kind = %new_track.kind(), track_id = %new_track.id()))]
    pub async fn replace_outgoing_track(
        &self,
        peer: &PeerId,
        new_track: Arc<dyn LocalTrack>,
    ) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions
            .get_mut(peer)
            .filter(|s| s.status().has_connection())
            .ok_or_else(|| CallError::NoActiveSession(peer.clone()))?;
        let connection = session
            .connection
            .clone()
            .ok_or_else(|| CallError::NoActiveSession(peer.clone()))?;

        let kind = new_track.kind();
        let sender = connection
            .senders()
            .await
            .into_iter()
            .find(|s| s.kind() == kind)
            .ok_or(CallError::NoSender(kind))?;

        sender.replace_track(Arc::clone(&new_track)).await?;

        if let Some(tracks) = session.local_tracks.as_mut() {
            if let Some(slot) = tracks.iter_mut().find(|t| t.kind() == kind) {
                let old = std::mem::replace(slot, new_track);
                self.inner.media.stop_track(old.as_ref());
            } else {
                tracks.push(new_track);
            }
        }

        tracing::info!("Outgoing track replaced");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------

    /// Dispatch an inbound signaling message
    ///
    /// Stale and duplicate messages are absorbed.
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if a description was malformed (the call has
    /// been ended)
    pub async fn handle_signal(
        &self,
        from: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), CallError> {
        match message {
            SignalingMessage::Initiate {
                call_id,
                constraints,
            } => self.handle_initiate(from, call_id, constraints).await,
            SignalingMessage::Offer { call_id, sdp } => {
                self.handle_remote_offer(from, call_id, sdp).await
            }
            SignalingMessage::Answer { call_id, sdp } => {
                self.handle_remote_answer(from, call_id, sdp).await
            }
            SignalingMessage::IceCandidate {
                call_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                self.handle_remote_candidate(from, call_id, candidate).await
            }
            SignalingMessage::End { call_id, reason } => {
                self.handle_remote_termination(from, call_id, EndReason::RemoteHangup, reason)
                    .await
            }
            SignalingMessage::Reject { call_id, reason } => {
                self.handle_remote_termination(from, call_id, EndReason::RemoteRejected, reason)
                    .await
            }
        }
    }

    /// Remote peer announced a call
    ///
    /// # Errors
    ///
    /// Never fails; guard rejections are absorbed
    #[tracing::instrument(skip(self, constraints), fields(peer = %peer, call_id = %call_id))]
    pub async fn handle_initiate(
        &self,
        peer: &PeerId,
        call_id: CallId,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = match self.incoming_session(&mut sessions, peer, call_id, "initiate").await {
            Ok(s) => s,
            Err(e) => return absorb(Err(e)),
        };
        if !session.media_ready() {
            session.constraints = constraints;
        }
        self.announce(session);
        Ok(())
    }

    /// Remote peer sent an offer
    ///
    /// Buffered while local media is not ready; otherwise applied and
    /// answered. A second offer while one is being processed is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if the offer cannot be applied (the call has
    /// been ended)
    #[tracing::instrument(skip(self, sdp), fields(peer = %peer, call_id = %call_id, sdp_len = sdp.len()))]
    pub async fn handle_remote_offer(
        &self,
        peer: &PeerId,
        call_id: CallId,
        sdp: String,
    ) -> Result<(), CallError> {
        let connection = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = match self.incoming_session(&mut sessions, peer, call_id, "offer").await {
                Ok(s) => s,
                Err(e) => return absorb(Err(e)),
            };
            self.announce(session);

            if session.negotiation_in_flight {
                return absorb(Err(stale("offer", "negotiation already in flight")));
            }
            if session.last_remote_offer.as_deref() == Some(sdp.as_str()) {
                return absorb(Err(stale("offer", "duplicate of the applied offer")));
            }
            if let Some(conn) = &session.connection {
                if conn.signaling_state() == SignalingState::HaveLocalOffer {
                    return absorb(Err(stale("offer", "local offer outstanding")));
                }
            }

            if !session.media_ready() {
                if session.pending_remote_offer.is_some() {
                    return absorb(Err(stale("offer", "an offer is already buffered")));
                }
                tracing::debug!("Local media not ready, buffering remote offer");
                session.pending_remote_offer = Some(sdp);
                return Ok(());
            }

            self.begin_negotiation(session).await?
        };

        self.negotiate_offer(peer, call_id, connection, sdp).await
    }

    /// Remote peer sent an answer
    ///
    /// Applied only while a local offer is outstanding.
    ///
    /// # Errors
    ///
    /// Returns `Negotiation` if the answer cannot be applied (the call has
    /// been ended)
    #[tracing::instrument(skip(self, sdp), fields(peer = %peer, call_id = %call_id, sdp_len = sdp.len()))]
    pub async fn handle_remote_answer(
        &self,
        peer: &PeerId,
        call_id: CallId,
        sdp: String,
    ) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = match route(&sessions, peer, call_id) {
            Route::Existing => sessions
                .get_mut(peer)
                .ok_or_else(|| CallError::CallNotFound(peer.clone()))?,
            _ => return absorb(Err(stale("answer", "no live call with that id"))),
        };
        let Some(connection) = session.connection.clone() else {
            return absorb(Err(stale("answer", "no connection")));
        };
        if connection.signaling_state() != SignalingState::HaveLocalOffer {
            return absorb(Err(stale(
                "answer",
                format!("signaling state is {:?}", connection.signaling_state()),
            )));
        }

        if let Err(e) = connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            let err = negotiation("remote answer rejected", e);
            self.fail(session, &err).await;
            return Err(err);
        }

        tracing::debug!("Remote answer applied");
        session.candidate_queue.drain_into(connection.as_ref()).await;
        Ok(())
    }

    /// Remote peer sent an ICE candidate
    ///
    /// Applied directly once a remote description is set, queued before.
    ///
    /// # Errors
    ///
    /// Never fails; a rejected candidate is logged
    #[tracing::instrument(skip(self, candidate), fields(peer = %peer, call_id = %call_id))]
    pub async fn handle_remote_candidate(
        &self,
        peer: &PeerId,
        call_id: CallId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = match route(&sessions, peer, call_id) {
            Route::Existing => sessions
                .get_mut(peer)
                .ok_or_else(|| CallError::CallNotFound(peer.clone()))?,
            Route::New => match self.open_incoming(&mut sessions, peer, call_id) {
                Ok(s) => s,
                Err(e) => return absorb(Err(e)),
            },
            Route::Ended | Route::Busy => {
                return absorb(Err(stale("ice-candidate", "no live call with that id")))
            }
        };

        // While the first offer is applied outside the lock, candidates keep
        // queueing so the drain applies them in arrival order.
        let draining_soon =
            session.negotiation_in_flight && !session.candidate_queue.is_drained();
        let ready = match &session.connection {
            Some(conn) if !draining_soon && conn.signaling_state() != SignalingState::Closed => {
                conn.has_remote_description().await
            }
            _ => false,
        };

        if let (true, Some(conn)) = (ready, session.connection.clone()) {
            if let Err(e) = conn.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply remote ICE candidate");
            }
        } else {
            tracing::trace!(
                queued = session.candidate_queue.len() + 1,
                "Queueing remote ICE candidate"
            );
            session.candidate_queue.enqueue(candidate);
        }
        Ok(())
    }

    async fn handle_remote_termination(
        &self,
        peer: &PeerId,
        call_id: CallId,
        reason: EndReason,
        detail: Option<String>,
    ) -> Result<(), CallError> {
        let mut sessions = self.inner.sessions.lock().await;
        match route(&sessions, peer, call_id) {
            Route::Existing => {
                if let Some(session) = sessions.get_mut(peer) {
                    tracing::info!(
                        peer = %peer,
                        call_id = %call_id,
                        detail = detail.as_deref().unwrap_or(""),
                        "Remote peer ended the call"
                    );
                    self.teardown(session, reason, None).await;
                }
                Ok(())
            }
            _ => absorb(Err(stale("end", "no live call with that id"))),
        }
    }

    // ------------------------------------------------------------------
    // Connection events and the grace timer
    // ------------------------------------------------------------------

    /// Feed a transport state change of the call's connection
    #[tracing::instrument(skip(self), fields(peer = %peer, call_id = %call_id))]
    pub async fn handle_connection_state(
        &self,
        peer: &PeerId,
        call_id: CallId,
        state: ConnectionState,
    ) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions
            .get_mut(peer)
            .filter(|s| s.call_id == call_id && !s.status().is_terminal())
        else {
            tracing::trace!(state = ?state, "Ignoring state change of a finished call");
            return;
        };

        match state {
            ConnectionState::Connected => {
                if let Some(timer) = session.grace_timer.take() {
                    tracing::info!("Connection recovered within grace window");
                    timer.cancel();
                }
                if session.status() == CallStatus::Connecting {
                    if let Err(e) = self.set_status(session, CallStatus::Connected) {
                        tracing::warn!(error = %e, "Could not mark call connected");
                    } else {
                        tracing::info!("Call connected");
                    }
                }
            }
            ConnectionState::Disconnected => {
                if session.grace_timer.is_none() {
                    tracing::warn!(
                        grace = ?self.inner.config.disconnect_grace,
                        "Connection interrupted, arming grace timer"
                    );
                    self.arm_grace_timer(session);
                }
            }
            ConnectionState::Failed => {
                self.teardown(
                    session,
                    EndReason::ConnectionFailed("transport failed".to_string()),
                    Some(Notice::End),
                )
                .await;
            }
            ConnectionState::Closed => {
                self.teardown(
                    session,
                    EndReason::ConnectionFailed("connection closed".to_string()),
                    Some(Notice::End),
                )
                .await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    fn arm_grace_timer(&self, session: &mut CallSession) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let grace = self.inner.config.disconnect_grace;
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let peer = session.peer.clone();
        let call_id = session.call_id;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                let manager = CallManager { inner };
                manager.grace_expired(&peer, call_id, generation).await;
            }
        });
        session.grace_timer = Some(GraceTimer::new(handle, generation));
    }

    async fn grace_expired(&self, peer: &PeerId, call_id: CallId, generation: u64) {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.get_mut(peer).filter(|s| {
            s.call_id == call_id
                && s.grace_timer.as_ref().map(GraceTimer::generation) == Some(generation)
        }) else {
            return;
        };

        // Running inside the timer task itself, so drop rather than abort.
        drop(session.grace_timer.take());
        tracing::warn!(peer = %peer, call_id = %call_id, "Grace window expired while disconnected");
        self.teardown(session, EndReason::DisconnectTimeout, Some(Notice::End))
            .await;
    }

    fn spawn_event_pump(&self, peer: PeerId, call_id: CallId, mut events: ConnectionEvents) {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = CallManager { inner };
                match event {
                    ConnectionEvent::LocalCandidate(candidate) => {
                        manager.send_local_candidate(&peer, call_id, candidate).await;
                    }
                    ConnectionEvent::StateChanged(state) => {
                        manager.handle_connection_state(&peer, call_id, state).await;
                    }
                }
            }
            tracing::trace!(peer = %peer, call_id = %call_id, "Connection event stream closed");
        });
    }

    async fn send_local_candidate(&self, peer: &PeerId, call_id: CallId, candidate: IceCandidate) {
        let live = {
            let sessions = self.inner.sessions.lock().await;
            matches!(route(&sessions, peer, call_id), Route::Existing)
        };
        if live {
            self.emit(peer, SignalingMessage::candidate(call_id, candidate))
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_can_open(
        &self,
        sessions: &HashMap<PeerId, CallSession>,
        peer: &PeerId,
    ) -> Result<(), CallError> {
        if sessions.get(peer).is_some_and(CallSession::is_live) {
            return Err(CallError::SessionExists(peer.clone()));
        }
        let active = sessions.values().filter(|s| s.is_live()).count();
        if active >= self.inner.config.max_concurrent_calls {
            return Err(CallError::ConfigError(format!(
                "Maximum concurrent calls limit reached: {}",
                self.inner.config.max_concurrent_calls
            )));
        }
        Ok(())
    }

    fn ringing_callee<'a>(
        sessions: &'a HashMap<PeerId, CallSession>,
        peer: &PeerId,
    ) -> Result<&'a CallSession, CallError> {
        let session = sessions
            .get(peer)
            .filter(|s| s.role == CallRole::Callee)
            .ok_or_else(|| CallError::CallNotFound(peer.clone()))?;
        if session.status() != CallStatus::Ringing {
            return Err(CallError::InvalidState {
                from: session.status(),
                to: CallStatus::Connecting,
            });
        }
        Ok(session)
    }

    /// Session an inbound `initiate`/`offer` belongs to, opening one if needed
    async fn incoming_session<'a>(
        &self,
        sessions: &'a mut HashMap<PeerId, CallSession>,
        peer: &PeerId,
        call_id: CallId,
        kind: &str,
    ) -> Result<&'a mut CallSession, CallError> {
        match route(sessions, peer, call_id) {
            Route::Existing => sessions
                .get_mut(peer)
                .ok_or_else(|| CallError::CallNotFound(peer.clone())),
            Route::New => self.open_incoming(sessions, peer, call_id),
            Route::Ended => Err(stale(kind, "call already ended")),
            Route::Busy => {
                tracing::info!(peer = %peer, call_id = %call_id, "Peer already in a call, rejecting");
                self.emit(
                    peer,
                    SignalingMessage::Reject {
                        call_id,
                        reason: Some("busy".to_string()),
                    },
                )
                .await;
                Err(stale(kind, "peer already has a live call"))
            }
        }
    }

    fn open_incoming<'a>(
        &self,
        sessions: &'a mut HashMap<PeerId, CallSession>,
        peer: &PeerId,
        call_id: CallId,
    ) -> Result<&'a mut CallSession, CallError> {
        if let Err(e) = self.check_can_open(sessions, peer) {
            tracing::warn!(peer = %peer, error = %e, "Not accepting incoming call");
            return Err(stale("incoming call", e));
        }
        tracing::info!(peer = %peer, call_id = %call_id, "Incoming call");
        let session = CallSession::new(
            peer.clone(),
            call_id,
            CallRole::Callee,
            self.inner.config.default_constraints.clone(),
        );
        if let Some(stale) = sessions.insert(peer.clone(), session) {
            tracing::debug!(replaced = %stale.call_id, "Replacing finished or unannounced session");
        }
        sessions
            .get_mut(peer)
            .ok_or_else(|| CallError::CallNotFound(peer.clone()))
    }

    /// Tell the UI about a ringing call, once
    fn announce(&self, session: &mut CallSession) {
        if session.announced || session.role != CallRole::Callee {
            return;
        }
        session.announced = true;
        self.publish(CallEvent::IncomingCall {
            peer: session.peer.clone(),
            call_id: session.call_id,
            constraints: session.constraints.clone(),
        });
    }

    /// Create the connection (entering `Connecting`) and attach local tracks
    async fn prepare_connection(&self, session: &mut CallSession) -> Result<(), CallError> {
        if session.connection.is_none() {
            let (connection, events) = self.inner.connections.create(&session.peer).await?;
            self.spawn_event_pump(session.peer.clone(), session.call_id, events);
            session.connection = Some(connection);
            self.set_status(session, CallStatus::Connecting)?;
        }

        if !session.tracks_attached {
            let (Some(connection), Some(tracks)) = (&session.connection, &session.local_tracks)
            else {
                return Ok(());
            };
            for track in tracks {
                connection.add_track(Arc::clone(track)).await?;
            }
            session.tracks_attached = true;
            tracing::debug!(tracks = tracks.len(), "Local tracks attached");
        }
        Ok(())
    }

    async fn send_initial_offer(&self, session: &mut CallSession) -> Result<(), CallError> {
        self.prepare_connection(session).await?;
        let connection = session
            .connection
            .clone()
            .ok_or_else(|| CallError::NoActiveSession(session.peer.clone()))?;

        let offer = connection
            .create_offer()
            .await
            .map_err(|e| negotiation("could not create offer", e))?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation("could not apply local offer", e))?;

        // The offer stays applied even if delivery fails.
        self.emit(
            &session.peer,
            SignalingMessage::Initiate {
                call_id: session.call_id,
                constraints: session.constraints.clone(),
            },
        )
        .await;
        self.emit(
            &session.peer,
            SignalingMessage::description(session.call_id, offer),
        )
        .await;
        Ok(())
    }

    /// Create the connection if needed and mark an offer as in flight
    ///
    /// Ends the call if the connection cannot be set up.
    async fn begin_negotiation(
        &self,
        session: &mut CallSession,
    ) -> Result<Arc<dyn Connection>, CallError> {
        let prepared = match self.prepare_connection(session).await {
            Ok(()) => session
                .connection
                .clone()
                .ok_or_else(|| CallError::NoActiveSession(session.peer.clone())),
            Err(e) => Err(e),
        };
        match prepared {
            Ok(connection) => {
                session.negotiation_in_flight = true;
                Ok(connection)
            }
            Err(e) => {
                self.fail(session, &e).await;
                Err(e)
            }
        }
    }

    /// Apply a remote offer and answer it, ending the call on failure
    ///
    /// Called with the registry unlocked and `negotiation_in_flight` set, so
    /// an offer arriving meanwhile sees the flag and is dropped.
    async fn negotiate_offer(
        &self,
        peer: &PeerId,
        call_id: CallId,
        connection: Arc<dyn Connection>,
        sdp: String,
    ) -> Result<(), CallError> {
        let applied = connection
            .set_remote_description(SessionDescription::offer(sdp.clone()))
            .await;

        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions
            .get_mut(peer)
            .filter(|s| s.call_id == call_id && !s.status().is_terminal())
        else {
            return absorb(Err(stale("offer", "call ended during negotiation")));
        };

        let result = match applied {
            Ok(()) => self.answer_offer(session, connection.as_ref(), sdp).await,
            Err(e) => Err(negotiation("remote offer rejected", e)),
        };
        session.negotiation_in_flight = false;

        if let Err(e) = &result {
            self.fail(session, e).await;
        }
        result
    }

    async fn answer_offer(
        &self,
        session: &mut CallSession,
        connection: &dyn Connection,
        sdp: String,
    ) -> Result<(), CallError> {
        session.last_remote_offer = Some(sdp);
        session.candidate_queue.drain_into(connection).await;

        let answer = connection
            .create_answer()
            .await
            .map_err(|e| negotiation("could not create answer", e))?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation("could not apply local answer", e))?;

        tracing::debug!("Answer generated");
        self.emit(
            &session.peer,
            SignalingMessage::description(session.call_id, answer),
        )
        .await;
        Ok(())
    }

    /// End the call after a fatal error detected locally
    async fn fail(&self, session: &mut CallSession, err: &CallError) {
        let reason = match err {
            CallError::Negotiation(msg) => EndReason::NegotiationFailed(msg.clone()),
            other => EndReason::ConnectionFailed(other.to_string()),
        };
        self.teardown(session, reason, Some(Notice::End)).await;
    }

    /// Release everything the session owns and move it to `Ended`
    ///
    /// Does nothing if the session already ended.
    async fn teardown(&self, session: &mut CallSession, reason: EndReason, notice: Option<Notice>) {
        if session.status().is_terminal() {
            return;
        }

        if let Some(timer) = session.grace_timer.take() {
            timer.cancel();
        }
        session.negotiation_in_flight = false;
        session.pending_remote_offer = None;

        if let Some(tracks) = session.local_tracks.take() {
            media::stop_all(self.inner.media.as_ref(), &tracks);
        }
        if let Some(connection) = session.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::warn!(peer = %session.peer, error = %e, "Failed to close connection");
            }
        }

        match &reason {
            EndReason::NegotiationFailed(_)
            | EndReason::ConnectionFailed(_)
            | EndReason::DisconnectTimeout => session.last_error = Some(reason.to_string()),
            _ => {}
        }
        session.end_reason = Some(reason.clone());
        if let Err(e) = self.set_status(session, CallStatus::Ended) {
            tracing::error!(error = %e, "Teardown could not end the call");
        }

        let call_id = session.call_id;
        match notice {
            Some(Notice::End) => {
                self.emit(
                    &session.peer,
                    SignalingMessage::End {
                        call_id,
                        reason: Some(reason.to_string()),
                    },
                )
                .await;
            }
            Some(Notice::Reject) => {
                self.emit(
                    &session.peer,
                    SignalingMessage::Reject {
                        call_id,
                        reason: None,
                    },
                )
                .await;
            }
            None => {}
        }

        tracing::info!(peer = %session.peer, call_id = %call_id, reason = %reason, "Call ended");
        self.publish(CallEvent::CallEnded {
            peer: session.peer.clone(),
            call_id,
            reason,
        });
    }

    fn set_status(&self, session: &mut CallSession, to: CallStatus) -> Result<(), CallError> {
        let from = session.transition(to)?;
        self.publish(CallEvent::StatusChanged {
            peer: session.peer.clone(),
            call_id: session.call_id,
            from,
            to,
        });
        Ok(())
    }

    /// Send a message; failures are logged and not retried
    async fn emit(&self, peer: &PeerId, message: SignalingMessage) {
        let kind = message.kind();
        if let Err(e) = self.inner.signaling.send_message(peer, message).await {
            let err = CallError::from(e);
            tracing::warn!(peer = %peer, kind, error = %err, "Signaling delivery failed");
        }
    }

    fn publish(&self, event: CallEvent) {
        let _ = self.inner.event_sender.send(event);
    }
}
