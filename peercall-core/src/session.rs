//! Per-call state
//!
//! A [`CallSession`] is everything the engine knows about one call with one
//! peer. It is plain data: the [`crate::call::CallManager`] mutates it while
//! holding the registry lock, which is what keeps transitions from
//! interleaving.

use crate::call::CallError;
use crate::candidate_queue::CandidateQueue;
use crate::connection::Connection;
use crate::media::LocalTrack;
use crate::types::{
    CallId, CallRole, CallSnapshot, CallStatus, EndReason, MediaConstraints, PeerId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Scheduled teardown armed while the transport reports a transient disconnect
#[derive(Debug)]
pub struct GraceTimer {
    handle: JoinHandle<()>,
    generation: u64,
}

impl GraceTimer {
    /// Wrap a spawned timer task
    #[must_use]
    pub fn new(handle: JoinHandle<()>, generation: u64) -> Self {
        Self { handle, generation }
    }

    /// Generation the task was armed with
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Abort the timer task
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// One active or pending call
pub struct CallSession {
    /// Remote participant
    pub peer: PeerId,
    /// Call identifier
    pub call_id: CallId,
    /// Local role
    pub role: CallRole,
    /// Media requested for the call
    pub constraints: MediaConstraints,
    pub(crate) status: CallStatus,
    /// Present exactly while status is `Connecting` or `Connected`
    pub(crate) connection: Option<Arc<dyn Connection>>,
    /// `None` until local media is ready
    pub(crate) local_tracks: Option<Vec<Arc<dyn LocalTrack>>>,
    pub(crate) tracks_attached: bool,
    pub(crate) pending_remote_offer: Option<String>,
    /// Last offer applied, to drop redelivered copies
    pub(crate) last_remote_offer: Option<String>,
    /// Whether `IncomingCall` has been published
    pub(crate) announced: bool,
    pub(crate) candidate_queue: CandidateQueue,
    pub(crate) negotiation_in_flight: bool,
    pub(crate) grace_timer: Option<GraceTimer>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) connected_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
    pub(crate) last_error: Option<String>,
    pub(crate) end_reason: Option<EndReason>,
}

impl CallSession {
    /// Create a ringing session
    #[must_use]
    pub fn new(peer: PeerId, call_id: CallId, role: CallRole, constraints: MediaConstraints) -> Self {
        Self {
            peer,
            call_id,
            role,
            constraints,
            status: CallStatus::Ringing,
            connection: None,
            local_tracks: None,
            tracks_attached: false,
            pending_remote_offer: None,
            last_remote_offer: None,
            announced: false,
            candidate_queue: CandidateQueue::new(),
            negotiation_in_flight: false,
            grace_timer: None,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            last_error: None,
            end_reason: None,
        }
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Whether local tracks have been acquired
    #[must_use]
    pub fn media_ready(&self) -> bool {
        self.local_tracks.is_some()
    }

    /// Whether a remote offer is waiting for local media
    #[must_use]
    pub fn has_pending_offer(&self) -> bool {
        self.pending_remote_offer.is_some()
    }

    /// Whether an offer is being processed
    #[must_use]
    pub fn negotiation_in_flight(&self) -> bool {
        self.negotiation_in_flight
    }

    /// Whether this is an incoming call only candidates have been seen for
    ///
    /// The UI was never told about it, so it does not hold the peer or a
    /// call slot and is replaced by the next real call.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.role == CallRole::Callee && self.status == CallStatus::Ringing && !self.announced
    }

    /// Whether the call occupies the peer and a call slot
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal() && !self.is_silent()
    }

    /// Whether the disconnect grace timer is armed
    #[must_use]
    pub fn grace_armed(&self) -> bool {
        self.grace_timer.is_some()
    }

    /// Number of remote candidates waiting for a remote description
    #[must_use]
    pub fn queued_candidates(&self) -> usize {
        self.candidate_queue.len()
    }

    /// When the session was created
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time spent connected
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.connected_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - start)
    }

    /// Move to `to`, enforcing the lifecycle table
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the table has no such edge
    pub fn transition(&mut self, to: CallStatus) -> Result<CallStatus, CallError> {
        let from = self.status;
        if !from.can_transition_to(to) {
            tracing::warn!(
                peer = %self.peer,
                call_id = %self.call_id,
                current_state = ?from,
                requested_state = ?to,
                "Rejected call state transition"
            );
            return Err(CallError::InvalidState { from, to });
        }

        self.status = to;
        match to {
            CallStatus::Connected => self.connected_at = Some(Utc::now()),
            CallStatus::Ended => self.ended_at = Some(Utc::now()),
            CallStatus::Ringing | CallStatus::Connecting => {}
        }

        tracing::debug!(
            peer = %self.peer,
            call_id = %self.call_id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        Ok(from)
    }

    /// Read-only view for the UI
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            peer: self.peer.clone(),
            call_id: self.call_id,
            role: self.role,
            status: self.status,
            duration: self.duration().and_then(|d| d.to_std().ok()),
            last_error: self.last_error.clone(),
            end_reason: self.end_reason.clone(),
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("peer", &self.peer)
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("status", &self.status)
            .field("has_connection", &self.connection.is_some())
            .field("media_ready", &self.media_ready())
            .field("pending_remote_offer", &self.pending_remote_offer.is_some())
            .field("queued_candidates", &self.candidate_queue.len())
            .field("negotiation_in_flight", &self.negotiation_in_flight)
            .field("grace_armed", &self.grace_timer.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> CallSession {
        CallSession::new(
            PeerId::new("bob"),
            CallId::new(),
            CallRole::Caller,
            MediaConstraints::audio_only(),
        )
    }

    #[test]
    fn test_new_session_is_ringing_without_resources() {
        let s = session();
        assert_eq!(s.status(), CallStatus::Ringing);
        assert!(!s.media_ready());
        assert!(!s.has_pending_offer());
        assert!(!s.grace_armed());
        assert_eq!(s.duration(), None);
    }

    #[test]
    fn test_transition_records_timestamps() {
        let mut s = session();
        s.transition(CallStatus::Connecting).unwrap();
        s.transition(CallStatus::Connected).unwrap();
        assert!(s.connected_at.is_some());
        assert!(s.duration().is_some());

        s.transition(CallStatus::Ended).unwrap();
        assert!(s.ended_at.is_some());
        assert_eq!(s.snapshot().status, CallStatus::Ended);
    }

    #[test]
    fn test_invalid_transition_leaves_status() {
        let mut s = session();
        let err = s.transition(CallStatus::Connected);
        assert!(matches!(
            err,
            Err(CallError::InvalidState {
                from: CallStatus::Ringing,
                to: CallStatus::Connected
            })
        ));
        assert_eq!(s.status(), CallStatus::Ringing);
    }

    #[test]
    fn test_ended_is_absorbing() {
        let mut s = session();
        s.transition(CallStatus::Ended).unwrap();
        assert!(s.transition(CallStatus::Ended).is_err());
        assert!(s.transition(CallStatus::Connecting).is_err());
    }

    #[test]
    fn test_unannounced_callee_is_not_live() {
        let mut s = CallSession::new(
            PeerId::new("carol"),
            CallId::new(),
            CallRole::Callee,
            MediaConstraints::audio_only(),
        );
        assert!(s.is_silent());
        assert!(!s.is_live());

        s.announced = true;
        assert!(!s.is_silent());
        assert!(s.is_live());
    }
}
