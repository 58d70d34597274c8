//! Buffer for remote ICE candidates that arrive before the remote description
//!
//! Signaling does not order candidates relative to the offer or answer they
//! belong to. A candidate applied before its remote description is rejected by
//! every peer connection implementation, so early ones wait here and are
//! applied, oldest first, the moment the description lands.

use crate::connection::{Connection, ConnectionError};
use crate::types::IceCandidate;
use std::collections::VecDeque;

/// Outcome of draining the queue
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    /// Candidates applied successfully, in order
    pub applied: usize,
    /// Candidates the connection rejected, with the error
    pub failed: Vec<(IceCandidate, ConnectionError)>,
}

impl DrainReport {
    /// Total candidates processed
    #[must_use]
    pub fn total(&self) -> usize {
        self.applied + self.failed.len()
    }
}

/// Strict FIFO of remote candidates for one call
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    drained: bool,
}

impl CandidateQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate
    pub fn enqueue(&mut self, candidate: IceCandidate) {
        if self.drained {
            // The engine applies candidates directly once a remote
            // description exists, so this means a routing bug upstream.
            tracing::warn!(
                candidate = %candidate.candidate,
                "Candidate enqueued after the queue was drained"
            );
        }
        self.pending.push_back(candidate);
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `drain_into` has run
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Buffered candidates, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &IceCandidate> {
        self.pending.iter()
    }

    /// Apply every buffered candidate in arrival order, then clear
    ///
    /// A rejected candidate is recorded in the report and does not stop the
    /// rest. Draining an empty queue does nothing.
    pub async fn drain_into(&mut self, connection: &dyn Connection) -> DrainReport {
        self.drained = true;
        let mut report = DrainReport::default();

        while let Some(candidate) = self.pending.pop_front() {
            match connection.add_ice_candidate(candidate.clone()).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::warn!(
                        candidate = %candidate.candidate,
                        error = %e,
                        "Failed to apply queued ICE candidate"
                    );
                    report.failed.push((candidate, e));
                }
            }
        }

        if report.total() > 0 {
            tracing::debug!(
                applied = report.applied,
                failed = report.failed.len(),
                "Drained candidate queue"
            );
        }
        report
    }
}
