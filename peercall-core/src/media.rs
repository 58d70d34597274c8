//! Local media boundary
//!
//! Capture lives outside the engine. [`MediaSource`] hands out tracks for a
//! set of constraints and stops them again; once a track is attached to a
//! call's connection the engine owns it for teardown purposes.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused capture
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Constraints asked for no media at all
    #[error("No media requested")]
    NothingRequested,

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// A local track produced by the capture subsystem
pub trait LocalTrack: Send + Sync + fmt::Debug {
    /// Track identifier, unique per source
    fn id(&self) -> &str;

    /// Audio or video
    fn kind(&self) -> MediaKind;

    /// Backend access for connection implementations
    fn as_any(&self) -> &dyn Any;
}

/// Capture subsystem boundary
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire tracks for `constraints`
    ///
    /// May suspend for a long time (permission prompt).
    ///
    /// # Errors
    ///
    /// Returns error if capture is denied or no device matches
    async fn get_local_tracks(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;

    /// Stop a track previously returned by `get_local_tracks`
    fn stop_track(&self, track: &dyn LocalTrack);
}

/// Stop every track in `tracks` through `source`
pub(crate) fn stop_all(source: &dyn MediaSource, tracks: &[Arc<dyn LocalTrack>]) {
    for track in tracks {
        tracing::debug!(track_id = %track.id(), kind = %track.kind(), "Stopping local track");
        source.stop_track(track.as_ref());
    }
}
