//! Call service orchestration
//!
//! [`CallService`] wires a [`SignalingHandler`] to a [`CallManager`] and runs
//! the inbound receive loop, so the UI only has to call the mutators and
//! watch the event stream.

use crate::call::{CallError, CallManager, CallManagerConfig};
use crate::connection::ConnectionFactory;
use crate::media::{LocalTrack, MediaSource};
use crate::signaling::{SignalingError, SignalingHandler, SignalingTransport};
use crate::types::{CallEvent, CallId, CallSnapshot, CallStatus, MediaConstraints, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Receive loop already running
    #[error("Service already running")]
    AlreadyRunning,

    /// Call error
    #[error("Call error: {0}")]
    CallError(#[from] CallError),
}

/// Service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Call manager config
    pub call: CallManagerConfig,
}

/// One participant's call stack
pub struct CallService<T: SignalingTransport> {
    signaling: Arc<SignalingHandler<T>>,
    manager: CallManager<T>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SignalingTransport> CallService<T> {
    /// Create new call service
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        signaling: Arc<SignalingHandler<T>>,
        connections: Arc<dyn ConnectionFactory>,
        media: Arc<dyn MediaSource>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        let manager = CallManager::new(config.call, Arc::clone(&signaling), connections, media)
            .map_err(|e| ServiceError::InitError(e.to_string()))?;

        Ok(Self {
            signaling,
            manager,
            receive_task: Mutex::new(None),
        })
    }

    /// Start the inbound receive loop
    ///
    /// # Errors
    ///
    /// Returns error if the loop is already running
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut task = self.receive_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(ServiceError::AlreadyRunning);
        }

        tracing::info!("Starting call service");
        let signaling = Arc::clone(&self.signaling);
        let manager = self.manager.clone();
        *task = Some(tokio::spawn(receive_loop(signaling, manager)));
        Ok(())
    }

    /// Stop the receive loop; calls stay as they are
    pub fn stop(&self) {
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
            tracing::info!("Call service stopped");
        }
    }

    /// Whether the receive loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.receive_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Hang up every call, then stop the receive loop
    pub async fn shutdown(&self) {
        let peers: Vec<PeerId> = self
            .manager
            .active_calls()
            .await
            .into_iter()
            .map(|c| c.peer)
            .collect();

        let results = futures::future::join_all(peers.iter().map(|p| self.manager.end_call(p))).await;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(peer = %peer, error = %e, "Failed to end call during shutdown");
            }
        }
        self.stop();
    }

    /// Call `peer`
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be started
    pub async fn start_call(
        &self,
        peer: PeerId,
        constraints: MediaConstraints,
    ) -> Result<CallId, ServiceError> {
        Ok(self.manager.start_call(peer, constraints).await?)
    }

    /// Accept the ringing call from `peer`
    ///
    /// # Errors
    ///
    /// Returns error if call cannot be accepted
    pub async fn accept_call(&self, peer: &PeerId) -> Result<(), ServiceError> {
        Ok(self.manager.accept_call(peer).await?)
    }

    /// Decline the ringing call from `peer`
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing
    pub async fn reject_call(&self, peer: &PeerId) -> Result<(), ServiceError> {
        Ok(self.manager.reject_call(peer).await?)
    }

    /// Hang up the call with `peer`
    ///
    /// # Errors
    ///
    /// Returns error if there is no call with `peer`
    pub async fn end_call(&self, peer: &PeerId) -> Result<(), ServiceError> {
        Ok(self.manager.end_call(peer).await?)
    }

    /// Swap an outgoing track without renegotiating
    ///
    /// # Errors
    ///
    /// Returns error if there is no live connection or no matching sender
    pub async fn replace_outgoing_track(
        &self,
        peer: &PeerId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), ServiceError> {
        Ok(self.manager.replace_outgoing_track(peer, track).await?)
    }

    /// Status of the call with `peer`
    pub async fn status(&self, peer: &PeerId) -> Option<CallStatus> {
        self.manager.status(peer).await
    }

    /// UI view of the call with `peer`
    pub async fn snapshot(&self, peer: &PeerId) -> Option<CallSnapshot> {
        self.manager.snapshot(peer).await
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.manager.subscribe_events()
    }

    /// Underlying call manager
    #[must_use]
    pub fn manager(&self) -> &CallManager<T> {
        &self.manager
    }

    /// Create a builder
    #[must_use]
    pub fn builder(signaling: Arc<SignalingHandler<T>>) -> CallServiceBuilder<T> {
        CallServiceBuilder::new(signaling)
    }
}

impl<T: SignalingTransport> Drop for CallService<T> {
    fn drop(&mut self) {
        if let Some(task) = self.receive_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn receive_loop<T: SignalingTransport>(
    signaling: Arc<SignalingHandler<T>>,
    manager: CallManager<T>,
) {
    loop {
        match signaling.receive_message().await {
            Ok((from, message)) => {
                if let Err(e) = manager.handle_signal(&from, message).await {
                    tracing::warn!(peer = %from, error = %e, "Failed to handle signaling message");
                }
            }
            Err(SignalingError::Closed) => {
                tracing::info!("Signaling closed, stopping receive loop");
                break;
            }
            Err(SignalingError::InvalidMessage(reason)) => {
                tracing::warn!(reason = %reason, "Dropping invalid signaling message");
            }
            Err(e) => {
                // SignalingHandler already backed off
                tracing::debug!(error = %e, "Signaling receive failed");
            }
        }
    }
}

/// Call service builder
pub struct CallServiceBuilder<T: SignalingTransport> {
    signaling: Arc<SignalingHandler<T>>,
    connections: Option<Arc<dyn ConnectionFactory>>,
    media: Option<Arc<dyn MediaSource>>,
    config: ServiceConfig,
}

impl<T: SignalingTransport> CallServiceBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(signaling: Arc<SignalingHandler<T>>) -> Self {
        Self {
            signaling,
            connections: None,
            media: None,
            config: ServiceConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a specific connection factory
    #[must_use]
    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(factory);
        self
    }

    /// Use a specific media source
    #[must_use]
    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = Some(media);
        self
    }

    /// Build the service
    ///
    /// Without an explicit factory or media source the `webrtc` backend is
    /// used when compiled in.
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing or the configuration is
    /// invalid
    pub fn build(self) -> Result<CallService<T>, ServiceError> {
        let connections = match self.connections {
            Some(c) => c,
            None => default_connection_factory()?,
        };
        let media = match self.media {
            Some(m) => m,
            None => default_media_source()?,
        };
        CallService::new(self.signaling, connections, media, self.config)
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_connection_factory() -> Result<Arc<dyn ConnectionFactory>, ServiceError> {
    let factory = crate::webrtc_backend::WebRtcConnectionFactory::new()
        .map_err(|e| ServiceError::InitError(e.to_string()))?;
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_connection_factory() -> Result<Arc<dyn ConnectionFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "No connection factory configured".to_string(),
    ))
}

#[cfg(feature = "webrtc-backend")]
fn default_media_source() -> Result<Arc<dyn MediaSource>, ServiceError> {
    Ok(Arc::new(crate::webrtc_backend::WebRtcMediaSource::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_media_source() -> Result<Arc<dyn MediaSource>, ServiceError> {
    Err(ServiceError::InitError("No media source configured".to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_round_trips_through_json() {
        let config = ServiceConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.call.max_concurrent_calls, 10);
    }
}
