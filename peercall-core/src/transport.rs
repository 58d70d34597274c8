//! Transport adapters for signaling
//!
//! [`MemorySignalingBus`] relays messages between transports living in the
//! same process. Messages cross the bus as JSON so the wire format is
//! exercised exactly as a network relay would see it.

use crate::signaling::{SignalingMessage, SignalingTransport};
use crate::types::PeerId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// No transport registered under that identity
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Inbox closed; removed from the bus
    #[error("Transport closed")]
    Closed,
}

type Envelope = (PeerId, Vec<u8>);

/// In-process signaling relay
#[derive(Default)]
pub struct MemorySignalingBus {
    routes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<Envelope>>>,
}

impl MemorySignalingBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `local` on the bus and return its transport
    ///
    /// Registering the same identity again replaces the previous route.
    #[must_use]
    pub fn connect(self: &Arc<Self>, local: impl Into<PeerId>) -> MemoryTransport {
        let local = local.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(local.clone(), tx);
        tracing::debug!(peer = %local, "Transport joined memory bus");
        MemoryTransport {
            local,
            bus: Arc::clone(self),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Remove `peer` from the bus; messages to it fail from now on
    pub fn disconnect(&self, peer: &PeerId) {
        self.routes.lock().remove(peer);
    }

    fn route(&self, from: &PeerId, to: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let routes = self.routes.lock();
        let tx = routes
            .get(to)
            .ok_or_else(|| TransportError::PeerNotFound(to.clone()))?;
        tx.send((from.clone(), bytes))
            .map_err(|_| TransportError::SendError(format!("Inbox of {to} is closed")))
    }
}

/// One participant's end of a [`MemorySignalingBus`]
pub struct MemoryTransport {
    local: PeerId,
    bus: Arc<MemorySignalingBus>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl MemoryTransport {
    /// Identity this transport is registered under
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    type Error = TransportError;

    async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), TransportError> {
        let data = serde_json::to_vec(&message).map_err(|e| {
            TransportError::SendError(format!("Failed to serialize message: {}", e))
        })?;
        self.bus.route(&self.local, peer, data)
    }

    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), TransportError> {
        let (from, data) = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)?;

        let message = serde_json::from_slice(&data).map_err(|e| {
            TransportError::ReceiveError(format!("Failed to deserialize message: {}", e))
        })?;
        Ok((from, message))
    }

    fn is_closed(&self, error: &TransportError) -> bool {
        matches!(error, TransportError::Closed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::CallId;

    #[tokio::test]
    async fn test_bus_routes_between_transports() {
        let bus = MemorySignalingBus::new();
        let alice = bus.connect("alice");
        let bob = bus.connect("bob");

        let msg = SignalingMessage::End {
            call_id: CallId::new(),
            reason: Some("bye".to_string()),
        };
        alice.send_message(&PeerId::new("bob"), msg.clone()).await.unwrap();

        let (from, received) = bob.receive_message().await.unwrap();
        assert_eq!(from, PeerId::new("alice"));
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let bus = MemorySignalingBus::new();
        let alice = bus.connect("alice");

        let result = alice
            .send_message(
                &PeerId::new("nobody"),
                SignalingMessage::Reject {
                    call_id: CallId::new(),
                    reason: None,
                },
            )
            .await;
        assert!(matches!(result, Err(TransportError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_disconnect_removes_route() {
        let bus = MemorySignalingBus::new();
        let alice = bus.connect("alice");
        let _bob = bus.connect("bob");
        bus.disconnect(&PeerId::new("bob"));

        let result = alice
            .send_message(
                &PeerId::new("bob"),
                SignalingMessage::End {
                    call_id: CallId::new(),
                    reason: None,
                },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnected_inbox_reports_closed() {
        let bus = MemorySignalingBus::new();
        let bob = bus.connect("bob");
        bus.disconnect(&PeerId::new("bob"));

        let err = bob.receive_message().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(bob.is_closed(&err));
    }
}
