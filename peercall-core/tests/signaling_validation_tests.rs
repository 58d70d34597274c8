//! Signaling validation and edge case tests

mod common;

use common::{peer, Harness, BOB};
use peercall_core::{
    signaling::{
        SignalingError, SignalingHandler, SignalingMessage, SignalingTransport,
        MAX_CANDIDATE_LENGTH, MAX_SDP_LENGTH,
    },
    transport::MemorySignalingBus,
    types::{CallId, CallStatus, MediaConstraints},
};
use std::sync::Arc;

#[tokio::test]
async fn oversized_candidate_is_rejected_before_the_engine() {
    let bus = MemorySignalingBus::new();
    let alice = bus.connect("alice");
    let bob = SignalingHandler::new(Arc::new(bus.connect("bob")));
    alice
        .send_message(
            &peer(BOB),
            SignalingMessage::IceCandidate {
                call_id: CallId::new(),
                candidate: "x".repeat(MAX_CANDIDATE_LENGTH + 1),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        )
        .await
        .unwrap();

    let result = bob.receive_message().await;
    assert!(matches!(result, Err(SignalingError::InvalidMessage(_))));
}

#[tokio::test]
async fn largest_allowed_sdp_survives_the_bus() {
    let bus = MemorySignalingBus::new();
    let alice = SignalingHandler::new(Arc::new(bus.connect("alice")));
    let bob = SignalingHandler::new(Arc::new(bus.connect("bob")));

    let sdp = "a".repeat(MAX_SDP_LENGTH);
    alice
        .send_message(
            &peer(BOB),
            SignalingMessage::Offer {
                call_id: CallId::new(),
                sdp: sdp.clone(),
            },
        )
        .await
        .unwrap();

    match bob.receive_message().await.unwrap() {
        (from, SignalingMessage::Offer { sdp: received, .. }) => {
            assert_eq!(from, peer("alice"));
            assert_eq!(received.len(), sdp.len());
        }
        other => unreachable!("Expected Offer, got: {:?}", other),
    }
}

#[test]
fn every_kind_carries_a_call_id() {
    let call_id = CallId::new();
    let messages = vec![
        SignalingMessage::Initiate {
            call_id,
            constraints: MediaConstraints::video_call(),
        },
        SignalingMessage::Offer {
            call_id,
            sdp: "v=0".to_string(),
        },
        SignalingMessage::Answer {
            call_id,
            sdp: "v=0".to_string(),
        },
        SignalingMessage::IceCandidate {
            call_id,
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        },
        SignalingMessage::End {
            call_id,
            reason: None,
        },
        SignalingMessage::Reject {
            call_id,
            reason: Some("busy".to_string()),
        },
    ];

    let kinds: Vec<_> = messages.iter().map(SignalingMessage::kind).collect();
    assert_eq!(
        kinds,
        vec!["initiate", "offer", "answer", "ice-candidate", "end", "reject"]
    );

    for msg in messages {
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.kind());
        assert_eq!(json["call_id"], call_id.to_string());
    }
}

#[test]
fn unknown_kind_fails_to_parse() {
    let json = r#"{ "type": "renegotiate", "call_id": "67e55044-10b1-426f-9247-bb680e5fe0c8" }"#;
    assert!(serde_json::from_str::<SignalingMessage>(json).is_err());
}

#[test]
fn missing_call_id_fails_to_parse() {
    let json = r#"{ "type": "offer", "sdp": "v=0" }"#;
    assert!(serde_json::from_str::<SignalingMessage>(json).is_err());
}

#[tokio::test]
async fn stale_messages_are_absorbed_by_dispatch() {
    let h = Harness::new();
    let unknown = CallId::new();

    for msg in [
        SignalingMessage::Answer {
            call_id: unknown,
            sdp: "v=0".to_string(),
        },
        SignalingMessage::End {
            call_id: unknown,
            reason: None,
        },
        SignalingMessage::Reject {
            call_id: unknown,
            reason: None,
        },
    ] {
        assert!(h.manager.handle_signal(&peer(BOB), msg).await.is_ok());
    }

    assert_eq!(h.manager.status(&peer(BOB)).await, None);
    assert!(h.transport.kinds().is_empty());
}

#[tokio::test]
async fn initiate_sets_constraints_for_accept() {
    let h = Harness::new();
    let call_id = CallId::new();
    h.manager
        .handle_signal(
            &peer(BOB),
            SignalingMessage::Initiate {
                call_id,
                constraints: MediaConstraints::video_call(),
            },
        )
        .await
        .unwrap();

    h.manager.accept_call(&peer(BOB)).await.unwrap();

    let conn = h.factory.last().unwrap();
    assert_eq!(
        conn.snapshot().tracks,
        vec!["audio-0".to_string(), "video-0".to_string()]
    );
    assert_eq!(h.manager.status(&peer(BOB)).await, Some(CallStatus::Connecting));
}

#[tokio::test]
async fn closed_transport_is_reported_without_backoff() {
    let bus = MemorySignalingBus::new();
    let bob = SignalingHandler::new(Arc::new(bus.connect("bob")));
    bus.disconnect(&peer(BOB));

    let result = tokio::time::timeout(std::time::Duration::from_millis(50), bob.receive_message())
        .await
        .unwrap();
    assert_eq!(result, Err(SignalingError::Closed));
}
