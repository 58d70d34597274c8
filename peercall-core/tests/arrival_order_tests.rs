//! Arrival-order independence of the callee's negotiation
//!
//! Whatever order the offer and candidates arrive in before the user
//! accepts, the connection must end up exactly as if they had arrived
//! after local media was ready.

mod common;

use common::{candidate, peer, Harness, MockState, BOB};
use peercall_core::types::CallId;
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Inbound {
    Offer,
    Candidate(usize),
}

/// The offer at `offer_at` among `candidates` candidates in arrival order
fn arrivals(candidates: usize, offer_at: usize) -> Vec<Inbound> {
    let mut seq: Vec<Inbound> = (0..candidates).map(Inbound::Candidate).collect();
    seq.insert(offer_at.min(candidates), Inbound::Offer);
    seq
}

async fn deliver(h: &Harness, call_id: CallId, seq: &[Inbound]) {
    for item in seq {
        match item {
            Inbound::Offer => h.offer(call_id).await,
            Inbound::Candidate(n) => h
                .manager
                .handle_remote_candidate(&peer(BOB), call_id, candidate(*n))
                .await
                .unwrap(),
        }
    }
}

/// Everything arrives before `accept_call`
async fn before_ready(seq: &[Inbound]) -> (MockState, Vec<&'static str>) {
    let h = Harness::new();
    let call_id = CallId::new();
    h.ring(call_id).await;
    deliver(&h, call_id, seq).await;
    h.manager.accept_call(&peer(BOB)).await.unwrap();
    (h.factory.last().unwrap().snapshot(), h.transport.kinds())
}

/// Everything arrives after `accept_call`
async fn after_ready(seq: &[Inbound]) -> (MockState, Vec<&'static str>) {
    let h = Harness::new();
    let call_id = CallId::new();
    h.ring(call_id).await;
    h.manager.accept_call(&peer(BOB)).await.unwrap();
    deliver(&h, call_id, seq).await;
    (h.factory.last().unwrap().snapshot(), h.transport.kinds())
}

fn run<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn early_arrival_matches_late_arrival(candidates in 0usize..6, offer_at in 0usize..7) {
        let seq = arrivals(candidates, offer_at);
        let (early, early_sent) = run(before_ready(&seq));
        let (late, late_sent) = run(after_ready(&seq));

        prop_assert_eq!(&early, &late);
        prop_assert_eq!(early_sent, late_sent);

        let expected: Vec<String> = (0..candidates).map(|n| candidate(n).candidate).collect();
        prop_assert_eq!(early.applied_candidates, expected);
        prop_assert_eq!(early.remote_sets, 1);
    }
}

#[test]
fn offer_last_after_many_candidates() {
    let seq = arrivals(5, 5);
    let (state, sent) = run(before_ready(&seq));
    assert_eq!(state.applied_candidates.len(), 5);
    assert_eq!(sent, vec!["answer"]);
}
