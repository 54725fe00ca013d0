mod support;

use std::sync::Arc;

use huddle_signaling::{
    CandidateOutcome, CandidateSignal, ConnectionState, SignalMessage, SignalingConfig,
    SignalingManager, StreamKind, TransportEvent,
};
use signal_bus::{LocalSignalBus, SignalBus};
use support::{FakeFactory, Participant, camera_id, candidate};

fn from(peer: &Participant, text: &str) -> CandidateSignal {
    CandidateSignal {
        from_id: peer.peer(),
        kind: StreamKind::Camera,
        candidate: candidate(text),
    }
}

#[test_timeout::tokio_timeout_test]
async fn early_candidates_drain_in_order_once() {
    let bus = Arc::new(LocalSignalBus::new());
    let alice = Participant::join(&bus, "alice");
    let mut bob = Participant::join(&bus, "bob");
    let id = camera_id(&alice, &bob);
    let media = alice.publish(StreamKind::Camera);

    alice
        .manager
        .create_offer(&bob.peer(), None, StreamKind::Camera, media)
        .await
        .expect("offer");

    for text in ["c1", "c2", "c3"] {
        let outcome = bob
            .manager
            .handle_ice_candidate(from(&alice, text))
            .await
            .expect("handled");
        assert_eq!(outcome, CandidateOutcome::Buffered(id.clone()));
    }
    assert_eq!(bob.manager.pending_candidates(&id), 3);

    bob.pump().await;
    let transport = bob.factory.last();
    assert_eq!(transport.candidates(), vec!["c1", "c2", "c3"]);
    assert_eq!(bob.manager.pending_candidates(&id), 0);

    let late = bob
        .manager
        .handle_ice_candidate(from(&alice, "c4"))
        .await
        .expect("handled");
    assert_eq!(late, CandidateOutcome::Applied(id));
    assert_eq!(transport.candidates(), vec!["c1", "c2", "c3", "c4"]);
}

#[test_timeout::tokio_timeout_test]
async fn offerer_holds_candidates_until_answer() {
    let bus = Arc::new(LocalSignalBus::new());
    let mut alice = Participant::join(&bus, "alice");
    let mut bob = Participant::join(&bus, "bob");
    let id = camera_id(&alice, &bob);
    let media = alice.publish(StreamKind::Camera);

    alice
        .manager
        .create_offer(&bob.peer(), None, StreamKind::Camera, media)
        .await
        .expect("offer");
    bob.pump().await;

    for text in ["b1", "b2"] {
        let outcome = alice
            .manager
            .handle_ice_candidate(from(&bob, text))
            .await
            .expect("handled");
        assert_eq!(outcome, CandidateOutcome::Buffered(id.clone()));
    }
    assert!(alice.factory.last().candidates().is_empty());

    alice.pump().await;
    assert_eq!(alice.manager.state_of(&id), Some(ConnectionState::Connected));
    assert_eq!(alice.factory.last().candidates(), vec!["b1", "b2"]);
}

#[test_timeout::tokio_timeout_test]
async fn closing_discards_buffered_candidates() {
    let bus = Arc::new(LocalSignalBus::new());
    let alice = Participant::join(&bus, "alice");
    let bob = Participant::join(&bus, "bob");
    let id = camera_id(&alice, &bob);

    bob.manager
        .handle_ice_candidate(from(&alice, "stray"))
        .await
        .expect("handled");
    assert_eq!(bob.manager.pending_candidates(&id), 1);

    assert!(!bob.manager.close_connection(&id).await);
    assert_eq!(bob.manager.pending_candidates(&id), 0);
}

#[test_timeout::tokio_timeout_test]
async fn queue_keeps_newest_candidates_when_full() {
    let bus = Arc::new(LocalSignalBus::new());
    let _alice_inbox = bus.subscribe("alice");
    let manager = SignalingManager::builder("bob", bus.clone(), FakeFactory::new())
        .config(SignalingConfig {
            candidate_queue_limit: 2,
            ..SignalingConfig::default()
        })
        .build();

    for text in ["c1", "c2", "c3"] {
        manager
            .handle_ice_candidate(CandidateSignal {
                from_id: "alice".into(),
                kind: StreamKind::Camera,
                candidate: candidate(text),
            })
            .await
            .expect("handled");
    }
    let id = huddle_signaling::ConnectionId::new("alice".into(), "bob".into(), StreamKind::Camera);
    assert_eq!(manager.pending_candidates(&id), 2);
}

#[test_timeout::tokio_timeout_test]
async fn local_candidates_are_forwarded_to_the_remote() {
    let bus = Arc::new(LocalSignalBus::new());
    let alice = Participant::join(&bus, "alice");
    let mut bob = Participant::join(&bus, "bob");
    let media = alice.publish(StreamKind::Camera);

    alice
        .manager
        .create_offer(&bob.peer(), None, StreamKind::Camera, media)
        .await
        .expect("offer");
    let transport = alice.factory.last();
    alice
        .manager
        .handle_transport_event(transport.route(TransportEvent::LocalCandidate(candidate("a1"))))
        .await;

    let messages = bob.take_inbox();
    assert_eq!(messages.len(), 2);
    match &messages[1] {
        SignalMessage::IceCandidate(signal) => {
            assert_eq!(signal.from_id, alice.peer());
            assert_eq!(signal.kind, StreamKind::Camera);
            assert_eq!(signal.candidate.candidate, "a1");
        }
        other => panic!("expected a candidate, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn events_from_a_replaced_transport_are_ignored() {
    let bus = Arc::new(LocalSignalBus::new());
    let alice = Participant::join(&bus, "alice");
    let mut bob = Participant::join(&bus, "bob");
    let media = alice.publish(StreamKind::Camera);
    let id = camera_id(&alice, &bob);

    alice
        .manager
        .create_offer(&bob.peer(), None, StreamKind::Camera, media.clone())
        .await
        .expect("first offer");
    let stale = alice.factory.last();
    assert!(alice.manager.close_connection(&id).await);
    alice
        .manager
        .create_offer(&bob.peer(), None, StreamKind::Camera, media)
        .await
        .expect("second offer");
    bob.take_inbox();

    alice
        .manager
        .handle_transport_event(stale.route(TransportEvent::LocalCandidate(candidate("old"))))
        .await;
    assert!(bob.take_inbox().is_empty());
    assert_eq!(alice.manager.state_of(&id), Some(ConnectionState::Offering));
}
