//! The auto-reconnect supervisor: desired-set replay, retry policy, and the
//! close-vs-reconnect race.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::json;

use tm_link::{AutoLink, AutoLinkOptions, Model, ModelOptions, RetryPolicy};
use tm_meta::Meta;
use tm_protocol::{Frame, SubOp};
use tm_test_utils::{MockConn, MockPeer};

fn local_model() -> Model {
    Model::new(
        Meta::parse(&json!({"name": "B"})).unwrap(),
        ModelOptions::default(),
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        forever: false,
    }
}

/// Read subscription frames until both the state and event `set` of a replay
/// burst have been seen; returns the state names.
async fn read_replay(remote: &mut MockConn) -> HashSet<String> {
    let mut states = None;
    let mut events = None;
    while states.is_none() || events.is_none() {
        match remote.recv_frame().await {
            Some(Frame::SubscribeState { op: SubOp::Set, names }) => {
                states = Some(names.into_iter().collect::<HashSet<_>>());
            }
            Some(Frame::SubscribeEvent { op: SubOp::Set, names }) => {
                events = Some(names.into_iter().collect::<HashSet<_>>());
            }
            other => panic!("expected a replay frame, got {other:?}"),
        }
    }
    states.expect("states read")
}

#[tokio::test]
async fn initial_connect_replays_the_empty_sets() {
    let peer = MockPeer::start().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let opts = AutoLinkOptions {
        policy: fast_retry(),
        on_reconnect: Some(std::sync::Arc::new(move |attempt, ok| {
            let _ = tx.send((attempt, ok));
        })),
        ..AutoLinkOptions::default()
    };
    let link = AutoLink::connect(&local_model(), &peer.addr_string(), opts).await;
    assert!(link.is_connected().await);
    assert_eq!(rx.recv().await, Some((1, true)));

    let mut remote = peer.accept().await;
    let states = read_replay(&mut remote).await;
    assert!(states.is_empty());
}

#[tokio::test]
async fn reconnect_replays_the_full_desired_set_with_set_semantics() {
    let peer = MockPeer::start().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let opts = AutoLinkOptions {
        policy: fast_retry(),
        on_reconnect: Some(std::sync::Arc::new(move |attempt, ok| {
            let _ = tx.send((attempt, ok));
        })),
        retry_delay: Duration::from_millis(50),
        ..AutoLinkOptions::default()
    };
    let link = AutoLink::connect(&local_model(), &peer.addr_string(), opts).await;
    assert_eq!(rx.recv().await, Some((1, true)));

    let mut remote = peer.accept().await;
    let _ = read_replay(&mut remote).await;

    // Build the desired set through a mix of set and add.
    link.sub_state(["X/a", "Y/b"]).await.unwrap();
    match remote.recv_frame().await {
        Some(Frame::SubscribeState { op: SubOp::Set, names }) => {
            assert_eq!(names.len(), 2);
        }
        other => panic!("expected set frame, got {other:?}"),
    }
    link.add_sub_state(["Z/c"]).await.unwrap();
    match remote.recv_frame().await {
        Some(Frame::SubscribeState { op: SubOp::Add, names }) => {
            assert_eq!(names, vec!["Z/c".to_owned()]);
        }
        other => panic!("expected add frame, got {other:?}"),
    }
    link.sub_event(["X/ev"]).await.unwrap();
    let _ = remote.recv_frame().await;

    // Transport drops; the supervisor re-dials and replays.
    remote.drop_link();
    let mut remote2 = peer.accept().await;
    assert_eq!(rx.recv().await, Some((1, true)));

    let states = read_replay(&mut remote2).await;
    let want: HashSet<String> = ["X/a", "Y/b", "Z/c"]
        .into_iter()
        .map(str::to_owned)
        .collect();
    // Replay is `set`, never `add`: the peer's view equals the desired set.
    assert_eq!(states, want);
    assert_eq!(link.desired_states().await, want);
    assert!(link.is_connected().await);
}

#[tokio::test]
async fn bookkeeping_survives_while_disconnected() {
    // Nothing listens on this port.
    let dead = {
        let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        drop(l);
        addr
    };
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let opts = AutoLinkOptions {
        policy: RetryPolicy {
            max_attempts: 2,
            forever: false,
        },
        on_reconnect: Some(std::sync::Arc::new(move |attempt, ok| {
            let _ = tx.send((attempt, ok));
        })),
        retry_delay: Duration::from_millis(20),
        ..AutoLinkOptions::default()
    };
    let link = AutoLink::connect(&local_model(), &dead.to_string(), opts).await;

    assert_eq!(rx.recv().await, Some((1, false)));
    assert_eq!(rx.recv().await, Some((2, false)));
    assert!(!link.is_connected().await);

    // Mutations fail with nil connection but still update the desired sets.
    let err = link.sub_state(["X/a"]).await.unwrap_err();
    assert_eq!(err.to_string(), "nil connection");
    let err = link.add_sub_state(["Y/b"]).await.unwrap_err();
    assert_eq!(err.to_string(), "nil connection");
    assert_eq!(link.desired_states().await.len(), 2);

    let err = link.call("m/f", serde_json::Map::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "nil connection");
}

#[tokio::test]
async fn close_stops_reconnection() {
    let peer = MockPeer::start().await;
    let opts = AutoLinkOptions {
        policy: RetryPolicy {
            max_attempts: 5,
            forever: true,
        },
        retry_delay: Duration::from_millis(20),
        ..AutoLinkOptions::default()
    };
    let link = AutoLink::connect(&local_model(), &peer.addr_string(), opts).await;
    let _remote = peer.accept().await;
    assert!(link.is_connected().await);

    link.close().await;
    assert!(link.is_closed());
    assert!(!link.is_connected().await);

    // The dropped connection must not trigger a fresh dial.
    assert!(peer.try_accept(Duration::from_millis(400)).await.is_none());

    let err = link.sub_state(["X/a"]).await.unwrap_err();
    assert_eq!(err.to_string(), "nil connection");
}

#[tokio::test]
async fn empty_cancel_collapses_to_clear() {
    let peer = MockPeer::start().await;
    let link = AutoLink::connect(
        &local_model(),
        &peer.addr_string(),
        AutoLinkOptions::default(),
    )
    .await;
    let mut remote = peer.accept().await;
    let _ = read_replay(&mut remote).await;

    link.sub_state(["X/a"]).await.unwrap();
    let _ = remote.recv_frame().await;

    let empty: Vec<String> = Vec::new();
    link.cancel_sub_state(empty).await.unwrap();
    match remote.recv_frame().await {
        Some(Frame::SubscribeState { op: SubOp::Clear, .. }) => {}
        other => panic!("expected clear frame, got {other:?}"),
    }
    assert!(link.desired_states().await.is_empty());

    link.close().await;
}
