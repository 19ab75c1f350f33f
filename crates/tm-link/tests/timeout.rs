//! Deadline calls: the timeout surfaces to the caller, the waiter stays
//! registered, and a late reply is absorbed without side effects.

use std::time::Duration;

use serde_json::json;

use tm_link::{ConnOptions, Model, ModelOptions};
use tm_meta::Meta;
use tm_protocol::{Frame, ResponsePayload};
use tm_test_utils::MockPeer;

fn obj(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    v.as_object().unwrap().clone()
}

#[tokio::test]
async fn late_reply_after_timeout_is_swallowed() {
    let peer = MockPeer::start().await;
    let model = Model::new(
        Meta::parse(&json!({"name": "B"})).unwrap(),
        ModelOptions::default(),
    );
    let conn = model
        .dial(&peer.addr_string(), ConnOptions::default())
        .await
        .unwrap();
    let mut remote = peer.accept().await;

    let started = std::time::Instant::now();
    let pending = conn.call_for("m/slow", obj(json!({})), Duration::from_millis(100));
    let err = pending.await.unwrap_err();
    assert_eq!(err.to_string(), "timeout");
    assert!(started.elapsed() >= Duration::from_millis(100));

    // The peer answers at 200 ms; nothing blows up and the link stays usable.
    let uuid = match remote.recv_frame().await {
        Some(Frame::Call(call)) => call.uuid,
        other => panic!("expected the call frame, got {other:?}"),
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    remote.send_frame(&Frame::Response(ResponsePayload {
        uuid,
        error: String::new(),
        response: json!({"too": "late"}),
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!conn.is_closed());

    // A fresh call on the same connection completes normally.
    let waiter = conn.invoke("m/fast", obj(json!({}))).await.unwrap();
    let uuid = match remote.recv_frame().await {
        Some(Frame::Call(call)) => call.uuid,
        other => panic!("expected the call frame, got {other:?}"),
    };
    remote.send_frame(&Frame::Response(ResponsePayload {
        uuid,
        error: String::new(),
        response: json!({"ok": true}),
    }));
    let reply = waiter.wait().await.unwrap();
    assert_eq!(reply, obj(json!({"ok": true})));
}

#[tokio::test]
async fn invoke_for_reports_timeout_through_the_callback() {
    let peer = MockPeer::start().await;
    let model = Model::new(
        Meta::parse(&json!({"name": "B"})).unwrap(),
        ModelOptions::default(),
    );
    let conn = model
        .dial(&peer.addr_string(), ConnOptions::default())
        .await
        .unwrap();
    let _remote = peer.accept().await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    conn.invoke_for(
        "m/slow",
        obj(json!({})),
        Duration::from_millis(100),
        move |result| {
            let _ = tx.send(result);
        },
    )
    .await
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback should fire")
        .unwrap();
    assert_eq!(result.unwrap_err().to_string(), "timeout");
}

#[tokio::test]
async fn remote_error_string_resolves_the_waiter() {
    let peer = MockPeer::start().await;
    let model = Model::new(
        Meta::parse(&json!({"name": "B"})).unwrap(),
        ModelOptions::default(),
    );
    let conn = model
        .dial(&peer.addr_string(), ConnOptions::default())
        .await
        .unwrap();
    let mut remote = peer.accept().await;

    let waiter = conn.invoke("m/f", obj(json!({}))).await.unwrap();
    let uuid = match remote.recv_frame().await {
        Some(Frame::Call(call)) => call.uuid,
        other => panic!("expected the call frame, got {other:?}"),
    };
    remote.send_frame(&Frame::Response(ResponsePayload {
        uuid,
        error: "engine stalled".to_owned(),
        response: json!({}),
    }));
    let err = waiter.wait().await.unwrap_err();
    assert_eq!(err.to_string(), "engine stalled");
}

#[tokio::test]
async fn responses_with_unknown_or_blank_uuid_are_dropped() {
    let peer = MockPeer::start().await;
    let model = Model::new(
        Meta::parse(&json!({"name": "B"})).unwrap(),
        ModelOptions::default(),
    );
    let conn = model
        .dial(&peer.addr_string(), ConnOptions::default())
        .await
        .unwrap();
    let remote = peer.accept().await;

    remote.send_frame(&Frame::Response(ResponsePayload {
        uuid: "never-issued".to_owned(),
        error: String::new(),
        response: json!({}),
    }));
    remote.send_frame(&Frame::Response(ResponsePayload {
        uuid: "   ".to_owned(),
        error: String::new(),
        response: json!({}),
    }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!conn.is_closed());
}
