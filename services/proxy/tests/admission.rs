//! Admission pipeline and routing, end to end over real TCP.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use proxy::{ProxyConfig, ProxyCore};
use tm_link::{ConnOptions, EventNotice, Model, ModelOptions, Transport, TransportWriter};
use tm_meta::Meta;
use tm_protocol::{Frame, SubOp};

fn obj(v: Value) -> serde_json::Map<String, Value> {
    v.as_object().unwrap().clone()
}

fn test_config() -> ProxyConfig {
    ProxyConfig {
        meta_wait: Duration::from_millis(500),
        conflict_grace: Duration::from_millis(200),
        backlog_cap: 64,
    }
}

async fn start_proxy(cfg: ProxyConfig) -> (String, ProxyCore) {
    let core = ProxyCore::new(cfg, None).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept_core = core.clone();
    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let transport = Transport::accept_tcp(stream, peer);
            tokio::spawn(proxy::handle_incoming(accept_core.clone(), transport));
        }
    });
    (addr, core)
}

fn car_model() -> Model {
    Model::new(
        Meta::parse(&json!({
            "name": "car/#1",
            "state": [{"name": "speed", "type": "uint"}]
        }))
        .unwrap(),
        ModelOptions::default(),
    )
}

async fn wait_admitted(core: &ProxyCore, name: &str) {
    for _ in 0..100 {
        if core.registry().names().iter().any(|n| n == name) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("model {name:?} was never admitted");
}

/// A protocol peer driven frame-by-frame from the test.
async fn raw_connect(addr: &str) -> (mpsc::UnboundedReceiver<Frame>, TransportWriter) {
    let transport = Transport::dial_tcp(addr).await.unwrap();
    let (mut reader, writer) = transport.split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(Some(text)) = reader.read_message().await {
            if let Ok(frame) = Frame::decode(&text) {
                let _ = tx.send(frame);
            }
        }
        // Dropping tx signals EOF to the test.
    });
    (rx, writer)
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<Frame> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}

async fn send(writer: &mut TransportWriter, frame: &Frame) {
    writer
        .write_message(&frame.encode().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn model_is_admitted_and_listed() {
    let (addr, core) = start_proxy(test_config()).await;

    let car = car_model();
    let _conn = car.dial(&addr, ConnOptions::default()).await.unwrap();
    wait_admitted(&core, "car/#1").await;

    // A hand-driven peer joins and interrogates the proxy.
    let (mut rx, mut writer) = raw_connect(&addr).await;
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::QueryMeta)));
    send(&mut writer, &Frame::MetaInfo(json!({"name": "watcher"}))).await;
    wait_admitted(&core, "watcher").await;

    send(
        &mut writer,
        &Frame::Call(tm_protocol::CallPayload {
            name: "proxy/GetOnlineModels".to_owned(),
            uuid: "u1".to_owned(),
            args: obj(json!({})),
        }),
    )
    .await;
    let response = loop {
        match next_frame(&mut rx).await {
            Some(Frame::Response(r)) => break r,
            Some(_) => continue,
            None => panic!("link closed before the response"),
        }
    };
    assert_eq!(response.uuid, "u1");
    assert_eq!(response.error, "");
    let names = response.response["modelNames"].as_array().unwrap().clone();
    assert!(names.contains(&json!("car/#1")));
    assert!(names.contains(&json!("watcher")));
}

#[tokio::test]
async fn duplicate_name_is_notified_and_rejected() {
    let (addr, core) = start_proxy(test_config()).await;

    let first = car_model();
    let first_conn = first.dial(&addr, ConnOptions::default()).await.unwrap();
    wait_admitted(&core, "car/#1").await;

    // The second `car/#1` registers an event handler so the advisory push
    // to the offender is observable.
    let (tx, mut rx) = mpsc::unbounded_channel::<EventNotice>();
    let opts = ConnOptions {
        on_event: Some(Arc::new(move |notice| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(notice);
            }
            .boxed()
        })),
        ..ConnOptions::default()
    };
    let second = car_model();
    let second_conn = second.dial(&addr, opts).await.unwrap();

    let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("offender must receive the advisory event")
        .unwrap();
    assert_eq!(notice.full_name, "proxy/repeatModelNameError");
    assert_eq!(notice.args["modelName"], json!("car/#1"));

    // After the grace the offender is closed; the incumbent is untouched.
    tokio::time::timeout(Duration::from_secs(5), second_conn.wait_closed())
        .await
        .expect("offender must be closed");
    assert!(!first_conn.is_closed());
    assert_eq!(core.registry().names(), vec!["car/#1".to_owned()]);
}

#[tokio::test]
async fn schema_timeout_closes_the_peer() {
    let (addr, core) = start_proxy(test_config()).await;

    let (mut rx, _writer) = raw_connect(&addr).await;
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::QueryMeta)));
    // Never answer; the proxy hangs up after meta_wait.
    let eof = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    assert_eq!(eof.expect("proxy should close the link"), None);
    assert!(core.registry().names().is_empty());
}

#[tokio::test]
async fn invalid_schema_is_notified_then_closed() {
    let (addr, core) = start_proxy(test_config()).await;

    let (mut rx, mut writer) = raw_connect(&addr).await;
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::QueryMeta)));
    // Empty name: fails schema validation.
    send(&mut writer, &Frame::MetaInfo(json!({"name": ""}))).await;

    let event = loop {
        match next_frame(&mut rx).await {
            Some(Frame::Event(e)) => break e,
            Some(_) => continue,
            None => panic!("expected the advisory event before close"),
        }
    };
    assert_eq!(event.name, "proxy/metaCheckError");
    assert!(event.args["detail"].as_str().unwrap().contains("name"));

    let eof = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
    assert_eq!(eof.expect("proxy should close the link"), None);
    assert!(core.registry().names().is_empty());
}

#[tokio::test]
async fn pre_admission_subscriptions_survive_promotion_and_route() {
    let (addr, core) = start_proxy(test_config()).await;

    // The watcher subscribes *before* answering query-meta: those frames
    // must be buffered and drained on promotion.
    let (mut rx, mut writer) = raw_connect(&addr).await;
    send(
        &mut writer,
        &Frame::SubscribeState {
            op: SubOp::Set,
            names: vec![
                "car/#1/speed".to_owned(),
                "proxy/onlineModelCount".to_owned(),
            ],
        },
    )
    .await;
    assert!(matches!(next_frame(&mut rx).await, Some(Frame::QueryMeta)));
    send(&mut writer, &Frame::MetaInfo(json!({"name": "watcher"}))).await;
    wait_admitted(&core, "watcher").await;

    // A publisher comes online; its admission bumps the online count, which
    // the watcher subscribed to pre-admission.
    let car = car_model();
    let _car_conn = car.dial(&addr, ConnOptions::default()).await.unwrap();
    wait_admitted(&core, "car/#1").await;

    // The count may first arrive as 1 (watcher alone) depending on how the
    // backlog drain raced the first push; wait for it to reach 2.
    loop {
        match next_frame(&mut rx).await {
            Some(Frame::State(s))
                if s.name == "proxy/onlineModelCount" && s.data == json!(2) =>
            {
                break;
            }
            Some(_) => continue,
            None => panic!("link closed waiting for the online count"),
        }
    }

    // The aggregated upstream subscription reaches the publisher, so its
    // pushes flow back through the proxy to the watcher.  Push until the
    // subscription has propagated.
    let mut speed = None;
    'push: for _ in 0..50 {
        car.push_state("speed", json!(88), true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(frame) = rx.try_recv() {
            if let Frame::State(s) = frame {
                if s.name == "car/#1/speed" {
                    speed = Some(s.data);
                    break 'push;
                }
            }
        }
    }
    assert_eq!(speed, Some(json!(88)));
}

#[tokio::test]
async fn calls_are_bridged_between_admitted_models() {
    let (addr, core) = start_proxy(test_config()).await;

    // Callee: a real model with a method, connected through the proxy.
    let callee = Model::new(
        Meta::parse(&json!({
            "name": "car/#1",
            "method": [{
                "name": "Honk",
                "args": [],
                "response": [{"name": "ok", "type": "bool"}]
            }]
        }))
        .unwrap(),
        ModelOptions {
            on_call: Some(Arc::new(|_req| {
                async move { obj(json!({"ok": true})) }.boxed()
            })),
            verify_resp: true,
        },
    );
    let _callee_conn = callee.dial(&addr, ConnOptions::default()).await.unwrap();
    wait_admitted(&core, "car/#1").await;

    // Caller: a second model; its call names the callee, so the proxy must
    // bridge it.
    let caller = Model::new(
        Meta::parse(&json!({"name": "remote"})).unwrap(),
        ModelOptions::default(),
    );
    let caller_conn = caller.dial(&addr, ConnOptions::default()).await.unwrap();
    wait_admitted(&core, "remote").await;

    let reply = caller_conn
        .call("car/#1/Honk", obj(json!({})))
        .await
        .unwrap();
    assert_eq!(reply, obj(json!({"ok": true})));

    // A call to a model nobody admitted comes back as an error.
    let err = caller_conn
        .call("ghost/Honk", obj(json!({})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"), "got: {err}");
}
