//! End-to-end call dispatch between two models over real TCP.

use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{Value, json};

use tm_link::{CallHandler, CallRequest, ConnOptions, Model, ModelOptions, TcpServer};
use tm_meta::Meta;

fn obj(v: Value) -> serde_json::Map<String, Value> {
    v.as_object().expect("object literal").clone()
}

fn car_meta() -> Meta {
    Meta::parse(&json!({
        "name": "A/car/#1/tpqs",
        "method": [
            {"name": "QS",
             "args": [
                {"name": "angle", "type": "int"},
                {"name": "speed", "type": "string", "option": ["low", "middle", "high"]}
             ],
             "response": [
                {"name": "res", "type": "bool"},
                {"name": "time", "type": "uint"},
                {"name": "code", "type": "int", "option": [0, 1, 2, 3, 4]}
             ]}
        ]
    }))
    .unwrap()
}

fn qs_handler() -> CallHandler {
    Arc::new(|req: CallRequest| {
        async move {
            assert_eq!(req.name, "QS");
            obj(json!({"res": false, "msg": "off", "time": 100, "code": 2}))
        }
        .boxed()
    })
}

async fn serve(model: &Model) -> String {
    let server = TcpServer::bind(model, "127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();
    tokio::spawn(server.run());
    addr
}

fn caller_model() -> Model {
    Model::new(
        Meta::parse(&json!({"name": "B"})).unwrap(),
        ModelOptions::default(),
    )
}

#[tokio::test]
async fn valid_call_returns_verified_response() {
    let callee = Model::new(
        car_meta(),
        ModelOptions {
            on_call: Some(qs_handler()),
            verify_resp: true,
        },
    );
    let addr = serve(&callee).await;

    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();
    let reply = conn
        .call(
            "A/car/#1/tpqs/QS",
            obj(json!({"angle": 90, "speed": "middle"})),
        )
        .await
        .unwrap();
    // The extra `msg` field rides along; declared fields are verified.
    assert_eq!(
        reply,
        obj(json!({"res": false, "msg": "off", "time": 100, "code": 2}))
    );
}

#[tokio::test]
async fn unmatched_model_name_is_rejected() {
    let callee = Model::new(
        car_meta(),
        ModelOptions {
            on_call: Some(qs_handler()),
            verify_resp: false,
        },
    );
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    let err = conn
        .call("unknown/QS", obj(json!({"angle": 90, "speed": "middle"})))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), r#"modelName "unknown": unmatched"#);
}

#[tokio::test]
async fn name_without_separator_is_rejected() {
    let callee = Model::new(car_meta(), ModelOptions::default());
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    let err = conn.call("noslash", obj(json!({}))).await.unwrap_err();
    assert_eq!(err.to_string(), "fullName is invalid format");
}

#[tokio::test]
async fn missing_handler_answers_no_callback() {
    let callee = Model::new(car_meta(), ModelOptions::default());
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    let err = conn
        .call(
            "A/car/#1/tpqs/QS",
            obj(json!({"angle": 90, "speed": "middle"})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "NO callback");
}

#[tokio::test]
async fn invalid_args_surface_the_verifier_message() {
    let callee = Model::new(
        car_meta(),
        ModelOptions {
            on_call: Some(qs_handler()),
            verify_resp: false,
        },
    );
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    // Unknown method
    let err = conn
        .call("A/car/#1/tpqs/WarpDrive", obj(json!({})))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("WarpDrive"), "got: {err}");

    // Option violation
    let err = conn
        .call(
            "A/car/#1/tpqs/QS",
            obj(json!({"angle": 90, "speed": "ludicrous"})),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("option"), "got: {err}");
}

#[tokio::test]
async fn bad_response_is_caught_when_verify_resp_is_set() {
    let broken: CallHandler = Arc::new(|_req| {
        // `time` is declared uint but returned negative.
        async move { obj(json!({"res": true, "time": -5, "code": 2})) }.boxed()
    });
    let callee = Model::new(
        car_meta(),
        ModelOptions {
            on_call: Some(broken),
            verify_resp: true,
        },
    );
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    let err = conn
        .call(
            "A/car/#1/tpqs/QS",
            obj(json!({"angle": 90, "speed": "middle"})),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("time"), "got: {err}");
}

#[tokio::test]
async fn invoke_cb_delivers_asynchronously() {
    let callee = Model::new(
        car_meta(),
        ModelOptions {
            on_call: Some(qs_handler()),
            verify_resp: true,
        },
    );
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    conn.invoke_cb(
        "A/car/#1/tpqs/QS",
        obj(json!({"angle": 90, "speed": "middle"})),
        move |result| {
            let _ = tx.send(result);
        },
    )
    .await
    .unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .expect("callback should fire")
        .unwrap();
    assert_eq!(result.unwrap()["code"], json!(2));
}

#[tokio::test]
async fn peer_schema_is_fetched_over_the_wire() {
    let callee = Model::new(car_meta(), ModelOptions::default());
    let addr = serve(&callee).await;
    let conn = caller_model()
        .dial(&addr, ConnOptions::default())
        .await
        .unwrap();

    let meta = conn.peer_meta().await.unwrap();
    assert_eq!(meta.name(), "A/car/#1/tpqs");
    assert!(meta.has_method("QS"));

    // Cached thereafter: identical result, same Arc.
    let again = conn.peer_meta().await.unwrap();
    assert!(Arc::ptr_eq(&meta, &again));
}
