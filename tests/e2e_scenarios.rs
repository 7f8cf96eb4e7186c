// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios over two live sessions wired through the in-memory
//! transport: wire fidelity, capability lifecycle, bidirectional calls,
//! and disconnect behavior.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cw_error::{ErrorKind, RpcError};
use cw_rpc::{MAIN_ID, RpcSession, RpcTarget, SessionConfig, Stub, Value};
use cw_testkit::{CallbackRecorder, TestTarget, connected_pair};
use tokio::time::timeout;

fn test_pair() -> (RpcSession, RpcSession, Arc<TestTarget>) {
    let target = Arc::new(TestTarget::new());
    let (client, server) = connected_pair(
        SessionConfig::client(),
        SessionConfig::server().with_local_main(Arc::clone(&target) as Arc<dyn RpcTarget>),
    );
    (client, server, target)
}

async fn echo(client: &RpcSession, value: Value) -> Value {
    client.call(MAIN_ID, "echo", vec![value]).await.unwrap()
}

// ---------------------------------------------------------------------------
// Scenario 1 + 8: primitive and unicode round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn primitive_round_trips() {
    let (client, _server, _t) = test_pair();

    assert_eq!(echo(&client, Value::from(42i64)).await.as_i64(), Some(42));
    assert!(echo(&client, Value::Null).await.is_null());
    assert_eq!(echo(&client, Value::from("")).await.as_str(), Some(""));
    assert_eq!(echo(&client, Value::from(true)).await.as_bool(), Some(true));
    assert_eq!(
        echo(&client, Value::from(false)).await.as_bool(),
        Some(false)
    );
    assert_eq!(
        echo(&client, Value::from((1i64 << 53) - 1)).await.as_i64(),
        Some(9_007_199_254_740_991)
    );

    let negative_zero = echo(&client, Value::float(-0.0).unwrap()).await;
    let f = negative_zero.as_f64().unwrap();
    assert_eq!(f, 0.0);
    assert!(f.is_sign_negative());
}

#[tokio::test]
async fn unicode_round_trips() {
    let (client, _server, _t) = test_pair();
    let text = "日本語 🎉 \u{0} end";
    assert_eq!(echo(&client, Value::from(text)).await.as_str(), Some(text));
}

// ---------------------------------------------------------------------------
// Scenario 2: list escaping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_escaping_round_trips() {
    let (client, _server, _t) = test_pair();

    let empty = Value::List(vec![]);
    assert_eq!(echo(&client, empty.clone()).await, empty);

    let flat = Value::from(vec![
        Value::from(1i64),
        Value::from(2i64),
        Value::from(3i64),
    ]);
    assert_eq!(echo(&client, flat.clone()).await, flat);

    let nested = Value::from(vec![
        Value::from(vec![Value::from(1i64), Value::from(2i64)]),
        Value::from(vec![Value::from(3i64), Value::from(4i64)]),
    ]);
    assert_eq!(echo(&client, nested.clone()).await, nested);

    let mut map = std::collections::BTreeMap::new();
    map.insert(
        "a".to_owned(),
        Value::from(vec![Value::from(1i64), Value::from(2i64)]),
    );
    let object = Value::Object(map);
    assert_eq!(echo(&client, object.clone()).await, object);
}

// ---------------------------------------------------------------------------
// Scenario 3: bidirectional callback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bidirectional_callback() {
    let (client, _server, _t) = test_pair();

    let recorder = Arc::new(CallbackRecorder::new());
    let cb = Stub::local(Arc::clone(&recorder) as Arc<dyn RpcTarget>);

    client
        .call(MAIN_ID, "registerCallback", vec![Value::Cap(cb)])
        .await
        .unwrap();
    let result = client
        .call(MAIN_ID, "triggerCallback", vec![])
        .await
        .unwrap();

    assert_eq!(result.as_str(), Some("Got: ping"));
    assert_eq!(recorder.notifications(), ["ping".to_owned()]);
}

// ---------------------------------------------------------------------------
// Scenario 4: errors do not poison the session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_continuation() {
    let (client, server, _t) = test_pair();

    assert_eq!(
        client
            .call(MAIN_ID, "square", vec![Value::from(5i64)])
            .await
            .unwrap()
            .as_i64(),
        Some(25)
    );

    let err = client.call(MAIN_ID, "throwError", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Application);
    assert_eq!(err.message, "Test error");

    assert_eq!(
        client
            .call(MAIN_ID, "square", vec![Value::from(6i64)])
            .await
            .unwrap()
            .as_i64(),
        Some(36)
    );
    assert!(!server.is_closed());
}

// ---------------------------------------------------------------------------
// Scenario 5: concurrent mix with an error, ordered results
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_mix_preserves_order() {
    let (client, _server, _t) = test_pair();

    let outcomes = futures::future::join_all([
        client.call(MAIN_ID, "square", vec![Value::from(1i64)]),
        client.call(MAIN_ID, "square", vec![Value::from(2i64)]),
        client.call(MAIN_ID, "throwError", vec![]),
        client.call(MAIN_ID, "square", vec![Value::from(3i64)]),
        client.call(MAIN_ID, "square", vec![Value::from(4i64)]),
    ])
    .await;

    assert_eq!(outcomes[0].as_ref().unwrap().as_i64(), Some(1));
    assert_eq!(outcomes[1].as_ref().unwrap().as_i64(), Some(4));
    assert_eq!(
        outcomes[2].as_ref().unwrap_err().kind,
        ErrorKind::Application
    );
    assert_eq!(outcomes[3].as_ref().unwrap().as_i64(), Some(9));
    assert_eq!(outcomes[4].as_ref().unwrap().as_i64(), Some(16));
}

// ---------------------------------------------------------------------------
// Scenario 6: capability lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counter_releases_exactly_once_and_ids_are_fresh() {
    let (client, server, target) = test_pair();
    let disposals = target.counter_disposals();

    let first = client
        .call(MAIN_ID, "makeCounter", vec![Value::from(10i64)])
        .await
        .unwrap();
    let first_stub = first.as_cap().unwrap().clone();
    let first_id = first_stub.import_id().unwrap();

    assert_eq!(
        first_stub.call("increment", vec![]).await.unwrap().as_i64(),
        Some(11)
    );

    drop(first);
    first_stub.dispose();

    // Exactly one release reaches the server and the disposer runs once.
    timeout(Duration::from_secs(2), async {
        loop {
            if disposals.load(std::sync::atomic::Ordering::SeqCst) == 1
                && server.stats().exports == 1
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let second = client
        .call(MAIN_ID, "makeCounter", vec![Value::from(10i64)])
        .await
        .unwrap();
    let second_id = second.as_cap().unwrap().import_id().unwrap();
    assert_ne!(first_id, second_id, "ids are never reused");
}

// ---------------------------------------------------------------------------
// Scenario 7: disconnect mid-call
// ---------------------------------------------------------------------------

/// A callback that never answers, keeping `triggerCallback` in flight.
struct NeverAnswers;

#[async_trait]
impl RpcTarget for NeverAnswers {
    async fn call(&self, _method: Option<&str>, _args: Vec<Value>) -> Result<Value, RpcError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn disconnect_mid_call_fails_cleanly() {
    let (client, server, _t) = test_pair();

    client
        .call(
            MAIN_ID,
            "registerCallback",
            vec![Value::Cap(Stub::local(Arc::new(NeverAnswers)))],
        )
        .await
        .unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call(MAIN_ID, "triggerCallback", vec![]).await }
    });

    // Wait until the call is actually in flight, then cut the connection.
    timeout(Duration::from_secs(2), async {
        while client.stats().pending_calls == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    server.close().await;

    let err = timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);

    // No waiter leaked, and new calls fail fast.
    assert_eq!(client.stats().pending_calls, 0);
    let err = client.call(MAIN_ID, "echo", vec![]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);
}

// ---------------------------------------------------------------------------
// The rest of the built-in surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remaining_builtin_methods() {
    let (client, _server, _t) = test_pair();

    assert_eq!(
        client
            .call(MAIN_ID, "add", vec![Value::from(10i64), Value::from(20i64)])
            .await
            .unwrap()
            .as_i64(),
        Some(30)
    );
    assert_eq!(
        client
            .call(MAIN_ID, "greet", vec![Value::from("World")])
            .await
            .unwrap()
            .as_str(),
        Some("Hello, World!")
    );

    let fib = client
        .call(MAIN_ID, "generateFibonacci", vec![Value::from(6i64)])
        .await
        .unwrap();
    let got: Vec<i64> = fib
        .as_list()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(got, [0, 1, 1, 2, 3, 5]);

    assert!(
        client
            .call(MAIN_ID, "returnNull", vec![])
            .await
            .unwrap()
            .is_null()
    );
}
