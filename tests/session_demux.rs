//! Session-level demultiplexing behavior over an in-memory transport pair,
//! with the test body scripting the peer side of the connection.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use sluice::{
    AuthRequest, Error, GetOrLoadEndpoint, LoadModelEndpoint, ServerErrorKind, Session, Transport,
};

async fn accept_auth(peer: &Transport) {
    let auth = peer.recv_json().await.unwrap();
    assert_eq!(auth["authVersion"], 1);
    assert!(auth["clientIdentifier"].is_string());
    assert!(auth["clientPasskey"].is_string());
    peer.send_json(&json!({"success": true})).await.unwrap();
}

async fn recv_channel_create(peer: &Transport) -> (u64, Value) {
    let create = peer.recv_json().await.unwrap();
    assert_eq!(create["type"], "channelCreate");
    (create["channelId"].as_u64().unwrap(), create)
}

fn load_success(channel_id: u64, identifier: &str) -> Value {
    json!({
        "type": "channelSend",
        "channelId": channel_id,
        "message": {
            "type": "success",
            "info": {
                "identifier": identifier,
                "instanceReference": format!("ref-{identifier}"),
                "path": format!("models/{identifier}.gguf"),
            },
        },
    })
}

fn load_progress(channel_id: u64, progress: f64) -> Value {
    json!({
        "type": "channelSend",
        "channelId": channel_id,
        "message": {"type": "loadProgress", "progress": progress},
    })
}

#[tokio::test]
async fn concurrent_consumers_each_see_only_their_own_messages() {
    let (client, peer) = Transport::mem_pair();

    let server = tokio::spawn(async move {
        accept_auth(&peer).await;
        let (id_a, create_a) = recv_channel_create(&peer).await;
        assert_eq!(create_a["endpoint"], "loadModel");
        let (id_b, _) = recv_channel_create(&peer).await;
        let call = peer.recv_json().await.unwrap();
        assert_eq!(call["type"], "rpcCall");
        assert_eq!(call["endpoint"], "echo");
        let call_id = call["callId"].as_u64().unwrap();

        // Interleave traffic for all three consumers.
        peer.send_json(&load_progress(id_a, 0.5)).await.unwrap();
        peer.send_json(&load_progress(id_b, 0.25)).await.unwrap();
        peer.send_json(&json!({
            "type": "rpcResult", "callId": call_id, "result": {"echoed": true},
        }))
        .await
        .unwrap();
        peer.send_json(&load_success(id_b, "model-b")).await.unwrap();
        peer.send_json(&load_success(id_a, "model-a")).await.unwrap();
        peer.send_json(&json!({"type": "channelClose", "channelId": id_a}))
            .await
            .unwrap();
        peer.send_json(&json!({"type": "channelClose", "channelId": id_b}))
            .await
            .unwrap();
    });

    let session = Session::connect(client, AuthRequest::generate())
        .await
        .unwrap();

    let progress_a: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_b: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_a = progress_a.clone();
    let sink_b = progress_b.clone();

    let mut channel_a = session
        .open_channel(
            LoadModelEndpoint::new("model-a", None, None, json!({}))
                .on_progress(move |p| sink_a.lock().unwrap().push(p)),
        )
        .await
        .unwrap();
    let mut channel_b = session
        .open_channel(
            LoadModelEndpoint::new("model-b", None, None, json!({}))
                .on_progress(move |p| sink_b.lock().unwrap().push(p)),
        )
        .await
        .unwrap();

    let (call_result, result_a, result_b) = tokio::join!(
        session.remote_call("echo", Some(json!({"x": 1}))),
        channel_a.wait_for_result(),
        channel_b.wait_for_result(),
    );

    assert_eq!(call_result.unwrap(), json!({"echoed": true}));
    assert_eq!(result_a.unwrap().identifier, "model-a");
    assert_eq!(result_b.unwrap().identifier, "model-b");
    // Each channel observed exactly its own progress stream.
    assert_eq!(*progress_a.lock().unwrap(), vec![0.5, 1.0]);
    assert_eq!(*progress_b.lock().unwrap(), vec![0.25, 1.0]);

    server.await.unwrap();
}

#[tokio::test]
async fn identifiers_are_never_reused_across_open_close_cycles() {
    let (client, peer) = Transport::mem_pair();

    let server = tokio::spawn(async move {
        accept_auth(&peer).await;
        let mut seen = Vec::new();
        for round in 0..3 {
            let (channel_id, _) = recv_channel_create(&peer).await;
            seen.push(channel_id);
            peer.send_json(&load_success(channel_id, &format!("model-{round}")))
                .await
                .unwrap();
            peer.send_json(&json!({"type": "channelClose", "channelId": channel_id}))
                .await
                .unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);

        for _ in 0..2 {
            let call = peer.recv_json().await.unwrap();
            let call_id = call["callId"].as_u64().unwrap();
            peer.send_json(&json!({"type": "rpcResult", "callId": call_id}))
                .await
                .unwrap();
        }
    });

    let session = Session::connect(client, AuthRequest::generate())
        .await
        .unwrap();
    for round in 0..3 {
        let mut channel = session
            .open_channel(GetOrLoadEndpoint::new(format!("model-{round}"), None, json!({})))
            .await
            .unwrap();
        channel
            .wait_for_result()
            .await
            .unwrap_or_else(|_| panic!("load {round} failed"));
        // Channel drops here; its id must not be handed out again.
    }

    // Call ids advance on their own counter.
    assert_eq!(session.remote_call("ping", None).await.unwrap(), Value::Null);
    assert_eq!(session.remote_call("ping", None).await.unwrap(), Value::Null);

    server.await.unwrap();
}

#[tokio::test]
async fn disconnect_releases_every_pending_consumer() {
    let (client, peer) = Transport::mem_pair();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    let server = tokio::spawn(async move {
        accept_auth(&peer).await;
        let _ = recv_channel_create(&peer).await;
        let _ = recv_channel_create(&peer).await;
        let call = peer.recv_json().await.unwrap();
        assert_eq!(call["type"], "rpcCall");
        // Never reply; just confirm everything is in flight.
        ready_tx.send(()).unwrap();
    });

    let session = Session::connect(client, AuthRequest::generate())
        .await
        .unwrap();
    let mut channel_a = session
        .open_channel(GetOrLoadEndpoint::new("model-a", None, json!({})))
        .await
        .unwrap();
    let mut channel_b = session
        .open_channel(GetOrLoadEndpoint::new("model-b", None, json!({})))
        .await
        .unwrap();
    let call_session = session.clone();
    let call_task =
        tokio::spawn(async move { call_session.remote_call("slow", None).await });

    ready_rx.await.unwrap();
    session.disconnect().await;

    assert!(matches!(
        channel_a.wait_for_result().await,
        Err(Error::Connection { .. })
    ));
    assert!(matches!(
        channel_b.wait_for_result().await,
        Err(Error::Connection { .. })
    ));
    assert!(matches!(
        call_task.await.unwrap(),
        Err(Error::Connection { .. })
    ));

    server.await.unwrap();
}

#[tokio::test]
async fn authentication_rejection_surfaces_as_auth_error() {
    let (client, peer) = Transport::mem_pair();
    let server = tokio::spawn(async move {
        let _ = peer.recv_json().await.unwrap();
        peer.send_json(&json!({"success": false, "error": {"title": "bad passkey"}}))
            .await
            .unwrap();
    });

    match Session::connect(client, AuthRequest::generate()).await {
        Err(Error::Authentication { details }) => {
            assert_eq!(details["title"], "bad passkey");
        }
        other => panic!("expected authentication error, got {other:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn transport_drop_during_handshake_is_a_connection_error() {
    let (client, peer) = Transport::mem_pair();
    drop(peer);
    assert!(matches!(
        Session::connect(client, AuthRequest::generate()).await,
        Err(Error::Connection { .. })
    ));
}

#[tokio::test]
async fn stray_messages_do_not_disturb_live_consumers() {
    let (client, peer) = Transport::mem_pair();

    let server = tokio::spawn(async move {
        accept_auth(&peer).await;
        let (channel_id, _) = recv_channel_create(&peer).await;
        peer.send_json(&load_success(channel_id, "model-a"))
            .await
            .unwrap();
        peer.send_json(&json!({"type": "channelClose", "channelId": channel_id}))
            .await
            .unwrap();

        // Post-close echo (below the id counter): dropped silently.
        peer.send_json(&json!({"type": "channelClose", "channelId": channel_id}))
            .await
            .unwrap();
        // Not-yet-used channel id: logged as an anomaly, still dropped.
        peer.send_json(&load_progress(99, 0.5)).await.unwrap();
        // Response to a call nobody made: dropped with a warning.
        peer.send_json(&json!({"type": "rpcResult", "callId": 42, "result": 1}))
            .await
            .unwrap();

        let call = peer.recv_json().await.unwrap();
        let call_id = call["callId"].as_u64().unwrap();
        peer.send_json(&json!({"type": "rpcResult", "callId": call_id, "result": "alive"}))
            .await
            .unwrap();
    });

    let session = Session::connect(client, AuthRequest::generate())
        .await
        .unwrap();
    let mut channel = session
        .open_channel(GetOrLoadEndpoint::new("model-a", None, json!({})))
        .await
        .unwrap();
    channel.wait_for_result().await.unwrap();
    drop(channel);

    // The session keeps serving new work after the stray traffic.
    let result = session.remote_call("ping", None).await.unwrap();
    assert_eq!(result, json!("alive"));

    server.await.unwrap();
}

#[tokio::test]
async fn channel_error_reaches_only_its_own_channel() {
    let (client, peer) = Transport::mem_pair();

    let server = tokio::spawn(async move {
        accept_auth(&peer).await;
        let (id_a, _) = recv_channel_create(&peer).await;
        let (id_b, _) = recv_channel_create(&peer).await;
        peer.send_json(&json!({
            "type": "channelError",
            "channelId": id_a,
            "error": {"title": "no matching model", "displayData": {"code": "generic.noModelMatchingQuery"}},
        }))
        .await
        .unwrap();
        peer.send_json(&load_success(id_b, "model-b")).await.unwrap();
        peer.send_json(&json!({"type": "channelClose", "channelId": id_b}))
            .await
            .unwrap();
    });

    let session = Session::connect(client, AuthRequest::generate())
        .await
        .unwrap();
    let mut channel_a = session
        .open_channel(GetOrLoadEndpoint::new("missing", None, json!({})))
        .await
        .unwrap();
    let mut channel_b = session
        .open_channel(GetOrLoadEndpoint::new("model-b", None, json!({})))
        .await
        .unwrap();

    match channel_a.wait_for_result().await {
        Err(Error::Server(err)) => assert_eq!(err.kind, ServerErrorKind::ModelNotFound),
        other => panic!("expected server error, got {other:?}"),
    }
    // The sibling channel is unaffected.
    assert_eq!(channel_b.wait_for_result().await.unwrap().identifier, "model-b");

    server.await.unwrap();
}
