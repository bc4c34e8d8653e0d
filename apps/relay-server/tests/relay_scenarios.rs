// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_server::Config;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn test_config(recordings_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.recordings.dir = recordings_dir.to_string_lossy().into_owned();
    config.session.max_listeners = 10;
    config
}

async fn start_test_server(config: Config) -> Option<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(e) => panic!("failed to bind test server listener: {e}"),
    };
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        let (app, _state) = relay_server::server::create_app(config);
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    Some((addr, server_handle))
}

async fn create_session(addr: SocketAddr) -> Value {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/api/session/create"))
        .send()
        .await
        .expect("failed to create session");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response.json().await.expect("create response was not JSON")
}

async fn next_text_frame(
    stream: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Value {
    loop {
        match stream.next().await.expect("stream ended unexpectedly").unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn create_session_returns_listen_url_and_token() {
    let dir = tempfile::tempdir().unwrap();
    let Some((addr, _handle)) = start_test_server(test_config(dir.path())).await else {
        eprintln!("skipping: local TCP bind not permitted");
        return;
    };

    let body = create_session(addr).await;
    let session_id = body["sessionId"].as_str().unwrap();
    let token = body["token"].as_str().unwrap();
    assert_eq!(session_id.len(), 8);
    assert_eq!(token.len(), 32);
    assert_eq!(
        body["listenUrl"].as_str().unwrap(),
        format!("/listener.html?sid={session_id}&t={token}")
    );
}

#[tokio::test]
async fn listener_with_wrong_token_is_refused_the_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let Some((addr, _handle)) = start_test_server(test_config(dir.path())).await else {
        eprintln!("skipping: local TCP bind not permitted");
        return;
    };

    let body = create_session(addr).await;
    let session_id = body["sessionId"].as_str().unwrap();

    let url = format!("ws://{addr}/?sid={session_id}&role=listener&t=wrong-token");
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    let tokio_tungstenite::tungstenite::Error::Http(response) = err else {
        panic!("expected an HTTP-level rejection, got: {err:?}");
    };
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn late_joiner_receives_init_segment_then_live_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let Some((addr, _handle)) = start_test_server(test_config(dir.path())).await else {
        eprintln!("skipping: local TCP bind not permitted");
        return;
    };

    let body = create_session(addr).await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    let token = body["token"].as_str().unwrap().to_string();

    let (mut broadcaster, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sid={session_id}&role=broadcaster"))
            .await
            .expect("broadcaster failed to connect");

    broadcaster.send(WsMessage::Binary(b"first-chunk".to_vec().into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut listener, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/?sid={session_id}&role=listener&t={token}"
    ))
    .await
    .expect("listener failed to connect");

    let ok_frame = next_text_frame(&mut listener).await;
    assert_eq!(ok_frame["type"], "ok");

    let started_frame = next_text_frame(&mut listener).await;
    assert_eq!(started_frame["type"], "broadcast-started");

    let init_frame = next_text_frame(&mut listener).await;
    assert_eq!(init_frame["type"], "init-segment");

    let init_bytes = match listener.next().await.unwrap().unwrap() {
        WsMessage::Binary(data) => data,
        other => panic!("expected binary init segment, got {other:?}"),
    };
    assert_eq!(init_bytes.as_ref(), b"first-chunk");

    broadcaster.send(WsMessage::Binary(b"second-chunk".to_vec().into())).await.unwrap();

    let live_bytes = match listener.next().await.unwrap().unwrap() {
        WsMessage::Binary(data) => data,
        other => panic!("expected binary live chunk, got {other:?}"),
    };
    assert_eq!(live_bytes.as_ref(), b"second-chunk");
}

#[tokio::test]
async fn second_broadcaster_is_refused_with_error_frame() {
    let dir = tempfile::tempdir().unwrap();
    let Some((addr, _handle)) = start_test_server(test_config(dir.path())).await else {
        eprintln!("skipping: local TCP bind not permitted");
        return;
    };

    let body = create_session(addr).await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();

    let (_first, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sid={session_id}&role=broadcaster"))
            .await
            .expect("first broadcaster failed to connect");

    let (mut second, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sid={session_id}&role=broadcaster"))
            .await
            .expect("second broadcaster upgrade should still succeed at the HTTP layer");

    let error_frame = next_text_frame(&mut second).await;
    assert_eq!(error_frame["type"], "error");
}

#[tokio::test]
async fn stopping_a_session_ends_its_listeners_and_persists_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let Some((addr, _handle)) = start_test_server(test_config(dir.path())).await else {
        eprintln!("skipping: local TCP bind not permitted");
        return;
    };

    let body = create_session(addr).await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    let token = body["token"].as_str().unwrap().to_string();

    let (mut broadcaster, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sid={session_id}&role=broadcaster"))
            .await
            .expect("broadcaster failed to connect");
    broadcaster.send(WsMessage::Binary(b"recorded-bytes".to_vec().into())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut listener, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/?sid={session_id}&role=listener&t={token}"
    ))
    .await
    .expect("listener failed to connect");
    let _ok = next_text_frame(&mut listener).await;
    let _started = next_text_frame(&mut listener).await;
    let _init_frame = next_text_frame(&mut listener).await;
    let _init_bytes = listener.next().await.unwrap().unwrap();

    let client = reqwest::Client::new();
    let stop_response = client
        .post(format!("http://{addr}/api/session/{session_id}/stop"))
        .send()
        .await
        .expect("stop request failed");
    assert_eq!(stop_response.status(), reqwest::StatusCode::OK);
    let stop_body: Value = stop_response.json().await.unwrap();
    assert_eq!(stop_body["ok"], true);
    let recording_name = stop_body["recording"].as_str().unwrap().to_string();

    let ended_frame = next_text_frame(&mut listener).await;
    assert_eq!(ended_frame["type"], "session-ended");
    assert_eq!(ended_frame["reason"], "stopped-by-broadcaster");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let recording_response = client
        .get(format!("http://{addr}/api/recording/{recording_name}"))
        .send()
        .await
        .expect("recording fetch failed");
    assert_eq!(recording_response.status(), reqwest::StatusCode::OK);
    let recording_bytes = recording_response.bytes().await.unwrap();
    assert_eq!(recording_bytes.as_ref(), b"recorded-bytes");
}

#[tokio::test]
async fn recording_path_traversal_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let Some((addr, _handle)) = start_test_server(test_config(dir.path())).await else {
        eprintln!("skipping: local TCP bind not permitted");
        return;
    };

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/recording/..%2F..%2Fetc%2Fpasswd"))
        .send()
        .await
        .expect("request failed");
    assert_ne!(response.status(), reqwest::StatusCode::OK);
}
