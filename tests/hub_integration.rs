//! End-to-end exercises against a real bound listener: a websocket client
//! drives the signaling hub the way a browser would, mirroring scenarios
//! S1 (join/leave), S2 (lock), and S3 (kick) from the session model.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use sendie_server::config::{AccessControl, Config, Http, Log, Session};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (std::net::SocketAddr, Arc<sendie_server::state::AppState>) {
    let config = Arc::new(Config {
        http: Http { listen: "127.0.0.1:0".parse().unwrap() },
        access_control: AccessControl { admins: vec![], initial_allow_list: vec![] },
        session: Session::default(),
        data_directory: std::env::temp_dir().join(format!("sendie-it-{}", sendie_core::generate_token())).to_string_lossy().into_owned(),
        ice_servers: vec![],
        log: Log::default(),
    });

    let (listener, state) = sendie_server::bind(config).await.expect("bind ephemeral listener");
    let addr = listener.local_addr().unwrap();
    let state_for_serve = state.clone();
    tokio::spawn(async move {
        let _ = sendie_server::serve(listener, state_for_serve).await;
    });

    (addr, state)
}

async fn connect(addr: std::net::SocketAddr, user_id: &str) -> Client {
    let url = format!("ws://{addr}/hub");
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert("x-sendie-user-id", HeaderValue::from_str(user_id).unwrap());
    let (ws, _) = connect_async(request).await.expect("websocket handshake");
    ws
}

async fn send(client: &mut Client, id: u64, method: &str, params: Value) {
    let frame = json!({ "id": id, "method": method, "params": params });
    client.send(tokio_tungstenite::tungstenite::Message::Text(frame.to_string().into())).await.unwrap();
}

async fn recv_json(client: &mut Client) -> Value {
    loop {
        match client.next().await.expect("stream ended").unwrap() {
            tokio_tungstenite::tungstenite::Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

async fn create_session_http(addr: std::net::SocketAddr, user_id: &str) -> String {
    let body = post_create_session(addr, user_id).await;
    body["id"].as_str().unwrap().to_string()
}

/// Minimal hand-rolled HTTP POST: the crate has no HTTP client dependency,
/// so the session-create call is issued directly over a raw TCP connection.
async fn post_create_session(addr: std::net::SocketAddr, user_id: &str) -> Value {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = "{}";
    let request = format!(
        "POST /sessions HTTP/1.1\r\nHost: {addr}\r\nx-sendie-user-id: {user_id}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    let body_start = text.find("\r\n\r\n").expect("http response has a body") + 4;
    serde_json::from_str(&text[body_start..]).expect("json body")
}

#[tokio::test]
async fn s1_join_then_leave_notifies_peers() {
    let (addr, _state) = spawn_server().await;
    let session_id = create_session_http(addr, "host-user").await;

    let mut host = connect(addr, "host-user").await;
    send(&mut host, 1, "join_session", json!({ "session_id": session_id })).await;
    let host_ack = recv_json(&mut host).await;
    assert_eq!(host_ack["result"]["success"], true);
    assert_eq!(host_ack["result"]["is_host"], true);

    let mut guest = connect(addr, "guest-user").await;
    send(&mut guest, 1, "join_session", json!({ "session_id": session_id })).await;
    let guest_ack = recv_json(&mut guest).await;
    assert_eq!(guest_ack["result"]["success"], true);
    assert_eq!(guest_ack["result"]["is_host"], false);

    let host_saw_join = recv_json(&mut host).await;
    assert_eq!(host_saw_join["event"], "peer_joined");

    send(&mut guest, 2, "leave_session", json!({})).await;
    let _ack = recv_json(&mut guest).await;

    let host_saw_leave = recv_json(&mut host).await;
    assert_eq!(host_saw_leave["event"], "peer_left");
}

#[tokio::test]
async fn s2_lock_session_blocks_new_joins() {
    let (addr, _state) = spawn_server().await;
    let session_id = create_session_http(addr, "host-user").await;

    let mut host = connect(addr, "host-user").await;
    send(&mut host, 1, "join_session", json!({ "session_id": session_id })).await;
    let _ack = recv_json(&mut host).await;

    send(&mut host, 2, "lock_session", json!({})).await;
    let lock_ack = recv_json(&mut host).await;
    assert_eq!(lock_ack["result"]["success"], true);

    let host_saw_lock_broadcast = recv_json(&mut host).await;
    assert_eq!(host_saw_lock_broadcast["event"], "session_locked");

    let mut guest = connect(addr, "guest-user").await;
    send(&mut guest, 1, "join_session", json!({ "session_id": session_id })).await;
    let guest_ack = recv_json(&mut guest).await;
    assert_eq!(guest_ack["result"]["success"], false);
}

#[tokio::test]
async fn s3_kick_peer_disconnects_target() {
    let (addr, _state) = spawn_server().await;
    let session_id = create_session_http(addr, "host-user").await;

    let mut host = connect(addr, "host-user").await;
    send(&mut host, 1, "join_session", json!({ "session_id": session_id })).await;
    let _ack = recv_json(&mut host).await;

    let mut guest = connect(addr, "guest-user").await;
    send(&mut guest, 1, "join_session", json!({ "session_id": session_id })).await;
    let guest_ack = recv_json(&mut guest).await;
    let existing_peers = guest_ack["result"]["existing_peers"].as_array().unwrap();
    assert!(existing_peers.is_empty());

    // The host only learns the guest's connection handle from the
    // peer_joined broadcast its own channel receives.
    let host_saw_join = recv_json(&mut host).await;
    assert_eq!(host_saw_join["event"], "peer_joined");
    let target_handle = host_saw_join["data"]["handle"].as_str().unwrap().to_string();

    send(&mut host, 2, "kick_peer", json!({ "target_handle": target_handle })).await;
    let kick_ack = recv_json(&mut host).await;
    assert_eq!(kick_ack["result"]["success"], true);

    let guest_kicked = recv_json(&mut guest).await;
    assert_eq!(guest_kicked["event"], "kicked");
}
