//! End-to-end relay tests: real listener, real WebSocket clients.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tandem_core::{Switchboard, SwitchboardConfig};
use tandem_http::serve;
use tandem_http::ws::{ws_handler, WsState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const APP: &str = "4f1c5c1a-3d7e-4a9f-8c22-5a6cfb0d2a11";

struct Relay {
    addr: SocketAddr,
    _cancel: tokio_util::sync::DropGuard,
}

async fn spawn_relay(cfg: SwitchboardConfig, dev: bool, origins: &[&str]) -> Relay {
    let state = WsState {
        switchboard: Arc::new(Switchboard::new(cfg)),
        allowed_origins: Arc::new(origins.iter().map(|s| s.to_string()).collect::<HashSet<_>>()),
        dev,
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(serve(
        listener,
        app,
        cancel.clone(),
        Duration::from_secs(1),
    ));
    Relay {
        addr,
        _cancel: cancel.drop_guard(),
    }
}

async fn connect(relay: &Relay, side: &str) -> Client {
    let url = format!("ws://{}/ws?appID={APP}&side={side}&sid=s-{side}", relay.addr);
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

/// Next text frame as JSON, skipping protocol chatter.
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Read until the server closes the connection; returns the close frame.
async fn recv_close(client: &mut Client) -> Option<(CloseCode, String)> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => {
                return frame.map(|f| (f.code, f.reason.into_owned()));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

#[tokio::test]
async fn happy_path_pairing() {
    let relay = spawn_relay(SwitchboardConfig::default(), true, &[]).await;

    let mut a = connect(&relay, "A").await;
    let mut b = connect(&relay, "B").await;
    send_json(&mut b, json!({"type": "hello", "deliveredUpTo": 0})).await;

    // Both sides learn the room is full, exactly once each.
    assert_eq!(recv_json(&mut a).await, json!({"type": "room_full"}));
    assert_eq!(recv_json(&mut b).await, json!({"type": "room_full"}));

    send_json(&mut a, json!({"type": "send", "to": "B", "payload": {"k": 1}})).await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "deliver", "seq": 1, "from": "A", "payload": {"k": 1}})
    );
    send_json(&mut b, json!({"type": "delivered", "upTo": 1})).await;

    // A going away does not disturb B.
    drop(a);
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_json(&mut b, json!({"type": "hello", "deliveredUpTo": 1})).await;
    send_json(&mut b, json!({"type": "send", "to": "B", "payload": "self"})).await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "deliver", "seq": 2, "from": "B", "payload": "self"})
    );
}

#[tokio::test]
async fn signaling_is_forwarded_verbatim_and_only_to_the_peer() {
    let relay = spawn_relay(SwitchboardConfig::default(), true, &[]).await;
    let mut a = connect(&relay, "A").await;
    let mut b = connect(&relay, "B").await;
    assert_eq!(recv_json(&mut a).await, json!({"type": "room_full"}));
    assert_eq!(recv_json(&mut b).await, json!({"type": "room_full"}));

    send_json(&mut a, json!({"type": "offer", "sdp": "v=0"})).await;
    assert_eq!(recv_json(&mut b).await, json!({"type": "offer", "sdp": "v=0"}));

    send_json(&mut b, json!({"type": "ICE", "candidate": "c"})).await;
    assert_eq!(recv_json(&mut a).await, json!({"type": "ICE", "candidate": "c"}));
}

#[tokio::test]
async fn resume_after_disconnect() {
    let relay = spawn_relay(SwitchboardConfig::default(), true, &[]).await;

    // A fills B's mailbox while B is offline.
    let mut a = connect(&relay, "A").await;
    for p in ["p", "q", "r"] {
        send_json(&mut a, json!({"type": "send", "to": "B", "payload": p})).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = connect(&relay, "B").await;
    send_json(&mut b, json!({"type": "hello", "deliveredUpTo": 0})).await;

    // room_full and the three deliveries arrive; delivery is at-least-once,
    // so duplicates across the register/hello pushes are legitimate. The
    // first occurrence of each seq must be in order.
    let mut seen = Vec::new();
    while seen.len() < 3 {
        let frame = recv_json(&mut b).await;
        if frame["type"] == "deliver" {
            let seq = frame["seq"].as_u64().unwrap();
            if !seen.contains(&seq) {
                seen.push(seq);
                assert_eq!(frame["from"], "A");
            }
        }
    }
    assert_eq!(seen, vec![1, 2, 3]);

    send_json(&mut b, json!({"type": "delivered", "upTo": 2})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(b);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // On resume from watermark 2, only seq 3 comes back.
    let mut b = connect(&relay, "B").await;
    send_json(&mut b, json!({"type": "hello", "deliveredUpTo": 2})).await;
    let frame = recv_json(&mut b).await;
    assert_eq!(frame["type"], "deliver");
    assert_eq!(frame["seq"], 3);
}

#[tokio::test]
async fn replacement_closes_the_displaced_connection() {
    let relay = spawn_relay(SwitchboardConfig::default(), true, &[]).await;

    let mut first = connect(&relay, "A").await;
    let mut second = connect(&relay, "A").await;

    let close = recv_close(&mut first).await.expect("close frame");
    assert_eq!(close.0, CloseCode::Normal);
    assert_eq!(close.1, "replaced");

    // The replacement serves side A from here on.
    let mut b = connect(&relay, "B").await;
    send_json(&mut b, json!({"type": "hello", "deliveredUpTo": 0})).await;
    assert_eq!(recv_json(&mut second).await, json!({"type": "room_full"}));
    send_json(&mut b, json!({"type": "send", "to": "A", "payload": 1})).await;
    loop {
        let frame = recv_json(&mut second).await;
        if frame["type"] == "deliver" {
            assert_eq!(frame["seq"], 1);
            assert_eq!(frame["from"], "B");
            break;
        }
    }
}

#[tokio::test]
async fn backlog_cap_drops_the_overflow_only() {
    let relay = spawn_relay(
        SwitchboardConfig {
            max_backlog: 3,
            ..SwitchboardConfig::default()
        },
        true,
        &[],
    )
    .await;

    let mut a = connect(&relay, "A").await;
    for i in 0..4 {
        send_json(&mut a, json!({"type": "send", "to": "B", "payload": i})).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = connect(&relay, "B").await;
    send_json(&mut b, json!({"type": "hello", "deliveredUpTo": 0})).await;

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let frame = recv_json(&mut b).await;
        if frame["type"] == "deliver" && !seen.contains(&frame["seq"]) {
            seen.push(frame["seq"].clone());
        }
    }
    assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);

    // Nothing beyond the cap ever shows up.
    let extra = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let frame = recv_json(&mut b).await;
            if frame["type"] == "deliver" && frame["seq"].as_u64() > Some(3) {
                return frame;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "overflow frame was delivered: {extra:?}");
}

#[tokio::test]
async fn bad_upgrade_parameters_are_rejected() {
    let relay = spawn_relay(SwitchboardConfig::default(), true, &[]).await;

    for url in [
        format!("ws://{}/ws?appID=not-a-uuid&side=A", relay.addr),
        format!("ws://{}/ws?appID={APP}&side=C", relay.addr),
        format!("ws://{}/ws?side=A", relay.addr),
    ] {
        let err = connect_async(url).await.err().expect("upgrade must fail");
        match err {
            tokio_tungstenite::tungstenite::Error::Http(res) => {
                assert_eq!(res.status(), 400, "want 400 for bad params");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

#[tokio::test]
async fn origin_allow_list_is_enforced_outside_dev() {
    let relay = spawn_relay(
        SwitchboardConfig::default(),
        false,
        &["http://ok.example"],
    )
    .await;
    let url = format!("ws://{}/ws?appID={APP}&side=A", relay.addr);

    // Allowed origin upgrades fine.
    let mut req = url.clone().into_client_request().unwrap();
    req.headers_mut()
        .insert("Origin", "http://ok.example".parse().unwrap());
    connect_async(req).await.unwrap();

    // Anything else is turned away before registration.
    let mut req = url.into_client_request().unwrap();
    req.headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());
    let err = connect_async(req).await.err().expect("upgrade must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(res) => assert_eq!(res.status(), 403),
        other => panic!("unexpected error: {other:?}"),
    }
}
