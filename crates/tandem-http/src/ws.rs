//! WebSocket connection supervisor.
//!
//! `GET /ws?appID=<uuid>&side=A|B&sid=<opaque>` upgrades into a persistent
//! text channel bound to one side of a room. The supervisor owns the read
//! half and a heartbeat task; the write half lives inside a [`WsLink`] the
//! switchboard writes through. Each connection costs two tasks: the read
//! loop below and the ping ticker it spawns.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_core::frame::{classify, ClientFrameKind, Delivered, Hello, SendFrame};
use tandem_core::{Link, ServerFrame, Side, Switchboard};

/// How long a connection may go without answering a heartbeat before the
/// read loop gives up. Only a pong re-arms the deadline.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Heartbeat interval; must fire comfortably inside `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Per-frame write deadline.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read/write buffer sizing for upgraded sockets.
const WS_BUFFER: usize = 64 << 10;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state for the `/ws` route.
#[derive(Clone)]
pub struct WsState {
    pub switchboard: Arc<Switchboard<WsLink>>,
    /// Exact-match `Origin` allow-list; ignored when `dev` is set.
    pub allowed_origins: Arc<HashSet<String>>,
    pub dev: bool,
}

/// Write half of an upgraded socket, as the switchboard sees it.
///
/// All writes go through the sink mutex, so pushes, pings, broadcasts and
/// close frames from different tasks serialize per connection.
pub struct WsLink {
    id: u64,
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
}

impl WsLink {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sink: AsyncMutex::new(sink),
        }
    }
}

impl Link for WsLink {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send_text(&self, text: String, deadline: Duration) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(deadline, sink.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
        }
    }

    async fn send_ping(&self, deadline: Duration) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(deadline, sink.send(Message::Ping(Vec::new()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(io::Error::other(e)),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(Some(frame)))).await;
        let _ = sink.close().await;
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "appID")]
    app_id: String,
    side: String,
    #[serde(default)]
    sid: Option<String>,
}

/// The `/ws` upgrade handler. Validation happens before the upgrade, so a
/// bad request never touches engine state.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<WsState>,
) -> Response {
    if Uuid::parse_str(&query.app_id).is_err() {
        return (StatusCode::BAD_REQUEST, "invalid appID").into_response();
    }
    let Ok(side) = query.side.parse::<Side>() else {
        return (StatusCode::BAD_REQUEST, "invalid side (want A or B)").into_response();
    };
    if !state.dev {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !state.allowed_origins.contains(origin) {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    ws.write_buffer_size(WS_BUFFER)
        .on_upgrade(move |socket| supervise(socket, state, query.app_id, side, query.sid))
}

/// Drive one upgraded connection to completion.
async fn supervise(
    socket: WebSocket,
    state: WsState,
    app_id: String,
    side: Side,
    sid: Option<String>,
) {
    let (sink, stream) = socket.split();
    let link = Arc::new(WsLink::new(sink));
    let switchboard = Arc::clone(&state.switchboard);

    switchboard
        .register(&app_id, side, sid.as_deref(), Arc::clone(&link))
        .await;

    if switchboard.room_size(&app_id) == 2 {
        info!(app = %app_id, "room full, notifying both sides");
        switchboard
            .broadcast_event(&app_id, &ServerFrame::RoomFull)
            .await;
    }

    let heartbeat = tokio::spawn(heartbeat(
        Arc::clone(&switchboard),
        app_id.clone(),
        Arc::clone(&link),
    ));

    read_loop(&switchboard, &app_id, side, sid.as_deref(), &link, stream).await;

    heartbeat.abort();
    switchboard.unregister(&app_id, link.id());
    link.close(tandem_core::switchboard::CLOSE_NORMAL, "").await;
}

/// Ping exactly this connection every `PING_PERIOD`. A failed write, which
/// includes having been replaced, closes the socket and ends the task.
async fn heartbeat(switchboard: Arc<Switchboard<WsLink>>, app_id: String, link: Arc<WsLink>) {
    loop {
        tokio::time::sleep(PING_PERIOD).await;
        if let Err(e) = switchboard
            .write_ping_conn(&app_id, link.id(), WRITE_WAIT)
            .await
        {
            debug!(app = %app_id, conn = link.id(), error = %e, "heartbeat stopped");
            link.close(tandem_core::switchboard::CLOSE_NORMAL, "").await;
            return;
        }
    }
}

async fn read_loop(
    switchboard: &Switchboard<WsLink>,
    app_id: &str,
    side: Side,
    sid: Option<&str>,
    link: &Arc<WsLink>,
    mut stream: SplitStream<WebSocket>,
) {
    // The deadline is re-armed only when the peer answers a ping. Steady
    // data traffic does not count: a side whose control-frame handling is
    // broken must still be dropped after `PONG_WAIT`.
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                warn!(app = %app_id, %side, "read deadline expired, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                warn!(app = %app_id, %side, error = %e, "read error, closing");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        // Binary frames carry the same JSON.
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(app = %app_id, %side, "non-UTF-8 binary frame ignored");
                    continue;
                }
            },
            Message::Close(_) => return,
            Message::Pong(_) => {
                deadline = Instant::now() + PONG_WAIT;
                continue;
            }
            Message::Ping(_) => continue,
        };

        dispatch(switchboard, app_id, side, sid, link, &text).await;
    }
}

async fn dispatch(
    switchboard: &Switchboard<WsLink>,
    app_id: &str,
    side: Side,
    sid: Option<&str>,
    link: &Arc<WsLink>,
    text: &str,
) {
    let kind = match classify(text) {
        Ok(kind) => kind,
        Err(e) => {
            warn!(app = %app_id, %side, error = %e, "bad json frame");
            return;
        }
    };

    match kind {
        ClientFrameKind::Signal => {
            switchboard.broadcast(app_id, link.id(), text).await;
        }
        ClientFrameKind::Hello => {
            let frame: Hello = match serde_json::from_str(text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(app = %app_id, %side, error = %e, "hello parse failed");
                    return;
                }
            };
            switchboard
                .hello(app_id, side, sid, frame.delivered_up_to)
                .await;
        }
        ClientFrameKind::Send => {
            let frame: SendFrame = match serde_json::from_str(text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(app = %app_id, %side, error = %e, "send parse failed");
                    return;
                }
            };
            if let Err(e) = switchboard
                .enqueue(app_id, side, frame.to, frame.payload)
                .await
            {
                warn!(app = %app_id, %side, to = %frame.to, error = %e, "enqueue failed");
            }
        }
        ClientFrameKind::Delivered => {
            let frame: Delivered = match serde_json::from_str(text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(app = %app_id, %side, error = %e, "delivered parse failed");
                    return;
                }
            };
            switchboard.ack_up_to(app_id, side, frame.up_to);
        }
        ClientFrameKind::Unknown(kind) => {
            debug!(app = %app_id, %side, frame = %kind, "ignoring unknown frame");
        }
    }
}
