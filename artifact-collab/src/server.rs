//! WebSocket gateway.
//!
//! ```text
//!  TCP accept ─► accept_hdr_async ─► /rooms/{artifact_id} + token
//!                    │                    │
//!                    │ 400/401            ▼
//!                    ◄──────────── CollabEngine::authenticate
//!                                         │ ok
//!                                         ▼
//!                                   101 Switching ─► CollabEngine::join
//!                                         │
//!                 ┌───────────────────────┴────────────────────┐
//!                 ▼                                            ▼
//!           reader task                                  writer task
//!   heartbeat timeout, handle_text              Outbox::next ─► socket
//!   in arrival order                            protocol Ping every interval
//!                 │                             close frame with reason code
//!                 ▼
//!        CollabEngine::disconnect (user_leave / typing_stop)
//! ```
//!
//! Reads and writes run in separate tasks so a slow writer never delays
//! an inbound `typing_stop`.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;

use crate::collaborators::UserIdentity;
use crate::connection::{ConnectionHandle, Outgoing};
use crate::engine::CollabEngine;
use crate::error::CollabError;
use crate::protocol::CloseReason;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time the writer gets to send a close frame after the reader stops.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    total_messages: AtomicU64,
}

/// What the upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UpgradeRequest {
    artifact_id: String,
    token: Option<String>,
}

#[derive(Debug)]
enum Refusal {
    BadRequest(String),
    Unauthorized(CollabError),
}

impl Refusal {
    fn status(&self) -> StatusCode {
        match self {
            Refusal::BadRequest(_) => StatusCode::BAD_REQUEST,
            Refusal::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    fn body(&self) -> String {
        match self {
            Refusal::BadRequest(reason) => {
                json!({ "code": "bad_request", "message": reason }).to_string()
            }
            Refusal::Unauthorized(err) => {
                json!({ "code": err.code(), "message": err.to_string() }).to_string()
            }
        }
    }

    /// The HTTP response written instead of `101 Switching Protocols`.
    fn into_response(self) -> ErrorResponse {
        let body = self.body();
        let mut response = ErrorResponse::new(None);
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        *response.body_mut() = Some(body);
        response
    }
}

/// The gateway.
pub struct CollabServer {
    engine: Arc<CollabEngine>,
    shutdown: watch::Sender<bool>,
    counters: Arc<Counters>,
}

impl CollabServer {
    pub fn new(engine: Arc<CollabEngine>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            shutdown,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }

    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: c.rejected_handshakes.load(Ordering::Relaxed),
            total_messages: c.total_messages.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting and close every connection with 1001.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.engine.shutdown();
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.engine.config().bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let background = self.engine.spawn_background(self.shutdown.subscribe());
        let relay = self.engine.spawn_relay();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let engine = self.engine.clone();
                    let counters = self.counters.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, engine, counters, shutdown).await {
                            log::debug!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Collaboration server shutting down");
        self.engine.shutdown();
        if let Some(relay) = relay {
            relay.abort();
        }
        let _ = background.await;
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<CollabEngine>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut admitted = None;
    let check = |request: &Request, response: Response| match admit(&engine, request) {
        Ok(pair) => {
            admitted = Some(pair);
            Ok(response)
        }
        Err(refusal) => {
            log::info!("Refused upgrade from {addr}: {}", refusal.status());
            Err(refusal.into_response())
        }
    };

    let handshake = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_hdr_async(stream, check)).await;
    let ws_stream = match handshake {
        Ok(Ok(ws_stream)) => ws_stream,
        Ok(Err(WsError::Http(_))) => {
            // The refusal response has already been written.
            counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Ok(Err(e)) => {
            counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        Err(_) => {
            counters.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            log::debug!("Handshake from {addr} timed out");
            return Ok(());
        }
    };
    let Some((artifact_id, identity)) = admitted else {
        return Err("upgrade accepted without an identity".into());
    };
    let (sink, source) = ws_stream.split();

    let handle = engine.join(&artifact_id, identity).await;
    counters.total_connections.fetch_add(1, Ordering::Relaxed);
    counters.active_connections.fetch_add(1, Ordering::Relaxed);
    log::info!(
        "Connection {} from {addr}: {} on {artifact_id}",
        handle.id,
        handle.user_id()
    );

    let writer = tokio::spawn(write_loop(sink, handle.clone(), engine.config().ping_interval));
    read_loop(source, &handle, &engine, &counters, &mut shutdown).await;

    engine.disconnect(&handle);
    counters.active_connections.fetch_sub(1, Ordering::Relaxed);

    if handle.outbox.close_reason().is_some() {
        // Server-initiated: let the writer deliver the close frame.
        if timeout(CLOSE_GRACE, writer).await.is_err() {
            log::debug!("Writer for {} did not finish in time", handle.id);
        }
    } else {
        writer.abort();
    }
    log::info!("Connection {} closed", handle.id);
    Ok(())
}

async fn read_loop(
    mut source: WsSource,
    handle: &Arc<ConnectionHandle>,
    engine: &CollabEngine,
    counters: &Counters,
    shutdown: &mut watch::Receiver<bool>,
) {
    let heartbeat = engine.config().heartbeat_timeout;
    let mut closed = handle.outbox.subscribe_close();
    let mut deadline = Instant::now() + heartbeat;

    loop {
        if closed.borrow().is_some() {
            return;
        }
        tokio::select! {
            msg = tokio::time::timeout_at(deadline, source.next()) => {
                let msg = match msg {
                    Err(_) => {
                        log::info!("Heartbeat timeout for {} ({})", handle.id, handle.user_id());
                        handle.close(CloseReason::HeartbeatTimeout);
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        log::debug!("Read error on {}: {e}", handle.id);
                        return;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };
                deadline = Instant::now() + heartbeat;
                counters.total_messages.fetch_add(1, Ordering::Relaxed);
                match msg {
                    Message::Text(text) => engine.handle_text(handle, text.as_str()).await,
                    Message::Binary(_) => engine.handle_binary(handle),
                    // Control frames only keep the heartbeat alive.
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => return,
                    Message::Frame(_) => {}
                }
            }
            _ = closed.changed() => return,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    handle.close(CloseReason::ServerShutdown);
                    return;
                }
            }
        }
    }
}

async fn write_loop(mut sink: WsSink, handle: Arc<ConnectionHandle>, ping_interval: Duration) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            outgoing = handle.outbox.next() => match outgoing {
                Outgoing::Frame(frame) => {
                    if let Err(e) = sink.send(Message::Text(frame.text.to_string().into())).await {
                        log::debug!("Write error on {}: {e}", handle.id);
                        return;
                    }
                }
                Outgoing::Close(reason) => {
                    let close = CloseFrame {
                        code: CloseCode::from(reason.code()),
                        reason: Utf8Bytes::from_static(reason.reason()),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(close))).await {
                        log::debug!("Close frame to {} failed: {e}", handle.id);
                    }
                    return;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    log::debug!("Ping to {} failed: {e}", handle.id);
                    return;
                }
            }
        }
    }
}

/// Authenticate an upgrade request before the `101` is written.
fn admit(engine: &CollabEngine, request: &Request) -> Result<(String, UserIdentity), Refusal> {
    let target = upgrade_target(request)?;
    let token = target
        .token
        .ok_or_else(|| Refusal::Unauthorized(CollabError::Auth("missing token".into())))?;
    let identity = engine.authenticate(&token).map_err(Refusal::Unauthorized)?;
    Ok((target.artifact_id, identity))
}

/// Extract `/rooms/{artifact_id}` and the token.
///
/// The `?token=` query parameter wins over an `Authorization: Bearer` header.
fn upgrade_target(request: &Request) -> Result<UpgradeRequest, Refusal> {
    let uri = request.uri();
    let path = uri.path();
    let artifact_id = match path.strip_prefix("/rooms/") {
        Some(id) if !id.is_empty() && !id.contains('/') => urlencoding::decode(id)
            .map_err(|_| Refusal::BadRequest("artifact id is not valid UTF-8".into()))?
            .into_owned(),
        _ => return Err(Refusal::BadRequest(format!("unknown path {path}"))),
    };

    let query_token = uri
        .query()
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|token| !token.is_empty());

    let header_token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| {
            value
                .get(..7)
                .filter(|scheme| scheme.eq_ignore_ascii_case("bearer "))
                .map(|_| value[7..].trim().to_string())
        })
        .filter(|token| !token.is_empty());

    Ok(UpgradeRequest {
        artifact_id,
        token: query_token.or(header_token),
    })
}
