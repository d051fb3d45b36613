// HTTP surface: the three transport endpoints, to be nested under the
// host's base path.
//
//   GET  /Sockets/<session>   WebSocket upgrade
//   GET  /Events/<session>    text/event-stream
//   POST /Polling/<session>   SOAP GetMessage
//
// A `Cookie: name=value` header matching a registered pair overrides
// path-based routing on all three.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{CONTENT_TYPE, COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as WireEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use marlin_protocol::sse::SseRecord;
use marlin_protocol::tuning::{SSE_RETRY_MAX, SSE_RETRY_MIN};
use marlin_protocol::{client_identity, polling, sender_fingerprint, TransportKind};

use crate::channel::SocketPush;
use crate::driver::ServerEventDriver;
use crate::error::AttachError;

pub(crate) fn router(driver: ServerEventDriver) -> Router {
    Router::new()
        .route("/Sockets", get(socket_bare))
        .route("/Sockets/{*session}", get(socket_with_session))
        .route("/Events", get(stream_bare))
        .route("/Events/{*session}", get(stream_with_session))
        .route("/Polling", post(poll_bare))
        .route("/Polling/{*session}", post(poll_with_session))
        .with_state(driver)
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for header in headers.get_all(COOKIE) {
        let Ok(text) = header.to_str() else { continue };
        for pair in text.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.push((name.trim().to_owned(), value.trim().to_owned()));
            }
        }
    }
    cookies
}

fn remote_desktop(headers: &HeaderMap) -> u32 {
    headers
        .get("x-remote-desktop")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}


fn refuse(error: &AttachError) -> Response {
    (error.status(), error.to_string()).into_response()
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn socket_with_session(
    State(driver): State<ServerEventDriver>,
    Path(session): Path<String>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    socket_common(driver, Some(session), headers, peer, ws).await
}

async fn socket_bare(
    State(driver): State<ServerEventDriver>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    socket_common(driver, None, headers, peer, ws).await
}

async fn socket_common(
    driver: ServerEventDriver,
    session: Option<String>,
    headers: HeaderMap,
    peer: SocketAddr,
    ws: WebSocketUpgrade,
) -> Response {
    let cookies = parse_cookies(&headers);
    let channel = match driver.route_request(&cookies, session.as_deref()).await {
        Ok(channel) => channel,
        Err(error) => return refuse(&error),
    };
    if !channel.policy().await.accepts(TransportKind::Socket) {
        return refuse(&AttachError::PolicyViolation);
    }
    let identity = client_identity(peer, remote_desktop(&headers));
    let sender_fp = sender_fingerprint(&identity);
    if driver.check_brute_force(sender_fp).await {
        return refuse(&AttachError::BruteForce);
    }
    let origin = format!("/Sockets/{}", session.as_deref().unwrap_or(channel.name()));
    let channel_id = channel.id();
    let fragment = driver.ws_fragment_size();
    ws.max_frame_size(fragment)
        .max_message_size(fragment)
        .on_upgrade(move |socket| serve_socket(driver, channel_id, socket, sender_fp, origin))
}

async fn serve_socket(
    driver: ServerEventDriver,
    channel_id: u32,
    mut socket: WebSocket,
    sender_fp: u32,
    origin: String,
) {
    // Re-resolve through the driver map; an unregistered channel makes
    // every callback from this task a no-op.
    let Some(channel) = driver.channel_by_id(channel_id).await else {
        return;
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketPush>();
    if let Err(error) = channel.attach_socket(tx.clone(), sender_fp, &origin).await {
        warn!(channel = channel_id, %error, "socket attach refused after upgrade");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(channel = channel_id, "socket attached");
    driver.signal_ingress(&channel).await;
    drop(channel);

    loop {
        tokio::select! {
            push = rx.recv() => match push {
                Some(SocketPush::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(SocketPush::Binary(bytes)) => {
                    if socket.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(SocketPush::Close(info)) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: info.code,
                            reason: info.reason.into(),
                        })))
                        .await;
                    break;
                }
                // The channel dropped this attachment.
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(channel) = driver.channel_by_id(channel_id).await {
                        channel.on_message(text.as_str().to_owned()).await;
                        driver.signal_ingress(&channel).await;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Some(channel) = driver.channel_by_id(channel_id).await {
                        channel.on_binary(bytes.to_vec()).await;
                        driver.signal_ingress(&channel).await;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!(channel = channel_id, "socket closed by peer");
                    break;
                }
                Some(Err(error)) => {
                    warn!(channel = channel_id, %error, "socket error");
                    if let Some(channel) = driver.channel_by_id(channel_id).await {
                        channel.on_error(error.to_string()).await;
                        driver.signal_ingress(&channel).await;
                    }
                    break;
                }
            },
        }
    }

    if let Some(channel) = driver.channel_by_id(channel_id).await {
        channel.detach_socket(&tx).await;
        driver.signal_ingress(&channel).await;
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamQuery {
    /// Reconnection delay to advertise, in seconds.
    retry: Option<u64>,
}

async fn stream_with_session(
    State(driver): State<ServerEventDriver>,
    Path(session): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    stream_common(driver, Some(session), query, headers, peer).await
}

async fn stream_bare(
    State(driver): State<ServerEventDriver>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    stream_common(driver, None, query, headers, peer).await
}

async fn stream_common(
    driver: ServerEventDriver,
    session: Option<String>,
    query: StreamQuery,
    headers: HeaderMap,
    peer: SocketAddr,
) -> Response {
    let cookies = parse_cookies(&headers);
    let channel = match driver.route_request(&cookies, session.as_deref()).await {
        Ok(channel) => channel,
        Err(error) => return refuse(&error),
    };
    if !channel.policy().await.accepts(TransportKind::Sse) {
        return refuse(&AttachError::PolicyViolation);
    }
    let identity = client_identity(peer, remote_desktop(&headers));
    let sender_fp = sender_fingerprint(&identity);
    if driver.check_brute_force(sender_fp).await {
        return refuse(&AttachError::BruteForce);
    }

    let (tx, rx) = mpsc::unbounded_channel::<SseRecord>();
    let origin = format!("/Events/{}", session.as_deref().unwrap_or(channel.name()));
    if let Err(error) = channel.attach_stream(tx, sender_fp, &origin).await {
        return refuse(&error);
    }
    info!(channel = channel.id(), "event stream attached");
    driver.signal_ingress(&channel).await;

    let init = stream::once(async {
        Ok::<_, Infallible>(WireEvent::default().comment("init event-stream"))
    });
    let retry = query
        .retry
        .map(|seconds| Duration::from_secs(seconds).clamp(SSE_RETRY_MIN, SSE_RETRY_MAX))
        .map(|delay| Ok(WireEvent::default().retry(delay)));
    let records = UnboundedReceiverStream::new(rx).map(|record| Ok(record_to_wire(&record)));
    let body = init.chain(stream::iter(retry)).chain(records);

    Sse::new(body)
        .keep_alive(
            KeepAlive::new()
                .interval(driver.keepalive())
                .text("keepalive"),
        )
        .into_response()
}

fn record_to_wire(record: &SseRecord) -> WireEvent {
    // Carriage returns cannot travel over SSE; the receiving parser
    // normalizes every ending to \n anyway.
    let data = record.data.replace("\r\n", "\n").replace('\r', "\n");
    let mut event = WireEvent::default().event(&record.event).data(data);
    if record.id != 0 {
        event = event.id(record.id.to_string());
    }
    event
}

// ---------------------------------------------------------------------------
// Long-polling
// ---------------------------------------------------------------------------

async fn poll_with_session(
    State(driver): State<ServerEventDriver>,
    Path(session): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    poll_common(driver, Some(session), headers, body).await
}

async fn poll_bare(
    State(driver): State<ServerEventDriver>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    poll_common(driver, None, headers, body).await
}

async fn poll_common(
    driver: ServerEventDriver,
    session: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match polling::decode_request(&body) {
        Ok(request) => request,
        Err(error) => {
            debug!(%error, "rejecting malformed GetMessage envelope");
            return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
        }
    };
    let cookies = parse_cookies(&headers);
    let channel = match driver.route_request(&cookies, session.as_deref()).await {
        Ok(channel) => channel,
        Err(error) => return refuse(&error),
    };
    let origin = format!("/Polling/{}", session.as_deref().unwrap_or(channel.name()));
    match channel.handle_long_polling(request, &origin).await {
        Ok(reply) => {
            driver.signal_ingress(&channel).await;
            let xml = polling::encode_reply(&reply);
            (
                [(CONTENT_TYPE, "application/soap+xml; charset=utf-8")],
                xml,
            )
                .into_response()
        }
        Err(error) => refuse(&error),
    }
}
