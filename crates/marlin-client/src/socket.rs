// WebSocket client channel.
//
// Connects with the session cookie attached, then a dedicated task owns
// the socket: outgoing pushes arrive over an mpsc sender, incoming frames
// are registered with the driver core.  Terminal failure flips the health
// flag and surfaces exactly one `Close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use marlin_protocol::ws::CloseInfo;
use marlin_protocol::Event;

use crate::driver::ClientCore;
use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Data handed to the socket task for transmission.
#[derive(Debug)]
pub(crate) enum SocketSend {
    Text(String),
    Binary(Vec<u8>),
    Close(CloseInfo),
}

pub(crate) struct SocketChannel {
    tx: mpsc::UnboundedSender<SocketSend>,
    healthy: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SocketChannel {
    pub async fn connect(
        core: Arc<ClientCore>,
        url: &str,
        cookie: &str,
        fragment: usize,
    ) -> Result<Self, TransportError> {
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Cookie",
            cookie
                .parse()
                .map_err(|_| TransportError::Connect("cookie is not a valid header".to_owned()))?,
        );
        let config = WebSocketConfig::default()
            .max_message_size(Some(fragment))
            .max_frame_size(Some(fragment));
        let (ws, _response) = connect_async_with_config(request, Some(config), false).await?;
        info!(%url, "socket channel connected");

        let healthy = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(core, ws, rx, Arc::clone(&healthy)));
        Ok(SocketChannel { tx, healthy, task })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Hand a push to the socket task; `false` when the task is gone.
    pub fn send(&self, push: SocketSend) -> bool {
        self.tx.send(push).is_ok()
    }

    /// Close handshake, then release the task.
    pub async fn shutdown(self) {
        let _ = self.tx.send(SocketSend::Close(CloseInfo::normal(
            "client event driver closes socket",
        )));
        if tokio::time::timeout(Duration::from_millis(200), self.task)
            .await
            .is_err()
        {
            debug!("socket task did not finish the close handshake in time");
        }
    }
}

async fn run_socket(
    core: Arc<ClientCore>,
    mut ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<SocketSend>,
    healthy: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(SocketSend::Text(text)) => {
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(SocketSend::Binary(bytes)) => {
                    if ws.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(SocketSend::Close(info)) => {
                    let frame = CloseFrame {
                        code: info.code.into(),
                        reason: info.reason.into(),
                    };
                    let _ = ws.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    core.register_incoming(Event::message(text.as_str())).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    core.register_incoming(Event::binary(bytes.to_vec())).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "socket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    warn!(%error, "socket channel error");
                    core.register_incoming(Event::error(error.to_string())).await;
                    break;
                }
                None => break,
            },
        }
    }
    healthy.store(false, Ordering::SeqCst);
    core.register_incoming(Event::close("")).await;
}
