// Server-sent-events client channel.
//
// Opens the stream with the session cookie, waits for the open state, then
// a task feeds the shared SSE parser with the response body and registers
// each record with the driver core.  SSE is server-to-client only; posting
// is refused at the driver level.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, COOKIE};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use marlin_protocol::sse::{self, SseParser, COMMENT_EVENT, RETRY_EVENT};
use marlin_protocol::{Event, EventType};

use crate::driver::ClientCore;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadyState {
    Connecting,
    Open,
    Closed,
    ClosedByServer,
}

pub(crate) struct SseChannel {
    ready: watch::Receiver<ReadyState>,
    task: JoinHandle<()>,
}

impl SseChannel {
    pub async fn connect(
        core: Arc<ClientCore>,
        url: &str,
        cookie: &str,
        open_wait: Duration,
    ) -> Result<Self, TransportError> {
        let (ready_tx, mut ready_rx) = watch::channel(ReadyState::Connecting);
        let task = tokio::spawn(run_stream(
            core,
            url.to_owned(),
            cookie.to_owned(),
            ready_tx,
        ));

        let opened = tokio::time::timeout(
            open_wait,
            async {
                ready_rx
                    .wait_for(|state| *state != ReadyState::Connecting)
                    .await
                    .map(|state| *state)
            },
        )
        .await;
        let state = match opened {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => ReadyState::Closed,
            Err(_) => {
                task.abort();
                return Err(TransportError::OpenTimeout);
            }
        };
        if state == ReadyState::Open {
            Ok(SseChannel {
                ready: ready_rx,
                task,
            })
        } else {
            task.abort();
            Err(TransportError::Connect("event stream refused".to_owned()))
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self.ready.borrow() == ReadyState::Open
    }

    pub fn shutdown(self) {
        // Dropping the response body closes the HTTP request on the next
        // round trip.
        self.task.abort();
    }
}

async fn run_stream(
    core: Arc<ClientCore>,
    url: String,
    cookie: String,
    ready: watch::Sender<ReadyState>,
) {
    let response = core
        .http()
        .get(&url)
        .header(ACCEPT, "text/event-stream")
        .header(COOKIE, &cookie)
        .send()
        .await;
    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(%url, status = %response.status(), "event stream refused");
            let _ = ready.send(ReadyState::Closed);
            return;
        }
        Err(error) => {
            warn!(%url, %error, "event stream connect failed");
            let _ = ready.send(ReadyState::Closed);
            return;
        }
    };
    info!(%url, "event stream open");
    let _ = ready.send(ReadyState::Open);
    core.note_attached();
    core.register_incoming(Event::open("")).await;

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();
    let mut closed_by_server = false;
    'read: while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "event stream broke");
                core.register_incoming(Event::error(error.to_string())).await;
                break;
            }
        };
        for record in parser.push(&bytes) {
            match record.event.as_str() {
                COMMENT_EVENT => debug!(data = %record.data, "stream comment"),
                RETRY_EVENT => core.set_reconnect_delay(parser.retry()).await,
                _ => match sse::event_from_record(&record) {
                    Ok(event) => {
                        let closing = event.event_type == EventType::Close;
                        core.register_incoming(event).await;
                        if closing {
                            closed_by_server = true;
                            break 'read;
                        }
                    }
                    Err(error) => warn!(%error, "dropping malformed record"),
                },
            }
        }
    }

    let _ = ready.send(if closed_by_server {
        ReadyState::ClosedByServer
    } else {
        ReadyState::Closed
    });
    core.register_incoming(Event::close("")).await;
}
