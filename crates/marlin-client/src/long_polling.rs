// Long-polling client channel.
//
// A task posts `GetMessage` envelopes on an adaptive cadence: 100 ms at
// first, doubling on every empty reply up to 60 s, reset by any received
// event.  Client-to-server events piggyback on the next request.  The
// `Acknowledged` parameter carries the highest event number already
// processed, which the server uses to drain its retention queue.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, COOKIE};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use marlin_protocol::polling::{self, PollReply, PollRequest};
use marlin_protocol::tuning::{POLL_INTERVAL_MAX, POLL_INTERVAL_START};
use marlin_protocol::{Event, EventType};

use crate::driver::ClientCore;

pub(crate) const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

struct PollShared {
    last_number: AtomicU32,
    open_seen: AtomicBool,
}

pub(crate) struct PollingChannel {
    http: reqwest::Client,
    url: String,
    cookie: String,
    receiving: Arc<AtomicBool>,
    wake: Arc<Notify>,
    out_tx: mpsc::UnboundedSender<Event>,
    shared: Arc<PollShared>,
    task: JoinHandle<()>,
}

impl PollingChannel {
    pub fn start(core: Arc<ClientCore>, url: String, cookie: String) -> Self {
        let receiving = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());
        let shared = Arc::new(PollShared {
            last_number: AtomicU32::new(0),
            open_seen: AtomicBool::new(false),
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let http = core.http().clone();
        let task = tokio::spawn(run_polling(
            core,
            http.clone(),
            url.clone(),
            cookie.clone(),
            Arc::clone(&receiving),
            Arc::clone(&wake),
            Arc::clone(&shared),
            out_rx,
        ));
        info!(%url, "long-polling started");
        PollingChannel {
            http,
            url,
            cookie,
            receiving,
            wake,
            out_tx,
            shared,
            task,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Queue one client-to-server event for the next request.
    pub fn post(&self, event: Event) -> bool {
        if self.out_tx.send(event).is_ok() {
            self.wake.notify_one();
            true
        } else {
            false
        }
    }

    /// Send the final `CloseChannel` envelope and stop the task.
    pub async fn stop(&self) {
        if !self.receiving.swap(false, Ordering::SeqCst) {
            return;
        }
        let request = PollRequest {
            acknowledged: self.shared.last_number.load(Ordering::SeqCst),
            close_channel: true,
            ..PollRequest::default()
        };
        let sent = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .header(COOKIE, &self.cookie)
            .body(polling::encode_request(&request))
            .send()
            .await;
        match sent {
            Ok(response) => debug!(status = %response.status(), "close envelope sent"),
            // No answer means the channel is gone, which was the intention.
            Err(error) => debug!(%error, "close envelope not delivered"),
        }
        self.wake.notify_one();
        info!("long-polling stopped");
    }

    pub async fn shutdown(self) {
        self.stop().await;
        self.task.abort();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollStatus {
    Received,
    Empty,
    Closing,
    Error,
}

#[allow(clippy::too_many_arguments)]
async fn run_polling(
    core: Arc<ClientCore>,
    http: reqwest::Client,
    url: String,
    cookie: String,
    receiving: Arc<AtomicBool>,
    wake: Arc<Notify>,
    shared: Arc<PollShared>,
    mut out_rx: mpsc::UnboundedReceiver<Event>,
) {
    let mut interval = POLL_INTERVAL_START;
    while receiving.load(Ordering::SeqCst) {
        let outgoing = out_rx.try_recv().ok();
        let mut status = ask(&core, &http, &url, &cookie, &shared, outgoing.as_ref()).await;
        while status == PollStatus::Received && receiving.load(Ordering::SeqCst) {
            // More events may be waiting; ask again right away.
            interval = POLL_INTERVAL_START;
            status = ask(&core, &http, &url, &cookie, &shared, None).await;
        }
        match status {
            PollStatus::Received => {}
            PollStatus::Empty => {
                interval = (interval * 2).min(POLL_INTERVAL_MAX);
                debug!(interval_ms = interval.as_millis() as u64, "queue empty; backing off");
            }
            PollStatus::Closing | PollStatus::Error => {
                receiving.store(false, Ordering::SeqCst);
                break;
            }
        }
        let _ = tokio::time::timeout(interval, wake.notified()).await;
    }
}

async fn ask(
    core: &Arc<ClientCore>,
    http: &reqwest::Client,
    url: &str,
    cookie: &str,
    shared: &PollShared,
    outgoing: Option<&Event>,
) -> PollStatus {
    let mut request = PollRequest {
        acknowledged: shared.last_number.load(Ordering::SeqCst),
        ..PollRequest::default()
    };
    if let Some(event) = outgoing {
        if event.event_type == EventType::Binary {
            // Binary events only travel over WebSockets.
            warn!("binary event cannot be posted over long-polling; dropped");
        } else {
            request.event_type = Some(event.event_type);
            request.message = Some(polling::payload_to_wire(&event.payload));
        }
    }

    let response = http
        .post(url)
        .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
        .header(COOKIE, cookie)
        .body(polling::encode_request(&request))
        .send()
        .await;
    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            core.register_incoming(Event::error(format!(
                "polling request failed with HTTP status {}",
                response.status()
            )))
            .await;
            return PollStatus::Error;
        }
        Err(error) => {
            core.register_incoming(Event::error(format!(
                "error while asking for a message: {error}"
            )))
            .await;
            return PollStatus::Error;
        }
    };
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(error) => {
            core.register_incoming(Event::error(error.to_string())).await;
            return PollStatus::Error;
        }
    };

    match polling::decode_reply(&body) {
        Ok(PollReply::Empty) => PollStatus::Empty,
        Ok(PollReply::Closed) => {
            core.register_incoming(Event::close("")).await;
            PollStatus::Closing
        }
        Ok(PollReply::Delivered {
            number,
            event_type,
            message,
        }) => {
            if !shared.open_seen.swap(true, Ordering::SeqCst) && event_type != EventType::Open {
                core.register_incoming(Event::open("")).await;
            }
            let payload = match polling::payload_from_wire(event_type, &message) {
                Ok(payload) => payload,
                Err(error) => {
                    // Contained to this record; keep polling.
                    warn!(number, %error, "dropping malformed polling payload");
                    return PollStatus::Received;
                }
            };
            shared.last_number.fetch_max(number, Ordering::SeqCst);
            let mut event = Event::new(event_type, payload);
            event.number = number;
            let closing = event_type == EventType::Close;
            core.register_incoming(event).await;
            if closing {
                PollStatus::Closing
            } else {
                PollStatus::Received
            }
        }
        Err(error) => {
            core.register_incoming(Event::error(error.to_string())).await;
            PollStatus::Error
        }
    }
}
