// Client-side event driver.
//
// One session at a time: the driver picks a transport per the policy's
// failover table, owns the in/out queues, and runs a monitor task that
// drains inbound events to the application callback in arrival order,
// pushes outbound events to the server, and re-checks the attachment's
// health on every tick.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use marlin_protocol::tuning::{
    CLIENT_MONITOR_INTERVAL_MIN, MONITOR_END_LOOPS, MONITOR_END_WAIT, MONITOR_INTERVAL_MAX,
    SSE_RETRY_DEFAULT,
};
use marlin_protocol::{ChannelPolicy, Event, EventType, Payload, TransportKind};

use crate::config::ClientConfig;
use crate::event_source::SseChannel;
use crate::long_polling::PollingChannel;
use crate::socket::{SocketChannel, SocketSend};
use crate::EventCallback;

#[derive(Debug, Clone, Default)]
struct SessionState {
    url: String,
    policy: Option<ChannelPolicy>,
    session: String,
    cookie: String,
    token: String,
}

impl SessionState {
    fn ready(&self) -> bool {
        self.policy.is_some()
            && !self.url.is_empty()
            && (!self.session.is_empty() || !self.cookie.is_empty())
    }

    fn cookie_header(&self) -> String {
        format!("{}={}", self.cookie, self.token)
    }
}

#[derive(Default)]
struct Queues {
    in_q: VecDeque<Event>,
    out_q: VecDeque<Event>,
    in_number: u32,
    out_number: u32,
}

enum ActiveTransport {
    Socket(SocketChannel),
    Sse(SseChannel),
    Polling(PollingChannel),
}

impl ActiveTransport {
    fn is_healthy(&self) -> bool {
        match self {
            ActiveTransport::Socket(channel) => channel.is_healthy(),
            ActiveTransport::Sse(channel) => channel.is_healthy(),
            ActiveTransport::Polling(channel) => channel.is_healthy(),
        }
    }

    async fn shutdown(self) {
        match self {
            ActiveTransport::Socket(channel) => channel.shutdown().await,
            ActiveTransport::Sse(channel) => channel.shutdown(),
            ActiveTransport::Polling(channel) => channel.shutdown().await,
        }
    }
}

pub(crate) struct ClientCore {
    http: reqwest::Client,
    config: ClientConfig,
    callback: Mutex<Option<(EventCallback, u64)>>,
    session: Mutex<SessionState>,
    queues: Mutex<Queues>,
    transport: Mutex<Option<ActiveTransport>>,
    running: watch::Sender<bool>,
    wake: Notify,
    close_seen: AtomicBool,
    reconnect_delay: Mutex<Duration>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ClientCore {
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// A transport attached: the next terminal failure surfaces a `Close`.
    pub(crate) fn note_attached(&self) {
        self.close_seen.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn set_reconnect_delay(&self, delay: Duration) {
        *self.reconnect_delay.lock().await = delay;
    }

    /// Register an event arriving from the active transport.  `Close`
    /// events are surfaced at most once per attachment attempt.  When the
    /// monitor is not running the event goes straight to the callback.
    pub(crate) async fn register_incoming(&self, mut event: Event) {
        if event.event_type == EventType::Close && self.close_seen.swap(true, Ordering::SeqCst) {
            debug!("duplicate close suppressed");
            return;
        }
        let direct = {
            let mut queues = self.queues.lock().await;
            if event.number == 0 {
                queues.in_number += 1;
                event.number = queues.in_number;
            } else if event.number > queues.in_number {
                queues.in_number = event.number;
            }
            if *self.running.borrow() {
                queues.in_q.push_back(event);
                None
            } else {
                Some(event)
            }
        };
        match direct {
            Some(event) => {
                debug!(number = event.number, "incoming event without a running monitor");
                self.deliver(event).await;
            }
            None => self.wake.notify_one(),
        }
    }

    async fn deliver(&self, event: Event) {
        let Some((callback, app_data)) = self.callback.lock().await.clone() else {
            debug!(number = event.number, "no application callback; event dropped");
            return;
        };
        let number = event.number;
        if catch_unwind(AssertUnwindSafe(|| callback(app_data, event))).is_err() {
            error!(number, "application callback panicked; event dropped");
        }
    }

    async fn send_to_application(&self) -> usize {
        let mut sent = 0;
        loop {
            let event = self.queues.lock().await.in_q.pop_front();
            let Some(event) = event else { break };
            self.deliver(event).await;
            sent += 1;
        }
        sent
    }

    async fn send_to_server(&self) -> usize {
        let mut sent = 0;
        loop {
            let event = self.queues.lock().await.out_q.pop_front();
            let Some(event) = event else { break };
            self.send_one_to_server(event).await;
            sent += 1;
        }
        sent
    }

    async fn send_one_to_server(&self, event: Event) {
        let guard = self.transport.lock().await;
        match guard.as_ref() {
            Some(ActiveTransport::Socket(socket)) => {
                let push = match event.event_type {
                    EventType::Message => match event.payload {
                        Payload::Text(text) => Some(SocketSend::Text(text)),
                        Payload::Binary(bytes) => Some(SocketSend::Binary(bytes)),
                    },
                    EventType::Binary => match event.payload {
                        Payload::Binary(bytes) => Some(SocketSend::Binary(bytes)),
                        Payload::Text(text) => Some(SocketSend::Binary(text.into_bytes())),
                    },
                    EventType::Close => Some(SocketSend::Close(
                        marlin_protocol::ws::CloseInfo::normal(&event.payload.as_text()),
                    )),
                    // Open and Error have no client-to-server form.
                    _ => None,
                };
                if let Some(push) = push {
                    if !socket.send(push) {
                        warn!("socket task gone; outbound event lost");
                    }
                }
            }
            Some(ActiveTransport::Polling(polling)) => {
                let _ = polling.post(event);
            }
            Some(ActiveTransport::Sse(_)) => {
                // SSE does not allow any postings.
                warn!("posting on an SSE-only channel; event dropped");
            }
            None => {
                warn!("no transport attached; outbound event dropped");
            }
        }
    }

    /// Re-check the current attachment's health; tear it down and attach
    /// the next candidate per the policy when it is gone.
    pub(crate) async fn test_dispatcher(core: &Arc<Self>) -> bool {
        let mut guard = core.transport.lock().await;
        if guard.as_ref().is_some_and(ActiveTransport::is_healthy) {
            return true;
        }
        if !core.session.lock().await.ready() {
            return false;
        }
        let previous = guard.take();
        let was_sse = matches!(previous, Some(ActiveTransport::Sse(_)));
        if let Some(transport) = previous {
            info!("attachment unhealthy; restarting the event dispatcher");
            transport.shutdown().await;
            if was_sse {
                // Honor the server-advertised reconnection delay.
                let delay = *core.reconnect_delay.lock().await;
                tokio::time::sleep(delay).await;
            }
        }
        Self::start_dispatcher(core, &mut guard).await
    }

    async fn start_dispatcher(core: &Arc<Self>, slot: &mut Option<ActiveTransport>) -> bool {
        let session = core.session.lock().await.clone();
        let Some(policy) = session.policy else {
            return false;
        };
        let cookie_header = session.cookie_header();
        info!(%policy, session = %session.session, "starting event dispatcher");
        for kind in policy.failover() {
            match kind {
                TransportKind::Socket => {
                    let url = socket_url(&session.url, &session.session);
                    let connected = SocketChannel::connect(
                        Arc::clone(core),
                        &url,
                        &cookie_header,
                        core.config.ws_fragment_size(),
                    )
                    .await;
                    match connected {
                        Ok(channel) => {
                            core.note_attached();
                            core.register_incoming(Event::open("")).await;
                            *slot = Some(ActiveTransport::Socket(channel));
                            return true;
                        }
                        Err(error) => {
                            info!(%error, "socket attach failed; trying the next transport");
                        }
                    }
                }
                TransportKind::Sse => {
                    let url = format!("{}Events/{}", session.url, session.session);
                    let connected = SseChannel::connect(
                        Arc::clone(core),
                        &url,
                        &cookie_header,
                        core.config.sse_open_wait(),
                    )
                    .await;
                    match connected {
                        // The stream task notes the attach and surfaces
                        // the Open itself.
                        Ok(channel) => {
                            *slot = Some(ActiveTransport::Sse(channel));
                            return true;
                        }
                        Err(error) => {
                            info!(%error, "event stream attach failed; trying the next transport");
                        }
                    }
                }
                TransportKind::Polling => {
                    let url = format!("{}Polling/{}", session.url, session.session);
                    let channel =
                        PollingChannel::start(Arc::clone(core), url, cookie_header.clone());
                    core.note_attached();
                    *slot = Some(ActiveTransport::Polling(channel));
                    return true;
                }
            }
        }
        warn!(%policy, "no transport could be attached");
        false
    }
}

async fn run_monitor(core: Arc<ClientCore>, mut running: watch::Receiver<bool>) {
    info!("client event monitor started");
    let mut interval = CLIENT_MONITOR_INTERVAL_MIN;
    loop {
        tokio::select! {
            biased;
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            () = core.wake.notified() => {}
            () = tokio::time::sleep(interval) => {}
        }
        if !*running.borrow() {
            break;
        }
        let mut sent = core.send_to_application().await;
        sent += core.send_to_server().await;
        interval = if sent > 0 {
            CLIENT_MONITOR_INTERVAL_MIN
        } else {
            (interval * 2).min(MONITOR_INTERVAL_MAX)
        };
        ClientCore::test_dispatcher(&core).await;
    }
    // Late arrivals still reach the application.
    core.send_to_application().await;
    info!("client event monitor stopped");
}

/// Mirror of the server driver for applications consuming events.
#[derive(Clone)]
pub struct ClientEventDriver {
    core: Arc<ClientCore>,
}

impl Default for ClientEventDriver {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ClientEventDriver {
    pub fn new(config: ClientConfig) -> Self {
        let (running, _) = watch::channel(false);
        ClientEventDriver {
            core: Arc::new(ClientCore {
                http: reqwest::Client::new(),
                config,
                callback: Mutex::new(None),
                session: Mutex::new(SessionState::default()),
                queues: Mutex::new(Queues::default()),
                transport: Mutex::new(None),
                running,
                wake: Notify::new(),
                close_seen: AtomicBool::new(false),
                reconnect_delay: Mutex::new(SSE_RETRY_DEFAULT),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Register the application callback all events are delivered to.
    pub async fn set_application_callback(&self, callback: EventCallback, app_data: u64) {
        *self.core.callback.lock().await = Some((callback, app_data));
        debug!("application callback is set");
    }

    /// Policy used on the next (re)connect.
    pub async fn set_channel_policy(&self, policy: ChannelPolicy) {
        self.core.session.lock().await.policy = Some(policy);
    }

    /// Server URL used on the next (re)connect.
    pub async fn set_server_url(&self, url: &str) {
        self.core.session.lock().await.url = normalize_base(url);
    }

    /// Start everything in one go for a session.
    pub async fn start_event_driver(
        &self,
        url: &str,
        policy: ChannelPolicy,
        session: &str,
        cookie: &str,
        token: &str,
    ) -> bool {
        if self.core.callback.lock().await.is_none() {
            warn!("no application callback; refusing to start");
            return false;
        }
        {
            let mut state = self.core.session.lock().await;
            state.url = normalize_base(url);
            state.policy = Some(policy);
            state.session = session.to_owned();
            state.cookie = cookie.to_owned();
            state.token = token.to_owned();
        }
        info!(%url, %policy, session, "event driver started");
        self.ensure_monitor().await;
        ClientCore::test_dispatcher(&self.core).await
    }

    /// Delayed start: `set_server_url` and `set_channel_policy` first.
    pub async fn start_events_for_session(
        &self,
        session: &str,
        cookie: &str,
        token: &str,
    ) -> bool {
        {
            let state = self.core.session.lock().await;
            if state.policy.is_none() || state.url.is_empty() {
                return false;
            }
        }
        if self.core.callback.lock().await.is_none() {
            return false;
        }
        if self.core.transport.lock().await.is_some() {
            self.stop_events_for_session().await;
        }
        {
            let mut state = self.core.session.lock().await;
            state.session = session.to_owned();
            state.cookie = cookie.to_owned();
            state.token = token.to_owned();
        }
        self.ensure_monitor().await;
        ClientCore::test_dispatcher(&self.core).await
    }

    /// Stop the session: final close envelope on the wire where the
    /// transport has one, a synthesized `Close` to the application if none
    /// was seen, and a cooperative monitor teardown.
    pub async fn stop_events_for_session(&self) -> bool {
        info!("stopping the event session");
        if !self.core.close_seen.swap(true, Ordering::SeqCst) {
            self.core.deliver(Event::close("")).await;
        }
        {
            let mut state = self.core.session.lock().await;
            state.session.clear();
            state.cookie.clear();
            state.token.clear();
        }
        self.close_down().await
    }

    async fn close_down(&self) -> bool {
        let transport = self.core.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        let _ = self.core.running.send(false);
        self.core.wake.notify_one();
        let handle = self.core.monitor.lock().await.take();
        let mut clean = true;
        if let Some(handle) = handle {
            for _ in 0..MONITOR_END_LOOPS {
                if handle.is_finished() {
                    break;
                }
                tokio::time::sleep(MONITOR_END_WAIT).await;
            }
            if !handle.is_finished() {
                warn!("monitor did not stop inside the grace window; aborting");
                handle.abort();
                clean = false;
            }
        }
        let mut queues = self.core.queues.lock().await;
        queues.in_q.clear();
        queues.out_q.clear();
        queues.in_number = 0;
        queues.out_number = 0;
        clean
    }

    async fn ensure_monitor(&self) {
        if *self.core.running.borrow() {
            return;
        }
        let _ = self.core.running.send(true);
        let handle = tokio::spawn(run_monitor(
            Arc::clone(&self.core),
            self.core.running.subscribe(),
        ));
        *self.core.monitor.lock().await = Some(handle);
    }

    /// Queue one event for the server.  Serviceable only over WebSocket or
    /// long-polling; an SSE-only attachment drops it with a log line.
    pub async fn post_event_to_server(&self, mut event: Event) -> u32 {
        let number = {
            let mut queues = self.core.queues.lock().await;
            queues.out_number += 1;
            event.number = queues.out_number;
            queues.out_q.push_back(event);
            queues.out_number
        };
        self.core.wake.notify_one();
        debug!(number, "event queued for the server");
        number
    }

    pub fn is_running(&self) -> bool {
        *self.core.running.borrow()
    }
}

fn normalize_base(url: &str) -> String {
    if url.ends_with('/') {
        url.to_owned()
    } else {
        format!("{url}/")
    }
}

fn socket_url(base: &str, session: &str) -> String {
    let url = format!("{base}Sockets/{session}");
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url
    }
}
