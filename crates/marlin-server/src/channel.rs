// One logical session with one or more connected clients.
//
// The channel owns its outbound queue, the polling retention queue, the
// inbound queue and the live transport attachments.  Transport I/O runs on
// handler tasks owned by the HTTP server; the channel only ever hands them
// data through per-attachment senders, so a send never blocks and a dead
// peer surfaces as a closed sender.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use marlin_protocol::polling::{self, PollReply, PollRequest};
use marlin_protocol::sse::{self, SseRecord};
use marlin_protocol::ws::CloseInfo;
use marlin_protocol::{ChannelPolicy, Event, EventType, Payload, TransportKind, TransportSet};

use crate::error::AttachError;
use crate::pool::{run_job, CallbackJob, CallbackPool};
use crate::EventCallback;

/// Data pushed to a WebSocket handler task for transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketPush {
    Text(String),
    Binary(Vec<u8>),
    Close(CloseInfo),
}

/// One live transport bound to this channel; at most one per connection.
/// Dispatch is by variant.  A polling client has no attachment; it is
/// represented by `uses_polling` and the retention queue alone.
enum AttachmentLink {
    Socket(mpsc::UnboundedSender<SocketPush>),
    Stream(mpsc::UnboundedSender<SseRecord>),
}

impl AttachmentLink {
    fn is_closed(&self) -> bool {
        match self {
            AttachmentLink::Socket(tx) => tx.is_closed(),
            AttachmentLink::Stream(tx) => tx.is_closed(),
        }
    }
}

struct Attachment {
    link: AttachmentLink,
    sender_fp: u32,
}

struct ChannelState {
    policy: ChannelPolicy,
    attachments: Vec<Attachment>,
    out_queue: VecDeque<Event>,
    pol_queue: VecDeque<Event>,
    in_queue: VecDeque<Event>,
    max_number: u32,
    min_number: u32,
    /// Number of the last event handed to a polling client; delivery
    /// advances this cursor, acknowledgement removes below it.
    last_polled: u32,
    uses_polling: bool,
    /// Sticky: set by the first attach (or first poll) and never cleared.
    /// Outbound events are held only while this is false; afterwards a
    /// flush frees whatever no live leg consumes.
    ever_attached: bool,
    open_seen: bool,
    close_seen: bool,
    closed: bool,
    callback: Option<EventCallback>,
    app_data: u64,
}

impl ChannelState {
    fn new() -> Self {
        ChannelState {
            policy: ChannelPolicy::SureDelivery,
            attachments: Vec::new(),
            out_queue: VecDeque::new(),
            pol_queue: VecDeque::new(),
            in_queue: VecDeque::new(),
            max_number: 0,
            min_number: 0,
            last_polled: 0,
            uses_polling: false,
            ever_attached: false,
            open_seen: false,
            close_seen: false,
            closed: false,
            callback: None,
            app_data: 0,
        }
    }

    fn has_sockets(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| matches!(a.link, AttachmentLink::Socket(_)))
    }

    fn has_streams(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| matches!(a.link, AttachmentLink::Stream(_)))
    }

    fn transport_set(&self) -> TransportSet {
        TransportSet {
            sockets: self.has_sockets(),
            streams: self.has_streams(),
            polling: self.uses_polling,
        }
    }

    fn queue_close_ingress(&mut self) {
        self.in_queue.push_back(Event::close(""));
    }

    /// Fan one event out to every matching attachment; a failed send drops
    /// the attachment and queues a `Close` for the application.
    fn send_to_attachments(&mut self, event: &Event) -> usize {
        let mut sent = 0;
        let mut dropped = 0;
        self.attachments.retain(|attachment| {
            if event.addressee != 0 && event.addressee != attachment.sender_fp {
                // Directed send; not the intended recipient.
                return true;
            }
            let delivered = match &attachment.link {
                AttachmentLink::Socket(tx) => {
                    let push = match &event.payload {
                        Payload::Text(text) => SocketPush::Text(text.clone()),
                        Payload::Binary(bytes) => SocketPush::Binary(bytes.clone()),
                    };
                    tx.send(push).is_ok()
                }
                AttachmentLink::Stream(tx) => tx.send(sse::event_to_record(event)).is_ok(),
            };
            if delivered {
                sent += 1;
            } else {
                dropped += 1;
            }
            delivered
        });
        for _ in 0..dropped {
            self.queue_close_ingress();
        }
        if dropped > 0 && self.attachments.is_empty() {
            self.close_seen = true;
        }
        sent
    }

    fn place_in_polling(&mut self, event: Event) {
        if self.pol_queue.is_empty() {
            self.min_number = event.number;
        }
        self.pol_queue.push_back(event);
    }

    /// Remove every retained polling event with `number <= acknowledged`.
    /// An out-of-range acknowledgement is ignored: the client is behind or
    /// ahead of the retained window.
    fn remove_acknowledged(&mut self, acknowledged: u32) {
        if acknowledged < self.min_number || acknowledged > self.max_number {
            return;
        }
        while matches!(self.pol_queue.front(), Some(first) if first.number <= acknowledged) {
            self.pol_queue.pop_front();
        }
        self.min_number = self.pol_queue.front().map_or(0, |event| event.number);
    }
}

/// Server side of one event session.
pub struct ServerEventChannel {
    id: u32,
    name: String,
    cookie: String,
    token: String,
    metadata: String,
    state: Mutex<ChannelState>,
}

impl std::fmt::Debug for ServerEventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEventChannel")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ServerEventChannel {
    pub(crate) fn new(
        id: u32,
        name: String,
        cookie: String,
        token: String,
        metadata: String,
    ) -> Self {
        ServerEventChannel {
            id,
            name,
            cookie,
            token,
            metadata,
            state: Mutex::new(ChannelState::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Composite `cookie:token` key used by the driver's cookie index.
    pub fn cookie_token(&self) -> String {
        format!("{}:{}", self.cookie, self.token)
    }

    pub async fn policy(&self) -> ChannelPolicy {
        self.state.lock().await.policy
    }

    /// Change the channel policy and application callback.  Refused when a
    /// live attachment contradicts the new policy.
    pub(crate) async fn change_policy(
        &self,
        policy: ChannelPolicy,
        callback: Option<EventCallback>,
        app_data: u64,
    ) -> bool {
        let mut state = self.state.lock().await;
        let allowed = match policy {
            ChannelPolicy::Binary | ChannelPolicy::TwoWayMessages => !state.has_streams(),
            ChannelPolicy::HighSecurity => !state.has_sockets(),
            ChannelPolicy::Disconnected => !state.has_sockets() && !state.has_streams(),
            ChannelPolicy::ImmediateS2C
            | ChannelPolicy::NoSockets
            | ChannelPolicy::SureDelivery => true,
        };
        if !allowed {
            warn!(channel = %self.name, %policy, "policy change contradicts live attachments");
            return false;
        }
        state.policy = policy;
        state.callback = callback;
        state.app_data = app_data;
        true
    }

    /// Enqueue one outbound event; returns the assigned sequence number,
    /// or `None` when the channel is already closed.
    pub(crate) async fn post_event(
        &self,
        payload: Payload,
        addressee: u32,
        event_type: EventType,
        type_name: &str,
    ) -> Option<u32> {
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }
        state.max_number += 1;
        let mut event = Event::new(event_type, payload);
        event.number = state.max_number;
        event.addressee = addressee;
        event.type_name = type_name.to_owned();
        state.out_queue.push_back(event);
        Some(state.max_number)
    }

    /// Drain the outbound queue to every live leg.  Returns the number of
    /// wire sends, which scales the monitor's waiting time.
    pub(crate) async fn send_channel(&self) -> usize {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut ChannelState) -> usize {
        if state.out_queue.is_empty() {
            return 0;
        }
        if !state.ever_attached {
            debug!(
                channel = %self.name,
                queued = state.out_queue.len(),
                "no transport has ever attached; events held"
            );
            return 0;
        }
        let mut sent = 0;
        while let Some(event) = state.out_queue.pop_front() {
            sent += state.send_to_attachments(&event);
            if state.uses_polling {
                state.place_in_polling(event);
                sent += 1;
            }
            // An event no leg consumed is freed, not persisted.
        }
        sent
    }

    /// Reap attachments whose handler task is gone.
    pub(crate) async fn check_channel(&self) {
        let mut state = self.state.lock().await;
        let before = state.attachments.len();
        state.attachments.retain(|a| !a.link.is_closed());
        let dropped = before - state.attachments.len();
        for _ in 0..dropped {
            state.queue_close_ingress();
        }
        if dropped > 0 && state.attachments.is_empty() {
            state.close_seen = true;
        }
    }

    /// Reap, then test whether the live legs satisfy the policy.
    pub(crate) async fn check_channel_policy(&self) -> bool {
        self.check_channel().await;
        let state = self.state.lock().await;
        state.policy.satisfied_by(state.transport_set())
    }

    pub(crate) async fn attach_socket(
        &self,
        tx: mpsc::UnboundedSender<SocketPush>,
        sender_fp: u32,
        origin: &str,
    ) -> Result<(), AttachError> {
        self.attach(AttachmentLink::Socket(tx), TransportKind::Socket, sender_fp, origin)
            .await
    }

    pub(crate) async fn attach_stream(
        &self,
        tx: mpsc::UnboundedSender<SseRecord>,
        sender_fp: u32,
        origin: &str,
    ) -> Result<(), AttachError> {
        self.attach(AttachmentLink::Stream(tx), TransportKind::Sse, sender_fp, origin)
            .await
    }

    async fn attach(
        &self,
        link: AttachmentLink,
        kind: TransportKind,
        sender_fp: u32,
        origin: &str,
    ) -> Result<(), AttachError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AttachError::ChannelClosed);
        }
        if !state.policy.accepts(kind) {
            warn!(channel = %self.name, ?kind, "transport refused by channel policy");
            return Err(AttachError::PolicyViolation);
        }
        state.attachments.push(Attachment { link, sender_fp });
        state.ever_attached = true;
        state.close_seen = false;
        if !state.open_seen {
            // First successful attach is the canonical Open source.
            state.open_seen = true;
            state.in_queue.push_back(Event::open(format!("Started: {origin}")));
        }
        Ok(())
    }

    pub(crate) async fn detach_socket(&self, tx: &mpsc::UnboundedSender<SocketPush>) {
        self.detach(|link| matches!(link, AttachmentLink::Socket(existing) if existing.same_channel(tx)))
            .await;
    }

    pub(crate) async fn detach_stream(&self, tx: &mpsc::UnboundedSender<SseRecord>) {
        self.detach(|link| matches!(link, AttachmentLink::Stream(existing) if existing.same_channel(tx)))
            .await;
    }

    async fn detach(&self, matches: impl Fn(&AttachmentLink) -> bool) {
        let mut state = self.state.lock().await;
        let before = state.attachments.len();
        state.attachments.retain(|a| !matches(&a.link));
        if state.attachments.len() < before {
            state.queue_close_ingress();
            if state.attachments.is_empty() {
                state.close_seen = true;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ingress from transport handler tasks
    // -----------------------------------------------------------------------

    pub(crate) async fn on_message(&self, text: String) {
        self.ingress(Event::message(text)).await;
    }

    pub(crate) async fn on_binary(&self, bytes: Vec<u8>) {
        self.ingress(Event::binary(bytes)).await;
    }

    pub(crate) async fn on_error(&self, text: String) {
        self.ingress(Event::error(text)).await;
    }

    async fn ingress(&self, event: Event) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.in_queue.push_back(event);
    }

    /// Drain the inbound queue into the application callback via the
    /// worker pool.  A synthetic `Open` is prepended before the first
    /// delivered event when none has been seen.  Runs the callback inline
    /// when the pool is gone.
    pub(crate) async fn receiving(&self, pool: &CallbackPool) -> usize {
        let mut received = 0;
        loop {
            let job = {
                let mut state = self.state.lock().await;
                let Some(callback) = state.callback.clone() else {
                    return received;
                };
                let Some(mut event) = state.in_queue.pop_front() else {
                    return received;
                };
                if !state.open_seen && event.event_type != EventType::Open {
                    state.in_queue.push_front(event);
                    state.open_seen = true;
                    event = Event::open("");
                }
                CallbackJob {
                    callback,
                    app_data: state.app_data,
                    event,
                }
            };
            match pool.submit(job).await {
                Ok(()) => received += 1,
                Err(job) => {
                    run_job(job);
                    received += 1;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Long-polling
    // -----------------------------------------------------------------------

    /// Answer one `GetMessage` envelope.
    pub(crate) async fn handle_long_polling(
        &self,
        request: PollRequest,
        origin: &str,
    ) -> Result<PollReply, AttachError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(AttachError::ChannelClosed);
        }
        if !state.policy.accepts(TransportKind::Polling) {
            warn!(channel = %self.name, "long-polling refused by channel policy");
            return Err(AttachError::PolicyViolation);
        }
        state.uses_polling = true;
        state.ever_attached = true;

        // Piggybacked client-to-server event.
        if let Some(message) = &request.message {
            let event_type = request.event_type.unwrap_or(EventType::Message);
            let payload = polling::payload_from_wire(event_type, message)
                .map_err(|_| AttachError::Malformed)?;
            if event_type == EventType::Open {
                state.open_seen = true;
            }
            state.in_queue.push_back(Event::new(event_type, payload));
        }

        if request.acknowledged > 0 {
            state.remove_acknowledged(request.acknowledged);
        }

        if request.close_channel {
            state.uses_polling = false;
            state.last_polled = 0;
            if state.attachments.is_empty() {
                // Last leg gone: tear the channel down after replying.
                drop(state);
                self.close_channel().await;
            }
            return Ok(PollReply::Closed);
        }
        state.close_seen = false;

        if !state.open_seen {
            state.open_seen = true;
            state.in_queue.push_back(Event::open(format!("Started: {origin}")));
        }

        // Anything still outbound moves into the retention queue first.
        self.flush_locked(&mut state);

        let next = state
            .pol_queue
            .iter()
            .find(|event| event.number > state.last_polled)
            .cloned();
        match next {
            Some(event) => {
                state.last_polled = event.number;
                Ok(PollReply::Delivered {
                    number: event.number,
                    event_type: event.event_type,
                    message: polling::payload_to_wire(&event.payload),
                })
            }
            None => Ok(PollReply::Empty),
        }
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Close the channel: deliver the final `Close` to the application,
    /// close every attachment, clear all queues.  Idempotent.
    pub(crate) async fn close_channel(&self) {
        let delivery = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let mut delivery = None;
            if !state.close_seen {
                state.close_seen = true;
                if let Some(callback) = state.callback.clone() {
                    state.max_number += 1;
                    let mut event = Event::close("Channel closed");
                    event.number = state.max_number;
                    delivery = Some(CallbackJob {
                        callback,
                        app_data: state.app_data,
                        event,
                    });
                }
            }
            for attachment in &state.attachments {
                if let AttachmentLink::Socket(tx) = &attachment.link {
                    let _ = tx.send(SocketPush::Close(CloseInfo::normal(
                        "event channel closing",
                    )));
                }
            }
            state.attachments.clear();
            state.out_queue.clear();
            state.in_queue.clear();
            state.pol_queue.clear();
            state.uses_polling = false;
            state.min_number = 0;
            delivery
        };
        if let Some(job) = delivery {
            run_job(job);
        }
    }

    /// Flush and report whether every sending queue is empty.
    pub(crate) async fn flush(&self) -> bool {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);
        state.out_queue.is_empty() && state.pol_queue.is_empty()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub async fn queue_count(&self) -> usize {
        let state = self.state.lock().await;
        state.out_queue.len() + state.in_queue.len()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.attachments.len()
    }

    pub(crate) async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state.out_queue.len() + state.pol_queue.len()
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel() -> ServerEventChannel {
        ServerEventChannel::new(
            1,
            "session".to_owned(),
            "USERGUID".to_owned(),
            "secret".to_owned(),
            String::new(),
        )
    }

    #[tokio::test]
    async fn numbers_are_assigned_monotonically() {
        let channel = channel();
        for expected in 1..=5 {
            let number = channel
                .post_event(Payload::Text("x".into()), 0, EventType::Message, "")
                .await
                .unwrap();
            assert_eq!(number, expected);
        }
    }

    #[tokio::test]
    async fn policy_guard_refuses_wrong_transport() {
        let channel = channel();
        assert!(channel.change_policy(ChannelPolicy::HighSecurity, None, 0).await);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = channel.attach_socket(tx, 1, "test").await;
        assert_eq!(result.unwrap_err(), AttachError::PolicyViolation);
    }

    #[tokio::test]
    async fn policy_change_refused_against_live_attachments() {
        let channel = channel();
        let (tx, _rx) = mpsc::unbounded_channel();
        channel.attach_socket(tx, 1, "test").await.unwrap();
        assert!(!channel.change_policy(ChannelPolicy::HighSecurity, None, 0).await);
        assert!(channel.change_policy(ChannelPolicy::SureDelivery, None, 0).await);
    }

    #[tokio::test]
    async fn directed_send_reaches_only_the_addressee() {
        let channel = channel();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        channel.attach_socket(tx_a, 100, "test").await.unwrap();
        channel.attach_socket(tx_b, 200, "test").await.unwrap();

        channel
            .post_event(Payload::Text("direct".into()), 100, EventType::Message, "")
            .await
            .unwrap();
        let sent = channel.send_channel().await;
        assert_eq!(sent, 1);
        assert_eq!(rx_a.try_recv().unwrap(), SocketPush::Text("direct".into()));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(channel.queue_count().await, 1); // only the Open ingress remains
    }

    #[tokio::test]
    async fn fanout_sends_to_every_attachment_and_removes_once() {
        let channel = channel();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        channel.attach_socket(tx_a, 100, "test").await.unwrap();
        channel.attach_socket(tx_b, 200, "test").await.unwrap();

        channel
            .post_event(Payload::Text("all".into()), 0, EventType::Message, "")
            .await
            .unwrap();
        assert_eq!(channel.send_channel().await, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        // Queue drained exactly once.
        assert_eq!(channel.send_channel().await, 0);
    }

    #[tokio::test]
    async fn failed_send_drops_the_attachment_and_queues_close() {
        let channel = channel();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach_socket(tx, 1, "test").await.unwrap();
        drop(rx);
        channel
            .post_event(Payload::Text("x".into()), 0, EventType::Message, "")
            .await
            .unwrap();
        assert_eq!(channel.send_channel().await, 0);
        assert_eq!(channel.client_count().await, 0);
        // Open ingress from attach plus the Close from the drop.
        assert_eq!(channel.queue_count().await, 2);
    }

    #[tokio::test]
    async fn events_are_held_until_the_first_attach() {
        let channel = channel();
        for _ in 0..2 {
            channel
                .post_event(Payload::Text("early".into()), 0, EventType::Message, "")
                .await
                .unwrap();
        }
        // Nothing has ever attached: the flush holds the queue.
        assert_eq!(channel.send_channel().await, 0);
        assert_eq!(channel.pending_count().await, 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach_socket(tx, 1, "test").await.unwrap();
        assert_eq!(channel.send_channel().await, 2);
        assert_eq!(rx.try_recv().unwrap(), SocketPush::Text("early".into()));
        assert_eq!(rx.try_recv().unwrap(), SocketPush::Text("early".into()));
        assert_eq!(channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn events_are_freed_once_the_last_attachment_is_gone() {
        let channel = channel();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach_socket(tx, 1, "test").await.unwrap();
        drop(rx);
        channel.check_channel().await;
        assert_eq!(channel.client_count().await, 0);

        // The channel was live once; an idle flush frees, never holds.
        channel
            .post_event(Payload::Text("late".into()), 0, EventType::Message, "")
            .await
            .unwrap();
        assert_eq!(channel.send_channel().await, 0);
        assert_eq!(channel.pending_count().await, 0);
    }

    #[tokio::test]
    async fn close_channel_is_idempotent_and_delivers_one_close() {
        let channel = channel();
        let (tx, _rx) = mpsc::unbounded_channel::<SocketPush>();
        channel.attach_socket(tx, 1, "test").await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |_, event| {
            let _ = seen_tx.send(event);
        });
        assert!(
            channel
                .change_policy(ChannelPolicy::SureDelivery, Some(callback), 7)
                .await
        );

        channel.close_channel().await;
        channel.close_channel().await;
        let close = seen_rx.recv().await.unwrap();
        assert_eq!(close.event_type, EventType::Close);
        assert!(seen_rx.try_recv().is_err());
        assert!(channel.is_closed().await);
    }

    #[tokio::test]
    async fn acknowledgement_removes_exactly_the_prefix() {
        let channel = channel();
        assert!(channel.change_policy(ChannelPolicy::Disconnected, None, 0).await);
        for _ in 0..5 {
            channel
                .post_event(Payload::Text("e".into()), 0, EventType::Message, "")
                .await
                .unwrap();
        }

        // First poll marks the channel as polling and takes event 1.
        let reply = channel
            .handle_long_polling(PollRequest::default(), "test")
            .await
            .unwrap();
        assert!(matches!(reply, PollReply::Delivered { number: 1, .. }));

        // Acknowledge 3: events 1..=3 leave retention, 4 is served next.
        let reply = channel
            .handle_long_polling(
                PollRequest {
                    acknowledged: 3,
                    ..PollRequest::default()
                },
                "test",
            )
            .await
            .unwrap();
        assert!(matches!(reply, PollReply::Delivered { number: 4, .. }), "{reply:?}");

        // Out-of-range acknowledgement is ignored.
        let reply = channel
            .handle_long_polling(
                PollRequest {
                    acknowledged: 99,
                    ..PollRequest::default()
                },
                "test",
            )
            .await
            .unwrap();
        assert!(matches!(reply, PollReply::Delivered { number: 5, .. }), "{reply:?}");
    }
}
