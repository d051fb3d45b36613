// Registry of event channels and front door for incoming connections.
//
// Channels are looked up three ways: by number, by session name (the URL
// tail after the transport prefix) and by cookie/value pair.  When a
// request presents a cookie that matches a registered pair, the cookie
// wins over the path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use marlin_protocol::tuning::{MONITOR_END_LOOPS, MONITOR_END_WAIT};
use marlin_protocol::{sender_fingerprint, ChannelPolicy, EventType, Payload};

use crate::brute_force::BruteForceGate;
use crate::channel::ServerEventChannel;
use crate::config::DriverConfig;
use crate::error::AttachError;
use crate::monitor::run_monitor;
use crate::pool::CallbackPool;
use crate::routes;
use crate::EventCallback;

/// How a caller names a channel.
#[derive(Debug, Clone, Copy)]
pub enum ChannelRef<'a> {
    Id(u32),
    Name(&'a str),
    Cookie { name: &'a str, value: &'a str },
}

pub(crate) struct DriverInner {
    pub config: DriverConfig,
    pub channels: RwLock<HashMap<u32, Arc<ServerEventChannel>>>,
    /// Lowercased session name -> channel id.
    pub names: RwLock<HashMap<String, u32>>,
    /// Lowercased `cookie:token` -> channel id.
    pub cookies: RwLock<HashMap<String, u32>>,
    pub next_id: AtomicU32,
    pub force_auth: AtomicBool,
    pub active: AtomicBool,
    pub wake: Notify,
    pub running: watch::Sender<bool>,
    pub gate: BruteForceGate,
    pub pool: CallbackPool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl DriverInner {
    pub async fn all_channels(&self) -> Vec<Arc<ServerEventChannel>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn channel_by_id(&self, id: u32) -> Option<Arc<ServerEventChannel>> {
        self.channels.read().await.get(&id).cloned()
    }
}

/// Server-side event driver.  Cheap to clone; all clones share one
/// registry and one monitor.
#[derive(Clone)]
pub struct ServerEventDriver {
    inner: Arc<DriverInner>,
}

impl ServerEventDriver {
    pub fn new(config: DriverConfig) -> Self {
        let (running, _) = watch::channel(false);
        let gate = BruteForceGate::new(config.brute_force_interval());
        let pool = CallbackPool::new(config.callback_workers());
        let force = config.force_authentication;
        ServerEventDriver {
            inner: Arc::new(DriverInner {
                config,
                channels: RwLock::new(HashMap::new()),
                names: RwLock::new(HashMap::new()),
                cookies: RwLock::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                force_auth: AtomicBool::new(force),
                active: AtomicBool::new(false),
                wake: Notify::new(),
                running,
                gate,
                pool,
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Create a channel for a user session.  Returns the channel number.
    pub async fn register_channel(
        &self,
        session_name: &str,
        cookie: &str,
        token: &str,
        metadata: &str,
    ) -> u32 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(ServerEventChannel::new(
            id,
            session_name.to_owned(),
            cookie.to_owned(),
            token.to_owned(),
            metadata.to_owned(),
        ));
        let cookie_key = channel.cookie_token().to_ascii_lowercase();
        self.inner.channels.write().await.insert(id, channel);
        self.inner
            .names
            .write()
            .await
            .insert(session_name.to_ascii_lowercase(), id);
        self.inner.cookies.write().await.insert(cookie_key, id);
        info!(channel = id, session = %session_name, "channel registered");
        id
    }

    /// Change policy and application callback for a channel.
    pub async fn set_channel_policy(
        &self,
        channel: u32,
        policy: ChannelPolicy,
        callback: Option<EventCallback>,
        app_data: u64,
    ) -> bool {
        match self.inner.channel_by_id(channel).await {
            Some(channel) => channel.change_policy(policy, callback, app_data).await,
            None => false,
        }
    }

    /// Require a matching cookie on every attach, ignoring path routing.
    pub fn set_force_authentication(&self, force: bool) {
        self.inner.force_auth.store(force, Ordering::SeqCst);
    }

    /// Clamped to [3 s, 60 s]; returns whether the value was accepted
    /// as given.
    pub async fn set_brute_force_interval(&self, interval: Duration) -> bool {
        self.inner.gate.set_interval(interval).await
    }

    /// Start the monitor.  Open for business when this returns `true`.
    pub async fn start(&self) -> bool {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.running.send(true);
        let handle = tokio::spawn(run_monitor(
            Arc::clone(&self.inner),
            self.inner.running.subscribe(),
        ));
        *self.inner.monitor.lock().await = Some(handle);
        true
    }

    /// Stop the monitor, draining what can be drained inside the grace
    /// window; whatever polling clients did not collect is discarded.
    pub async fn stop(&self) -> bool {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            return true;
        }
        let _ = self.inner.running.send(false);
        self.inner.wake.notify_one();
        let handle = self.inner.monitor.lock().await.take();
        let Some(mut handle) = handle else { return true };
        let grace = MONITOR_END_WAIT * MONITOR_END_LOOPS + Duration::from_secs(1);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("monitor did not stop inside the grace window; aborting");
                handle.abort();
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.channels.read().await.len()
    }

    async fn resolve(&self, reference: ChannelRef<'_>) -> Option<Arc<ServerEventChannel>> {
        match reference {
            ChannelRef::Id(id) => self.inner.channel_by_id(id).await,
            ChannelRef::Name(name) => {
                let id = *self.inner.names.read().await.get(&name.to_ascii_lowercase())?;
                self.inner.channel_by_id(id).await
            }
            ChannelRef::Cookie { name, value } => {
                let key = format!("{name}:{value}").to_ascii_lowercase();
                let id = *self.inner.cookies.read().await.get(&key)?;
                self.inner.channel_by_id(id).await
            }
        }
    }

    /// Post an event to a channel.  Returns the assigned sequence number,
    /// or `None` when the channel does not exist or is closed.  When the
    /// monitor is not running the channel is flushed inline.
    pub async fn post_event(
        &self,
        to: ChannelRef<'_>,
        payload: Payload,
        addressee: Option<&str>,
        event_type: EventType,
        type_name: &str,
    ) -> Option<u32> {
        let channel = self.resolve(to).await?;
        let fingerprint = match addressee {
            Some(identity) if !identity.is_empty() => sender_fingerprint(identity),
            _ => 0,
        };
        let number = channel
            .post_event(payload, fingerprint, event_type, type_name)
            .await?;
        if self.is_active() {
            self.inner.wake.notify_one();
        } else {
            channel.send_channel().await;
        }
        Some(number)
    }

    /// Flush one channel; `true` when every sending queue came up empty.
    pub async fn flush_channel(&self, reference: ChannelRef<'_>) -> bool {
        match self.resolve(reference).await {
            Some(channel) => channel.flush().await,
            None => false,
        }
    }

    /// Remove a channel, optionally draining it first.  Unregistering an
    /// unknown channel is a no-op.
    pub async fn unregister_channel(&self, reference: ChannelRef<'_>, flush: bool) -> bool {
        let Some(channel) = self.resolve(reference).await else {
            return false;
        };
        self.inner.channels.write().await.remove(&channel.id());
        self.inner
            .names
            .write()
            .await
            .remove(&channel.name().to_ascii_lowercase());
        self.inner
            .cookies
            .write()
            .await
            .remove(&channel.cookie_token().to_ascii_lowercase());
        if flush {
            for _ in 0..MONITOR_END_LOOPS {
                if channel.flush().await {
                    break;
                }
                tokio::time::sleep(MONITOR_END_WAIT).await;
            }
        }
        channel.close_channel().await;
        info!(channel = channel.id(), "channel unregistered");
        true
    }

    /// Reap dead attachments, then test the channel against its policy.
    pub async fn check_channel_policy(&self, channel: u32) -> bool {
        match self.inner.channel_by_id(channel).await {
            Some(channel) => channel.check_channel_policy().await,
            None => false,
        }
    }

    pub async fn channel_queue_count(&self, reference: ChannelRef<'_>) -> usize {
        match self.resolve(reference).await {
            Some(channel) => channel.queue_count().await,
            None => 0,
        }
    }

    pub async fn channel_client_count(&self, reference: ChannelRef<'_>) -> usize {
        match self.resolve(reference).await {
            Some(channel) => channel.client_count().await,
            None => 0,
        }
    }

    /// Routes for the three transport endpoints, to be nested under the
    /// host's base path.
    pub fn router(&self) -> axum::Router {
        routes::router(self.clone())
    }

    // -----------------------------------------------------------------------
    // Transport-facing plumbing
    // -----------------------------------------------------------------------

    pub(crate) async fn channel_by_id(&self, id: u32) -> Option<Arc<ServerEventChannel>> {
        self.inner.channel_by_id(id).await
    }

    /// Route an incoming request to its channel: cookie match first, then
    /// the session name from the URL unless authentication is forced.
    pub(crate) async fn route_request(
        &self,
        cookies: &[(String, String)],
        session: Option<&str>,
    ) -> Result<Arc<ServerEventChannel>, AttachError> {
        for (name, value) in cookies {
            if let Some(channel) = self
                .resolve(ChannelRef::Cookie { name, value })
                .await
            {
                return Ok(channel);
            }
        }
        if self.inner.force_auth.load(Ordering::SeqCst) {
            warn!("attach without a matching cookie while authentication is forced");
            return Err(AttachError::AuthFailure);
        }
        match session {
            Some(name) if !name.is_empty() => self
                .resolve(ChannelRef::Name(name))
                .await
                .ok_or(AttachError::UnknownChannel),
            _ => Err(AttachError::UnknownChannel),
        }
    }

    /// Gate an attach attempt; `true` means reject.
    pub(crate) async fn check_brute_force(&self, sender_fp: u32) -> bool {
        self.inner.gate.is_attack(sender_fp).await
    }

    /// An inbound event arrived: wake the monitor, or deliver inline when
    /// no monitor is running.
    pub(crate) async fn signal_ingress(&self, channel: &Arc<ServerEventChannel>) {
        if self.is_active() {
            self.inner.wake.notify_one();
        } else {
            let received = channel.receiving(&self.inner.pool).await;
            debug!(channel = channel.id(), received, "inline ingress delivery");
        }
    }

    pub(crate) fn keepalive(&self) -> Duration {
        self.inner.config.keepalive()
    }

    pub(crate) fn ws_fragment_size(&self) -> usize {
        self.inner.config.ws_fragment_size()
    }
}
