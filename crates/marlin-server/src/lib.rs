// marlin-server: server-side event driver.
//
// A `ServerEventDriver` owns named channels, each a live session with one
// or more connected clients.  Three interchangeable transports feed a
// channel: WebSocket (`/Sockets/<session>`), server-sent events
// (`/Events/<session>`) and SOAP long-polling (`/Polling/<session>`).
// The driver's monitor task flushes outbound queues, reaps dead
// attachments and drains inbound queues into the application callback
// through a worker pool.

mod brute_force;
mod channel;
mod config;
mod driver;
mod error;
mod monitor;
mod pool;
mod routes;

pub use brute_force::BruteForceGate;
pub use channel::{ServerEventChannel, SocketPush};
pub use config::DriverConfig;
pub use driver::{ChannelRef, ServerEventDriver};
pub use error::AttachError;

use std::sync::Arc;

use marlin_protocol::Event;

/// Application callback invoked for every inbound event on a channel.
/// The first argument is the opaque `app_data` registered with the policy.
pub type EventCallback = Arc<dyn Fn(u64, Event) + Send + Sync>;
