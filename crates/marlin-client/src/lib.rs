// marlin-client: client-side event driver.
//
// Mirrors the server contract for applications consuming events: register
// one callback, start a session against a server URL, and the driver picks
// a transport per the channel policy's failover table, reconnecting on
// failure.  Posting back to the server works over WebSocket and
// long-polling; SSE is server-to-client only.

mod config;
mod driver;
mod error;
mod event_source;
mod long_polling;
mod socket;

pub use config::ClientConfig;
pub use driver::ClientEventDriver;
pub use error::TransportError;

use std::sync::Arc;

use marlin_protocol::Event;

/// Application callback invoked for every event arriving on the session.
/// The first argument is the opaque `app_data` registered alongside it.
pub type EventCallback = Arc<dyn Fn(u64, Event) + Send + Sync>;
