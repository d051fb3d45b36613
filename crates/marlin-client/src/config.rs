use std::time::Duration;

use serde::Deserialize;

use marlin_protocol::tuning;
use marlin_protocol::ws;

/// Tunables of a [`crate::ClientEventDriver`].  Plain integers so any host
/// configuration loader can deserialize the struct; every knob is clamped
/// on read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Largest WebSocket frame accepted or produced, bytes.
    pub ws_fragment_size: usize,
    /// How long to wait for an SSE stream to open, ms.
    pub sse_open_wait_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            ws_fragment_size: ws::WS_FRAGMENT_DEFAULT,
            sse_open_wait_ms: (tuning::SSE_OPEN_INTERVAL * tuning::SSE_OPEN_RETRIES).as_millis()
                as u64,
        }
    }
}

impl ClientConfig {
    pub fn ws_fragment_size(&self) -> usize {
        ws::clamp_fragment_size(self.ws_fragment_size)
    }

    pub fn sse_open_wait(&self) -> Duration {
        let cap = tuning::SSE_OPEN_INTERVAL * tuning::SSE_OPEN_RETRIES;
        Duration::from_millis(self.sse_open_wait_ms).min(cap)
    }
}
