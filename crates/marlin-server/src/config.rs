// Driver configuration.
//
// All fields are plain integers so any host configuration loader can
// deserialize the struct; the constructor clamps every knob into its
// documented window, so a hostile file cannot push an interval out of
// range.

use std::time::Duration;

use serde::Deserialize;

use marlin_protocol::tuning;
use marlin_protocol::ws;

/// Tunables of a [`crate::ServerEventDriver`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Minimum spacing between attach attempts from one sender, ms.
    pub brute_force_interval_ms: u64,
    /// SSE keepalive comment cadence, ms.
    pub keepalive_ms: u64,
    /// Largest WebSocket frame accepted or produced, bytes.
    pub ws_fragment_size: usize,
    /// Worker tasks executing application callbacks.
    pub callback_workers: usize,
    /// Require a matching cookie on every attach, even when the session
    /// name is present in the URL.
    pub force_authentication: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            brute_force_interval_ms: tuning::BRUTE_FORCE_INTERVAL_DEFAULT.as_millis() as u64,
            keepalive_ms: tuning::KEEPALIVE_DEFAULT.as_millis() as u64,
            ws_fragment_size: ws::WS_FRAGMENT_DEFAULT,
            callback_workers: tuning::NUM_THREADS_MINIMUM,
            force_authentication: false,
        }
    }
}

impl DriverConfig {
    pub fn brute_force_interval(&self) -> Duration {
        Duration::from_millis(self.brute_force_interval_ms).clamp(
            tuning::BRUTE_FORCE_INTERVAL_MIN,
            tuning::BRUTE_FORCE_INTERVAL_MAX,
        )
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
            .clamp(tuning::KEEPALIVE_MIN, tuning::KEEPALIVE_MAX)
    }

    pub fn ws_fragment_size(&self) -> usize {
        ws::clamp_fragment_size(self.ws_fragment_size)
    }

    pub fn callback_workers(&self) -> usize {
        self.callback_workers
            .clamp(tuning::NUM_THREADS_MINIMUM, tuning::NUM_THREADS_MAXIMUM)
    }
}
