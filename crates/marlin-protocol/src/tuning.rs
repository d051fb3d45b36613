// Tuning constants shared by both drivers.
//
// Every knob that reaches a driver from the outside is clamped against the
// bounds below in the accepting constructor, so a hostile configuration
// cannot push an interval outside its documented range.

use std::time::Duration;

/// Server monitor wake interval: starting value and idle cap.
pub const MONITOR_INTERVAL_MIN: Duration = Duration::from_millis(500);
pub const MONITOR_INTERVAL_MAX: Duration = Duration::from_secs(10);

/// Client monitor starts faster; it shares the idle cap.
pub const CLIENT_MONITOR_INTERVAL_MIN: Duration = Duration::from_millis(100);

/// Shutdown drains the sending queues for at most
/// `MONITOR_END_LOOPS * MONITOR_END_WAIT`.
pub const MONITOR_END_LOOPS: u32 = 100;
pub const MONITOR_END_WAIT: Duration = Duration::from_millis(100);

/// Long-polling request cadence: starting value, doubling to the cap on
/// every empty reply, reset on any received event.
pub const POLL_INTERVAL_START: Duration = Duration::from_millis(100);
pub const POLL_INTERVAL_MAX: Duration = Duration::from_secs(60);

/// Brute-force admission gate: minimum spacing between attach attempts
/// from one sender.
pub const BRUTE_FORCE_INTERVAL_MIN: Duration = Duration::from_secs(3);
pub const BRUTE_FORCE_INTERVAL_MAX: Duration = Duration::from_secs(60);
pub const BRUTE_FORCE_INTERVAL_DEFAULT: Duration = Duration::from_secs(10);

/// SSE client waits up to `SSE_OPEN_RETRIES * SSE_OPEN_INTERVAL` for the
/// stream to reach the open state.
pub const SSE_OPEN_INTERVAL: Duration = Duration::from_millis(100);
pub const SSE_OPEN_RETRIES: u32 = 100;

/// Reconnection delay advertised by the server's `retry:` field.
pub const SSE_RETRY_MIN: Duration = Duration::from_millis(50);
pub const SSE_RETRY_MAX: Duration = Duration::from_millis(3000);
pub const SSE_RETRY_DEFAULT: Duration = Duration::from_millis(1000);

/// SSE keepalive comment cadence.
pub const KEEPALIVE_MIN: Duration = Duration::from_millis(500);
pub const KEEPALIVE_MAX: Duration = Duration::from_secs(7);
pub const KEEPALIVE_DEFAULT: Duration = Duration::from_secs(7);

/// Worker pool executing application callbacks.
pub const NUM_THREADS_MINIMUM: usize = 2;
pub const NUM_THREADS_MAXIMUM: usize = 8;
