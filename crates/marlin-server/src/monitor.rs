// The driver's worker bee.
//
// One task per driver.  Waits on a wake signal with an adaptive timeout:
// 500 ms at first, doubling on every idle tick up to 10 s, reset to the
// minimum by any send.  Each wake services every channel once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use marlin_protocol::tuning::{
    MONITOR_END_LOOPS, MONITOR_END_WAIT, MONITOR_INTERVAL_MAX, MONITOR_INTERVAL_MIN,
};

use crate::driver::DriverInner;

pub(crate) async fn run_monitor(inner: Arc<DriverInner>, mut running: watch::Receiver<bool>) {
    info!("event monitor started");
    let mut interval = MONITOR_INTERVAL_MIN;
    loop {
        tokio::select! {
            biased;
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            () = inner.wake.notified() => {}
            () = tokio::time::sleep(interval) => {}
        }
        if !*running.borrow() {
            break;
        }

        let mut sent = 0;
        let channels = inner.all_channels().await;
        for channel in &channels {
            channel.check_channel().await;
            sent += channel.send_channel().await;
        }
        for channel in &channels {
            sent += channel.receiving(&inner.pool).await;
        }
        interval = recalculate(interval, sent);
    }

    // Final drain, bounded by the grace window.  Polling clients get this
    // long to collect; whatever remains afterwards is discarded.
    for _ in 0..MONITOR_END_LOOPS {
        let mut pending = 0;
        for channel in inner.all_channels().await {
            channel.send_channel().await;
            channel.receiving(&inner.pool).await;
            pending += channel.pending_count().await;
        }
        if pending == 0 {
            break;
        }
        tokio::time::sleep(MONITOR_END_WAIT).await;
    }
    // Only channels whose queues did not drain are closed; their
    // leftovers go with them.  Idle channels outlive the monitor.
    for channel in inner.all_channels().await {
        if channel.pending_count().await > 0 {
            channel.close_channel().await;
        }
    }
    info!("event monitor stopped");
}

fn recalculate(current: Duration, sent: usize) -> Duration {
    let next = if sent > 0 {
        MONITOR_INTERVAL_MIN
    } else {
        (current * 2).min(MONITOR_INTERVAL_MAX)
    };
    if next != current {
        debug!(interval_ms = next.as_millis() as u64, "monitor interval");
    }
    next
}
