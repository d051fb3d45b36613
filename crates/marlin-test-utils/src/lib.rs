// marlin-test-utils: Shared harness for the integration suites.
//
// Starts a driver-backed event server on an ephemeral port and collects
// application callbacks into channels the tests can await on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use marlin_protocol::Event;
use marlin_server::ServerEventDriver;

/// An in-process event server bound to `127.0.0.1:0`.
pub struct TestServer {
    pub driver: ServerEventDriver,
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Serve the driver's router, with peer addresses available to the
    /// handlers.
    pub async fn start(driver: ServerEventDriver) -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = driver.router();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        Ok(TestServer {
            driver,
            addr,
            handle,
        })
    }

    /// Base URL ending in `/`, ready for a transport suffix.
    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Application callback that forwards every `(app_data, event)` pair into
/// a channel.
pub fn event_collector() -> (
    Arc<dyn Fn(u64, Event) + Send + Sync>,
    mpsc::UnboundedReceiver<(u64, Event)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = Arc::new(move |app_data: u64, event: Event| {
        let _ = tx.send((app_data, event));
    });
    (callback, rx)
}

/// Await the next collected event, bounded.
pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<(u64, Event)>,
    wait: Duration,
) -> Option<(u64, Event)> {
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}
