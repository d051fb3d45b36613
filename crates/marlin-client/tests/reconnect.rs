//! Reconnect behavior when the server drops the socket.
//!
//! A mock endpoint closes the first WebSocket connection shortly after the
//! handshake and keeps later ones; the application must see exactly one
//! `Close` followed by one `Open`, with nothing re-delivered.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;

use marlin_client::ClientEventDriver;
use marlin_protocol::{ChannelPolicy, EventType};
use marlin_test_utils::{event_collector, next_event};

const WAIT: Duration = Duration::from_secs(5);

async fn serve_flaky() -> (SocketAddr, Arc<AtomicU32>) {
    let connects = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&connects);
    let app = Router::new().route(
        "/Sockets/{*session}",
        get(move |ws: WebSocketUpgrade| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move { ws.on_upgrade(move |socket| handle_socket(socket, attempt)) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, connects)
}

async fn handle_socket(mut socket: WebSocket, attempt: u32) {
    if attempt == 0 {
        // Drop the first connection with a clean close handshake.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    // Later connections stay open until the client hangs up.
    while let Some(Ok(_)) = socket.recv().await {}
}

#[tokio::test]
async fn socket_drop_surfaces_one_close_then_one_open() {
    let (addr, connects) = serve_flaky().await;

    let client = ClientEventDriver::default();
    let (callback, mut events) = event_collector();
    client.set_application_callback(callback, 0).await;
    assert!(
        client
            .start_event_driver(
                &format!("http://{addr}/"),
                ChannelPolicy::ImmediateS2C,
                "session",
                "USERGUID",
                "tok",
            )
            .await
    );

    let (_, open) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(open.event_type, EventType::Open);

    // The server drops the socket; the driver reconnects on its own.
    let (_, close) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(close.event_type, EventType::Close);
    let (_, reopen) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(reopen.event_type, EventType::Open);

    assert!(connects.load(Ordering::SeqCst) >= 2);
    assert!(client.is_running());
    client.stop_events_for_session().await;
}
