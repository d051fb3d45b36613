//! WebSocket transport: round trips, directed sends, close handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use marlin_protocol::{client_identity, ChannelPolicy, Event, EventType, Payload};
use marlin_server::{ChannelRef, DriverConfig, EventCallback, ServerEventDriver};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(driver: &ServerEventDriver) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = driver.router();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    addr
}

fn collector() -> (EventCallback, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: EventCallback = Arc::new(move |_, event| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

async fn next_app_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an application event")
        .expect("callback channel closed")
}

/// Identity the server derives for this connection (`S<addr>:D0`).
fn local_identity(ws: &WsStream) -> String {
    match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => client_identity(stream.local_addr().unwrap(), 0),
        _ => panic!("plain TCP expected in tests"),
    }
}

#[tokio::test]
async fn socket_round_trip() {
    let driver = ServerEventDriver::new(DriverConfig::default());
    let id = driver.register_channel("sock", "USERGUID", "tok", "").await;
    let (callback, mut app_events) = collector();
    assert!(
        driver
            .set_channel_policy(id, ChannelPolicy::TwoWayMessages, Some(callback), 0)
            .await
    );
    assert!(driver.start().await);
    let addr = serve(&driver).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/Sockets/sock"))
        .await
        .unwrap();

    // The attach surfaces exactly one Open to the application.
    assert_eq!(next_app_event(&mut app_events).await.event_type, EventType::Open);

    // Server to client.
    driver
        .post_event(
            ChannelRef::Id(id),
            Payload::Text("hello".into()),
            None,
            EventType::Message,
            "",
        )
        .await
        .unwrap();
    match tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        Message::Text(text) => assert_eq!(text.as_str(), "hello"),
        other => panic!("expected a text frame, got {other:?}"),
    }

    // Client to server.
    ws.send(Message::Text("hi there".into())).await.unwrap();
    let event = next_app_event(&mut app_events).await;
    assert_eq!(event.event_type, EventType::Message);
    assert_eq!(event.payload.as_text(), "hi there");

    // Peer close surfaces a Close.
    ws.close(None).await.unwrap();
    assert_eq!(next_app_event(&mut app_events).await.event_type, EventType::Close);

    driver.stop().await;
}

#[tokio::test]
async fn directed_send_reaches_only_the_addressee() {
    let driver = ServerEventDriver::new(DriverConfig::default());
    let id = driver.register_channel("direct", "USERGUID", "tok", "").await;
    assert!(
        driver
            .set_channel_policy(id, ChannelPolicy::Binary, None, 0)
            .await
    );
    assert!(driver.start().await);
    let addr = serve(&driver).await;
    let url = format!("ws://{addr}/Sockets/direct");

    let (mut ws_a, _) = connect_async(&url).await.unwrap();
    let (mut ws_b, _) = connect_async(&url).await.unwrap();
    let identity_a = local_identity(&ws_a);

    driver
        .post_event(
            ChannelRef::Id(id),
            Payload::Binary(vec![1, 2, 3]),
            Some(&identity_a),
            EventType::Binary,
            "",
        )
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(5), ws_a.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        Message::Binary(bytes) => assert_eq!(bytes.as_ref(), &[1, 2, 3]),
        other => panic!("expected a binary frame, got {other:?}"),
    }
    // B sees nothing.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), ws_b.next())
            .await
            .is_err()
    );
    // The outbound queue drained to empty.
    assert!(driver.flush_channel(ChannelRef::Id(id)).await);

    driver.stop().await;
}

#[tokio::test]
async fn policy_refuses_sockets_before_the_upgrade() {
    let driver = ServerEventDriver::new(DriverConfig::default());
    let id = driver.register_channel("sse-only", "USERGUID", "tok", "").await;
    assert!(
        driver
            .set_channel_policy(id, ChannelPolicy::HighSecurity, None, 0)
            .await
    );
    let addr = serve(&driver).await;

    let refused = connect_async(format!("ws://{addr}/Sockets/sse-only")).await;
    match refused {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        other => panic!("expected an HTTP 400 refusal, got {other:?}"),
    }
    assert_eq!(driver.channel_client_count(ChannelRef::Id(id)).await, 0);
}
