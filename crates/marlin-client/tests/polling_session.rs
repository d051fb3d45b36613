//! Full disconnected session: ordered collection over long-polling,
//! client-to-server piggyback, and the close handshake.

use std::time::Duration;

use marlin_client::ClientEventDriver;
use marlin_protocol::{ChannelPolicy, Event, EventType, Payload};
use marlin_server::{ChannelRef, DriverConfig, ServerEventDriver};
use marlin_test_utils::{event_collector, next_event, TestServer};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn disconnected_session_round_trip() {
    let server_driver = ServerEventDriver::new(DriverConfig::default());
    let id = server_driver
        .register_channel("disc", "USERGUID", "tok", "")
        .await;
    let (server_callback, mut server_events) = event_collector();
    assert!(
        server_driver
            .set_channel_policy(id, ChannelPolicy::Disconnected, Some(server_callback), 1)
            .await
    );
    assert!(server_driver.start().await);
    let server = TestServer::start(server_driver).await.unwrap();

    let client = ClientEventDriver::default();
    let (callback, mut client_events) = event_collector();
    client.set_application_callback(callback, 2).await;
    assert!(
        client
            .start_event_driver(
                &server.base_url(),
                ChannelPolicy::Disconnected,
                "disc",
                "USERGUID",
                "tok",
            )
            .await
    );

    // The server application learns about the session.
    let (app_data, open) = next_event(&mut server_events, WAIT).await.unwrap();
    assert_eq!(app_data, 1);
    assert_eq!(open.event_type, EventType::Open);

    // Three pushes arrive in order, preceded by a synthesized Open.
    for i in 1..=3u32 {
        server
            .driver
            .post_event(
                ChannelRef::Id(id),
                Payload::Text(format!("msg-{i}")),
                None,
                EventType::Message,
                "",
            )
            .await
            .unwrap();
    }
    let (_, open) = next_event(&mut client_events, WAIT).await.unwrap();
    assert_eq!(open.event_type, EventType::Open);
    for i in 1..=3u32 {
        let (_, event) = next_event(&mut client_events, WAIT).await.unwrap();
        assert_eq!(event.event_type, EventType::Message);
        assert_eq!(event.payload.as_text(), format!("msg-{i}"));
        assert_eq!(event.number, i);
    }

    // Client-to-server piggybacks on the next request.
    client.post_event_to_server(Event::message("upstream")).await;
    loop {
        let (_, event) = next_event(&mut server_events, WAIT).await.unwrap();
        if event.event_type == EventType::Message {
            assert_eq!(event.payload.as_text(), "upstream");
            break;
        }
    }

    // Stopping sends the final CloseChannel envelope; both sides see one
    // Close.
    assert!(client.stop_events_for_session().await);
    let (_, close) = next_event(&mut client_events, WAIT).await.unwrap();
    assert_eq!(close.event_type, EventType::Close);
    assert!(next_event(&mut client_events, Duration::from_millis(300))
        .await
        .is_none());
    loop {
        let (_, event) = next_event(&mut server_events, WAIT).await.unwrap();
        if event.event_type == EventType::Close {
            break;
        }
    }

    server.driver.stop().await;
}
