//! Transport failover against a real in-process server.
//!
//! The server channel only accepts SSE; a `SureDelivery` client must try
//! the socket, get refused, and land on the event stream without
//! surfacing anything but one `Open` to the application.

use std::time::Duration;

use marlin_client::ClientEventDriver;
use marlin_protocol::{ChannelPolicy, EventType, Payload};
use marlin_server::{ChannelRef, DriverConfig, ServerEventDriver};
use marlin_test_utils::{event_collector, next_event, TestServer};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn sure_delivery_falls_back_to_sse() {
    let server_driver = ServerEventDriver::new(DriverConfig::default());
    let id = server_driver
        .register_channel("fallback", "USERGUID", "tok", "")
        .await;
    assert!(
        server_driver
            .set_channel_policy(id, ChannelPolicy::HighSecurity, None, 0)
            .await
    );
    assert!(server_driver.start().await);
    let server = TestServer::start(server_driver).await.unwrap();

    let client = ClientEventDriver::default();
    let (callback, mut events) = event_collector();
    client.set_application_callback(callback, 9).await;
    assert!(
        client
            .start_event_driver(
                &server.base_url(),
                ChannelPolicy::SureDelivery,
                "fallback",
                "USERGUID",
                "tok",
            )
            .await
    );

    // One Open, with no Error surfaced in between.
    let (app_data, open) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(app_data, 9);
    assert_eq!(open.event_type, EventType::Open);

    // Server pushes arrive over the SSE leg.
    server
        .driver
        .post_event(
            ChannelRef::Id(id),
            Payload::Text("pushed".into()),
            None,
            EventType::Message,
            "",
        )
        .await
        .unwrap();
    let (_, event) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(event.event_type, EventType::Message);
    assert_eq!(event.payload.as_text(), "pushed");

    // Binary survives the text-only transport.
    server
        .driver
        .post_event(
            ChannelRef::Id(id),
            Payload::Binary(vec![9, 0, 200]),
            None,
            EventType::Binary,
            "",
        )
        .await
        .unwrap();
    let (_, event) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(event.event_type, EventType::Binary);
    assert_eq!(event.payload, Payload::Binary(vec![9, 0, 200]));

    assert!(client.stop_events_for_session().await);
    // Exactly one Close for the stopped session.
    let (_, close) = next_event(&mut events, WAIT).await.unwrap();
    assert_eq!(close.event_type, EventType::Close);

    server.driver.stop().await;
}

#[tokio::test]
async fn binary_policy_gives_up_without_a_socket() {
    // No server at all: the only candidate fails and the start reports it.
    let client = ClientEventDriver::default();
    let (callback, _events) = event_collector();
    client.set_application_callback(callback, 0).await;
    let attached = client
        .start_event_driver(
            "http://127.0.0.1:9/app/",
            ChannelPolicy::Binary,
            "nobody",
            "USERGUID",
            "tok",
        )
        .await;
    assert!(!attached);
    client.stop_events_for_session().await;
}
