//! Perpetual channel scenarios: rotation, deduplication, reconnection, send
//! retries and teardown.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use perpetual_core::{
    ChannelConfig, Connection, DeferredChannel, DialRequest, Frame, HandlerBuilder, Message,
    PerpetualChannel, Scheduler, SocketError, CHANNEL_CLOSED, SHIFT_ENDED,
};
use perpetual_harness::{wait_for_connections, MockTransport, Recorded, RecordingHandler};
use serde_json::json;
use tokio::time::{sleep, Instant};

use common::{create_test_channel, create_test_channel_with, FEED};

fn text(event: Option<Recorded>) -> Option<String> {
    event
        .as_ref()
        .and_then(Recorded::message)
        .and_then(Message::as_text)
        .map(str::to_string)
}

// ----------------------------------------------------------------------------
// Rotation
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_rotation_is_invisible_to_the_consumer() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
    let joined_a = Instant::now();

    // Replacement dialed one shift after A joined
    let b_dial = transport.next_dial().await.unwrap();
    let shift = joined_a.elapsed();
    assert!(shift >= Duration::from_millis(1000), "{:?}", shift);
    assert!(shift < Duration::from_millis(1050), "{:?}", shift);

    let stats = channel.stats().await.unwrap();
    assert!(stats.dialing);
    assert_eq!(stats.connections, 1);

    let b = b_dial.accept();
    assert!(wait_for_connections(&channel, 2).await);
    let joined_b = Instant::now();

    // Both connections carry the same stream during the overlap
    a.push_text("tick");
    b.push_text("tick");
    b.push_text("tock");
    a.push_text("tock");
    assert_eq!(text(events.next().await).as_deref(), Some("tick"));
    assert_eq!(text(events.next().await).as_deref(), Some("tock"));

    assert_eq!(a.wait_client_close().await, (1000, SHIFT_ENDED.to_string()));
    let switch = joined_b.elapsed();
    assert!(switch >= Duration::from_millis(200), "{:?}", switch);
    assert!(switch < Duration::from_millis(250), "{:?}", switch);

    assert!(wait_for_connections(&channel, 1).await);
    assert!(channel.is_connected());
    // No duplicate and no unavailability across the rotation
    assert!(events.drain().is_empty());

    // Deduplication is reset once a single connection remains
    b.push_text("tick");
    assert_eq!(text(events.next().await).as_deref(), Some("tick"));
    assert_eq!(transport.stats().max_concurrent_dials, 1);
}

#[tokio::test(start_paused = true)]
async fn test_overlap_delivers_each_message_once() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);

    let a = transport.next_dial().await.unwrap().accept();
    events.next().await;
    let b = transport.next_dial().await.unwrap().accept();
    assert!(wait_for_connections(&channel, 2).await);

    for i in 0..20 {
        let payload = format!("m{}", i);
        if i % 3 == 0 {
            b.push_text(payload.clone());
            a.push_text(payload);
        } else {
            a.push_text(payload.clone());
            b.push_text(payload);
        }
    }

    let mut seen = HashSet::new();
    for _ in 0..20 {
        let payload = text(events.next().await).unwrap();
        assert!(seen.insert(payload.clone()), "duplicate {}", payload);
    }
    assert_eq!(events.next_within(Duration::from_millis(50)).await, None);

    let stats = channel.stats().await.unwrap();
    assert_eq!(stats.deduplication.accepted, 20);
    assert_eq!(stats.deduplication.duplicates, 20);
}

#[tokio::test(start_paused = true)]
async fn test_single_connection_skips_deduplication() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);

    let a = transport.next_dial().await.unwrap().accept();
    events.next().await;

    a.push_text("same");
    a.push_text("same");
    assert_eq!(text(events.next().await).as_deref(), Some("same"));
    assert_eq!(text(events.next().await).as_deref(), Some("same"));
    assert_eq!(channel.stats().await.unwrap().deduplication.accepted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_only_one_dial_at_a_time() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    // Losing the only connection while its replacement is still dialing
    let b_dial = transport.next_dial().await.unwrap();
    a.remote_close(1011, "restart");
    assert_eq!(events.next().await, Some(Recorded::Unavailable(cid)));
    assert_eq!(transport.stats().total_dials, 2);
    assert_eq!(transport.stats().pending_dials, 1);

    let _b = b_dial.accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
    assert_eq!(transport.stats().max_concurrent_dials, 1);
    assert_eq!(transport.stats().total_dials, 2);
}

// ----------------------------------------------------------------------------
// Reconnection
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_losing_last_connection() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    a.remote_close(1012, "service restart");
    let lost = Instant::now();
    let b_dial = transport.next_dial().await.unwrap();
    assert!(lost.elapsed() < Duration::from_millis(10));
    assert_eq!(events.next().await, Some(Recorded::Unavailable(cid)));
    assert!(!channel.is_connected());

    let b = b_dial.accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
    b.push_text("back");
    assert_eq!(text(events.next().await).as_deref(), Some("back"));
}

#[tokio::test(start_paused = true)]
async fn test_dial_failures_back_off() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();
    let started = Instant::now();

    transport
        .next_dial()
        .await
        .unwrap()
        .reject(SocketError::connection("refused"));
    let second = transport.next_dial().await.unwrap();
    let first_retry = started.elapsed();
    assert!(first_retry >= Duration::from_millis(50), "{:?}", first_retry);
    assert!(first_retry < Duration::from_millis(60), "{:?}", first_retry);

    second.reject(SocketError::connection("refused"));
    let third = transport.next_dial().await.unwrap();
    let second_retry = started.elapsed();
    assert!(second_retry >= Duration::from_millis(150), "{:?}", second_retry);
    assert!(second_retry < Duration::from_millis(170), "{:?}", second_retry);
    assert_eq!(channel.stats().await.unwrap().retry_attempt, 2);
    assert!(events.drain().is_empty());

    let _peer = third.accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
    assert_eq!(channel.stats().await.unwrap().retry_attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_factory_runs_per_dial() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dials);
    let _channel = PerpetualChannel::builder_with(move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        DialRequest::new(FEED).header("X-Attempt", attempt.to_string())
    })
    .config(ChannelConfig::testing())
    .handler(handler)
    .build(&Scheduler::current(), transport.handle())
    .unwrap();

    let first = transport.next_dial().await.unwrap();
    assert_eq!(first.request().header_value("x-attempt"), Some("1"));
    let a = first.accept();
    events.next().await;

    a.remote_close(1011, "restart");
    let second = transport.next_dial().await.unwrap();
    assert_eq!(second.request().header_value("x-attempt"), Some("2"));
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

// ----------------------------------------------------------------------------
// Initialization
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_initializer_runs_before_channel_is_available() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let login = HandlerBuilder::<Connection>::new()
        .on_available(|_| Ok(Some(Message::from("login"))))
        .on_message(|connection, message| {
            if message.as_text() == Some("welcome") {
                let _ = connection.complete_handler();
            }
            Ok(None)
        })
        .build();
    let channel = create_test_channel_with(&transport, handler, vec![login]);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(a.next_sent().await, Some(Frame::Text("login".into())));
    assert!(events.drain().is_empty());
    assert!(!channel.is_connected());

    a.push_text("welcome");
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
    a.push_text("quote");
    assert_eq!(text(events.next().await).as_deref(), Some("quote"));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_initializer_is_retried() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let stalled = HandlerBuilder::<Connection>::new().build();
    let _channel = create_test_channel_with(&transport, handler, vec![stalled]);

    let first = transport.next_dial().await.unwrap().accept();
    let opened = Instant::now();
    let _second = transport.next_dial().await.unwrap();

    // Initialization timeout, then the first reconnect delay
    let elapsed = opened.elapsed();
    assert!(elapsed >= Duration::from_millis(550), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "{:?}", elapsed);
    assert_eq!(
        first.client_close(),
        Some((1000, "Initialization timeout".to_string()))
    );
    assert!(events.drain().is_empty());
}

// ----------------------------------------------------------------------------
// Sending
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_send_while_disconnected_fails_fast() {
    let transport = MockTransport::manual();
    let (handler, _events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);

    assert_eq!(
        channel.send_message("early").await,
        Err(SocketError::illegal_state("Not connected"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_goes_to_newest_connection() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);

    let a = transport.next_dial().await.unwrap().accept();
    events.next().await;
    assert_eq!(channel.send_message("one").await, Ok(()));
    assert_eq!(a.next_sent().await, Some(Frame::Text("one".into())));

    let b = transport.next_dial().await.unwrap().accept();
    assert!(wait_for_connections(&channel, 2).await);
    assert_eq!(channel.send_message("two").await, Ok(()));
    assert_eq!(b.next_sent().await, Some(Frame::Text("two".into())));
    assert!(a.drain_sent().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failure_is_retried_on_replacement() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    a.fail_sends(true);
    let sending = channel.send_message("order-1");
    let b = transport.next_dial().await.unwrap().accept();

    assert_eq!(sending.await, Ok(()));
    assert_eq!(b.next_sent().await, Some(Frame::Text("order-1".into())));
    assert_eq!(events.next().await, Some(Recorded::Unavailable(cid)));
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
}

#[tokio::test(start_paused = true)]
async fn test_send_gives_up_after_max_attempts() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    a.fail_sends(true);
    let sending = tokio::spawn(channel.send_message("order-1"));

    // Every replacement fails the send as well
    let b = transport.next_dial().await.unwrap().accept();
    b.fail_sends(true);
    let c = transport.next_dial().await.unwrap().accept();
    c.fail_sends(true);

    assert_eq!(
        sending.await.unwrap(),
        Err(SocketError::connection("Injected send failure"))
    );
    for peer in [&a, &b, &c] {
        assert_eq!(peer.wait_client_close().await.0, 1000);
        assert!(peer.drain_sent().await.is_empty());
    }

    // Three attempts were made; the fourth connection never sees the message
    let d = transport.next_dial().await.unwrap().accept();
    assert!(wait_for_connections(&channel, 1).await);
    sleep(Duration::from_millis(100)).await;
    assert!(d.drain_sent().await.is_empty());
    assert_eq!(transport.stats().total_dials, 4);
}

#[tokio::test(start_paused = true)]
async fn test_send_attempts_expire_while_redials_keep_failing() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    let refuser = {
        let transport = transport.clone();
        tokio::spawn(async move {
            while let Some(dial) = transport.next_dial().await {
                dial.reject(SocketError::connection("refused"));
            }
        })
    };

    a.fail_sends(true);
    let started = Instant::now();
    let outcome = tokio::time::timeout(Duration::from_secs(10), channel.send_message("order-1"))
        .await
        .expect("send resolves");

    // Fails on A, then two attempts of 500ms each find no connection
    assert_eq!(
        outcome,
        Err(SocketError::connection("Send attempt timed out after 500ms"))
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1100), "{:?}", elapsed);
    assert_eq!(events.next().await, Some(Recorded::Unavailable(cid)));

    // Expired attempts are dropped once a connection comes back
    refuser.abort();
    let _ = refuser.await;
    let b = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));
    sleep(Duration::from_millis(100)).await;
    assert!(b.drain_sent().await.is_empty());
    assert_eq!(transport.stats().max_concurrent_dials, 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_switch_retires_old_connection_on_join() {
    common::init_tracing();
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = PerpetualChannel::builder(DialRequest::new(FEED))
        .config(ChannelConfig::testing().with_rotation(Duration::from_millis(1000), Duration::ZERO))
        .handler(handler)
        .build(&Scheduler::current(), transport.handle())
        .unwrap();
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    let _b = transport.next_dial().await.unwrap().accept();
    let joined_b = Instant::now();
    assert_eq!(a.wait_client_close().await, (1000, SHIFT_ENDED.to_string()));
    assert!(joined_b.elapsed() < Duration::from_millis(50));

    assert!(wait_for_connections(&channel, 1).await);
    assert!(channel.is_connected());
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_json_consumer() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::json();
    let channel = create_test_channel(&transport, handler);

    let a = transport.next_dial().await.unwrap().accept();
    events.next().await;

    a.push_text(r#"{"price":42}"#);
    let event = events.next().await.unwrap();
    assert_eq!(event.message(), Some(&Message::Json(json!({ "price": 42 }))));

    assert_eq!(
        channel
            .send_message(Message::Json(json!({ "op": "subscribe" })))
            .await,
        Ok(())
    );
    assert_eq!(
        a.next_sent().await,
        Some(Frame::Text(r#"{"op":"subscribe"}"#.into()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_consumer_reply_is_sent() {
    let transport = MockTransport::manual();
    let ack = HandlerBuilder::<PerpetualChannel>::new()
        .on_message(|_, message| {
            Ok(message
                .as_text()
                .map(|text| Message::from(format!("ack {}", text))))
        })
        .build();
    let channel = create_test_channel(&transport, ack);

    let a = transport.next_dial().await.unwrap().accept();
    assert!(wait_for_connections(&channel, 1).await);
    a.push_text("7");
    assert_eq!(a.next_sent().await, Some(Frame::Text("ack 7".into())));
}

// ----------------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_close_tears_everything_down() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    let cid = channel.id().as_u64();

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(events.next().await, Some(Recorded::Available(cid)));

    channel.close().await;
    assert_eq!(a.wait_client_close().await, (1000, CHANNEL_CLOSED.to_string()));
    assert_eq!(events.next().await, Some(Recorded::Unavailable(cid)));
    assert!(channel.is_closed());
    assert!(!channel.is_connected());
    assert!(channel.connections().is_empty());
    assert_eq!(
        channel.send_message("late").await,
        Err(SocketError::illegal_state("Not connected"))
    );

    // No rotation or reconnection once closed
    sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.stats().total_dials, 1);

    channel.close().await;
    assert_eq!(
        channel.stats().await,
        Err(SocketError::closed(1000, CHANNEL_CLOSED))
    );
    assert!(events.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_while_dialing_abandons_the_dial() {
    let transport = MockTransport::manual();
    let (handler, mut events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);

    let dial = transport.next_dial().await.unwrap();
    channel.close().await;

    let peer = dial.accept();
    assert_eq!(
        peer.wait_client_close().await,
        (1000, "Connection closed".to_string())
    );
    assert!(events.drain().is_empty());
    assert!(channel.connections().is_empty());
}

// ----------------------------------------------------------------------------
// Deferred Channel
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_deferred_channel_flushes_once_connected() {
    let transport = MockTransport::manual();
    let deferred = DeferredChannel::new(&Scheduler::current());
    assert!(!deferred.is_connected());

    let early = deferred.send_message("hello");

    let (handler, _events) = RecordingHandler::new();
    let channel = create_test_channel(&transport, handler);
    assert!(deferred.bind(channel.clone()));
    assert!(!deferred.bind(channel.clone()));

    let a = transport.next_dial().await.unwrap().accept();
    assert_eq!(early.await, Ok(()));
    assert_eq!(a.next_sent().await, Some(Frame::Text("hello".into())));
    assert!(deferred.is_connected());

    assert_eq!(deferred.send_message("direct").await, Ok(()));
    assert_eq!(a.next_sent().await, Some(Frame::Text("direct".into())));
}
