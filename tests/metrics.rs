mod common;

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use common::{encode_ack, encode_command, encode_message, expect_bytes, listen, serve_quit};
use redlink::core::metrics;
use redlink::{command, ConnectionBuilder, MessageReceiver};

// One sequential test: the counters are process-wide, so concurrent tests in
// this binary would race each other's deltas.
#[tokio::test]
async fn test_counters_track_the_connection_lifecycle() {
    let connections_before = metrics::CONNECTIONS_TOTAL.get();
    let active_before = metrics::ACTIVE_CONNECTIONS.get();
    let success_before = metrics::COMMANDS_SUCCESS_TOTAL.get();
    let failure_before = metrics::COMMANDS_FAILURE_TOTAL.get();
    let round_trips_before = metrics::COMMAND_ROUND_TRIP_SECONDS.get_sample_count();
    let messages_before = metrics::SUBSCRIPTION_MESSAGES_RECEIVED_TOTAL.get();

    let (listener, address) = listen().await;
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        expect_bytes(&mut sock, &encode_command(&["SETEX", "k", "5", "v"])).await;
        sock.write_all(b"+OK\r\n").await.unwrap();

        expect_bytes(&mut sock, &encode_command(&["GET", "bad"])).await;
        sock.write_all(b"-ERR boom\r\n").await.unwrap();

        expect_bytes(&mut sock, &encode_command(&["SUBSCRIBE", "news"])).await;
        sock.write_all(&encode_ack("subscribe", Some("news"), 1))
            .await
            .unwrap();
        sock.write_all(&encode_message("news", "hi")).await.unwrap();

        expect_bytes(&mut sock, &encode_command(&["UNSUBSCRIBE"])).await;
        sock.write_all(&encode_ack("unsubscribe", Some("news"), 0))
            .await
            .unwrap();

        serve_quit(&mut sock).await;
    });

    let conn = ConnectionBuilder::new()
        .address(address)
        .connect()
        .await
        .unwrap();

    assert_eq!(metrics::CONNECTIONS_TOTAL.get(), connections_before + 1.0);
    assert_eq!(metrics::ACTIVE_CONNECTIONS.get(), active_before + 1.0);

    // A non-error reply counts as a success and records a round trip.
    conn.send(command::setex("k", 5, "v")).await.unwrap();
    assert_eq!(
        metrics::COMMANDS_SUCCESS_TOTAL.get(),
        success_before + 1.0
    );
    assert_eq!(
        metrics::COMMAND_ROUND_TRIP_SECONDS.get_sample_count(),
        round_trips_before + 1
    );

    // An error reply resolves the future successfully but counts as a
    // failure.
    let reply = conn.send(command::get("bad")).await.unwrap();
    assert!(reply.is_error());
    assert_eq!(
        metrics::COMMANDS_FAILURE_TOTAL.get(),
        failure_before + 1.0
    );
    assert_eq!(
        metrics::COMMAND_ROUND_TRIP_SECONDS.get_sample_count(),
        round_trips_before + 2
    );

    let channel_gauge_before = metrics::ACTIVE_CHANNEL_SUBSCRIPTIONS.get();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let receiver: MessageReceiver = Arc::new(move |message| {
        let _ = tx.send(message);
    });
    conn.subscribe(vec![Bytes::from("news")], receiver, None, None)
        .await
        .unwrap();
    assert_eq!(
        metrics::ACTIVE_CHANNEL_SUBSCRIPTIONS.get(),
        channel_gauge_before + 1.0
    );

    let message = rx.recv().await.unwrap();
    assert_eq!(message.payload, Bytes::from("hi"));
    assert_eq!(
        metrics::SUBSCRIPTION_MESSAGES_RECEIVED_TOTAL.get(),
        messages_before + 1.0
    );

    conn.unsubscribe(Vec::new()).await.unwrap();
    assert_eq!(
        metrics::ACTIVE_CHANNEL_SUBSCRIPTIONS.get(),
        channel_gauge_before
    );

    conn.close().await;
    assert_eq!(metrics::ACTIVE_CONNECTIONS.get(), active_before);

    server.await.unwrap();
}
