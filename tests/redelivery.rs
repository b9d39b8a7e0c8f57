mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use eventbuf::broker::server::{Broker, BrokerOptions};
use eventbuf::{Consumer, Producer};

async fn start_broker(requeue_wait: Duration) -> Broker {
    Broker::bind(BrokerOptions {
        bind_addr: "127.0.0.1:0".to_string(),
        requeue_wait,
        sweep_interval: Duration::from_millis(50),
    })
    .await
    .expect("broker should bind")
}

#[tokio::test]
async fn unacked_message_is_redelivered_after_requeue_wait() {
    common::init_logging();
    let broker = start_broker(Duration::from_millis(200)).await;
    let addr = broker.addr().to_string();

    let producer = Producer::connect(&addr).await.unwrap();
    let consumer = Consumer::connect(&addr, "t", "c", 5).await.unwrap();
    let messages = consumer.messages();

    producer
        .publish("t", Bytes::from_static(b"payload"))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), messages.recv_async())
        .await
        .expect("first delivery")
        .unwrap();
    assert_eq!(&first.body[..], b"payload");

    // Never acked, so the broker delivers it again.
    let second = timeout(Duration::from_secs(2), messages.recv_async())
        .await
        .expect("redelivery")
        .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.body, first.body);

    // Acknowledged now; no further redelivery inside several requeue waits.
    consumer.ack(&second).await.unwrap();
    assert!(
        timeout(Duration::from_millis(700), messages.recv_async())
            .await
            .is_err(),
        "acked message must not be redelivered"
    );
}

#[tokio::test]
async fn messages_published_before_any_subscriber_are_delivered() {
    common::init_logging();
    let broker = start_broker(Duration::from_secs(30)).await;
    let addr = broker.addr().to_string();

    let producer = Producer::connect(&addr).await.unwrap();
    producer
        .publish("early", Bytes::from_static(b"held back"))
        .await
        .unwrap();

    // The first channel created inherits the topic backlog.
    let consumer = Consumer::connect(&addr, "early", "c", 5).await.unwrap();
    let envelope = timeout(Duration::from_secs(2), consumer.messages().recv_async())
        .await
        .expect("backlogged delivery")
        .unwrap();
    assert_eq!(&envelope.body[..], b"held back");
}

#[tokio::test]
async fn max_in_flight_caps_outstanding_deliveries() {
    common::init_logging();
    let broker = start_broker(Duration::from_secs(30)).await;
    let addr = broker.addr().to_string();

    let producer = Producer::connect(&addr).await.unwrap();
    let consumer = Consumer::connect(&addr, "cap", "c", 2).await.unwrap();
    let messages = consumer.messages();

    for i in 0..4u8 {
        producer.publish("cap", Bytes::from(vec![i])).await.unwrap();
    }

    let a = timeout(Duration::from_secs(2), messages.recv_async())
        .await
        .expect("delivery a")
        .unwrap();
    let b = timeout(Duration::from_secs(2), messages.recv_async())
        .await
        .expect("delivery b")
        .unwrap();
    assert_eq!((&a.body[..], &b.body[..]), (&[0u8][..], &[1u8][..]));

    // Two unacked deliveries exhaust the cap; the broker holds the rest.
    assert!(timeout(Duration::from_millis(300), messages.recv_async())
        .await
        .is_err());

    // Finishing one frees one slot.
    consumer.ack(&a).await.unwrap();
    let c = timeout(Duration::from_secs(2), messages.recv_async())
        .await
        .expect("delivery c after ack")
        .unwrap();
    assert_eq!(&c.body[..], &[2u8][..]);
}
