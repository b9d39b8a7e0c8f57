mod common;

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use eventbuf::broker::server::BrokerOptions;
use eventbuf::{Consumer, EmbeddedBroker, Producer};

fn local_options() -> BrokerOptions {
    BrokerOptions {
        bind_addr: "127.0.0.1:0".to_string(),
        ..BrokerOptions::default()
    }
}

#[tokio::test]
async fn concurrent_first_use_starts_exactly_one_instance() {
    common::init_logging();

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(tokio::spawn(EmbeddedBroker::shared(local_options())));
    }

    let mut addrs = HashSet::new();
    for handle in handles {
        let broker = handle.await.unwrap().unwrap();
        addrs.insert(broker.addr());
    }
    assert_eq!(addrs.len(), 1, "all callers must observe one broker");

    // The single instance is a functioning broker.
    let addr = EmbeddedBroker::shared(local_options())
        .await
        .unwrap()
        .addr()
        .to_string();
    let producer = Producer::connect(&addr).await.unwrap();
    let consumer = Consumer::connect(&addr, "t", "c", 5).await.unwrap();
    producer
        .publish("t", Bytes::from_static(b"hello"))
        .await
        .unwrap();
    let envelope = timeout(Duration::from_secs(2), consumer.messages().recv_async())
        .await
        .expect("delivery through shared broker")
        .unwrap();
    assert_eq!(&envelope.body[..], b"hello");
}
