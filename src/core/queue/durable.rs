//! Durable, broker-backed queue.
//!
//! `add` publishes to the broker topic for remote delivery; a feeder task
//! drains the consumer's delivery stream into a bounded staging buffer;
//! `get`/`remove` operate on the staged envelopes. `remove` is the only
//! path that acknowledges delivery.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::broker::client::{Consumer, Producer};
use crate::broker::embedded::EmbeddedBroker;
use crate::broker::server::BrokerOptions;
use crate::config::Config;
use crate::core::codec;
use crate::core::envelope::Envelope;
use crate::core::error::QueueError;
use crate::core::queue::{EventQueue, InMemoryQueue};

/// Broker-backed event queue with at-least-once delivery.
///
/// Constructed against a running broker (external, or the process-wide
/// embedded one when `broker.embedded` is set). Construction fails if
/// either session cannot be established; there is no half-initialized
/// state. Call [`close`](DurableQueue::close) (or drop the queue) to stop
/// the feeder task and tear the sessions down.
#[derive(Debug)]
pub struct DurableQueue<T> {
    producer: Producer,
    consumer: Arc<Consumer>,
    topic: String,
    staging: Arc<InMemoryQueue<Envelope>>,
    shutdown: watch::Sender<bool>,
    _events: PhantomData<fn() -> T>,
}

impl<T> DurableQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens producer and consumer sessions per `config` and starts the
    /// feeder task.
    pub async fn connect(config: &Config) -> Result<DurableQueue<T>, QueueError> {
        let addr = if config.broker.embedded {
            let broker = EmbeddedBroker::shared(BrokerOptions {
                bind_addr: config.broker.addr.clone(),
                requeue_wait: config.queue.requeue_wait(),
                ..BrokerOptions::default()
            })
            .await?;
            broker.addr().to_string()
        } else {
            config.broker.addr.clone()
        };

        let producer =
            Producer::connect_with_timeout(&addr, config.queue.publish_timeout()).await?;
        let consumer = Arc::new(
            Consumer::connect(
                &addr,
                &config.queue.topic,
                &config.queue.channel,
                config.queue.max_in_flight,
            )
            .await?,
        );

        let staging = Arc::new(InMemoryQueue::new(config.queue.capacity));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(feed_loop(
            consumer.messages(),
            Arc::clone(&staging),
            shutdown_rx,
        ));

        Ok(DurableQueue {
            producer,
            consumer,
            topic: config.queue.topic.clone(),
            staging,
            shutdown,
            _events: PhantomData,
        })
    }

    /// Stops the feeder task and closes both broker sessions. Staged but
    /// unacknowledged envelopes are redelivered by the broker later.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.consumer.close().await;
        self.producer.close().await;
        debug!(topic = %self.topic, "durable queue closed");
    }
}

impl<T> Drop for DurableQueue<T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Drains received envelopes into the staging buffer until the stream
/// closes or shutdown is signalled.
async fn feed_loop(
    messages: flume::Receiver<Envelope>,
    staging: Arc<InMemoryQueue<Envelope>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = messages.recv_async() => match received {
                Ok(envelope) => envelope,
                Err(_) => break,
            },
        };
        let id = envelope.id;
        if staging.push(envelope).is_err() {
            // Saturated: leave the message unacknowledged so the broker
            // redelivers it after the requeue wait.
            warn!(
                msg_id = id,
                capacity = staging.capacity(),
                "staging buffer full, deferring message to redelivery"
            );
        }
    }
    debug!("feeder task stopped");
}

#[async_trait]
impl<T> EventQueue<T> for DurableQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Encodes the event and publishes it to the broker topic. Published
    /// events are for remote delivery; they do not pass through the local
    /// staging buffer.
    async fn add(&self, event: T) -> Result<(), QueueError> {
        let body = codec::encode(&event)?;
        self.producer.publish(&self.topic, body).await
    }

    async fn get(&self, count: usize) -> Result<Vec<T>, QueueError> {
        self.staging
            .peek(count)
            .iter()
            .map(|envelope| codec::decode(&envelope.body))
            .collect()
    }

    async fn remove(&self, count: usize) -> Vec<Result<T, QueueError>> {
        let envelopes = self.staging.pop(count);
        let mut out = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            // Acknowledge before decoding: a poison payload must not loop
            // through redelivery forever. If the ack itself fails the
            // broker redelivers later, which at-least-once permits.
            if let Err(e) = self.consumer.ack(&envelope).await {
                warn!(msg_id = envelope.id, "acknowledge failed: {e}");
            }
            out.push(codec::decode(&envelope.body));
        }
        out
    }

    fn size(&self) -> usize {
        self.staging.len()
    }
}
