//! Broker client adapter: a publish-side [`Producer`] and a subscribe-side
//! [`Consumer`].
//!
//! Both fail construction if a session cannot be established; neither ever
//! half-initializes. The consumer exposes received envelopes as a lazy,
//! effectively infinite stream; unacknowledged envelopes are redelivered by
//! the broker after its requeue wait, so delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::broker::protocol::{
    decode_frame, encode_command, read_frame, Command, ServerFrame,
};
use crate::core::envelope::Envelope;
use crate::core::error::QueueError;

/// Fallback ack bound when a session is opened without an explicit one.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Publish-side broker session.
#[derive(Debug)]
pub struct Producer {
    inner: Mutex<ProducerInner>,
    publish_timeout: Duration,
}

#[derive(Debug)]
struct ProducerInner {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Producer {
    /// Opens a publish session against the broker at `addr` with the
    /// default ack bound.
    pub async fn connect(addr: &str) -> Result<Producer, QueueError> {
        Producer::connect_with_timeout(addr, DEFAULT_PUBLISH_TIMEOUT).await
    }

    /// Opens a publish session that waits at most `publish_timeout` for
    /// each publish to be acknowledged.
    pub async fn connect_with_timeout(
        addr: &str,
        publish_timeout: Duration,
    ) -> Result<Producer, QueueError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| QueueError::Connection(format!("producer connect to {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Ok(Producer {
            inner: Mutex::new(ProducerInner {
                reader: BufReader::new(read_half),
                writer: BufWriter::new(write_half),
            }),
            publish_timeout,
        })
    }

    /// Publishes one payload to `topic` and waits for the broker's ack,
    /// bounded by the session's publish timeout.
    ///
    /// A timeout can leave the session mid-frame; later publishes on the
    /// same session may then fail and the session should be reopened.
    pub async fn publish(&self, topic: &str, body: Bytes) -> Result<(), QueueError> {
        let frame = encode_command(&Command::Pub {
            topic: topic.to_string(),
            body,
        })
        .map_err(|e| QueueError::Publish(format!("encode: {e}")))?;
        match tokio::time::timeout(self.publish_timeout, self.round_trip(frame)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Publish(format!(
                "no ack within {:?}",
                self.publish_timeout
            ))),
        }
    }

    async fn round_trip(&self, frame: Bytes) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner
            .writer
            .write_all(&frame)
            .await
            .map_err(|e| QueueError::Publish(format!("write: {e}")))?;
        inner
            .writer
            .flush()
            .await
            .map_err(|e| QueueError::Publish(format!("flush: {e}")))?;

        let reply = read_frame(&mut inner.reader)
            .await
            .map_err(|e| QueueError::Publish(format!("ack read: {e}")))?
            .ok_or_else(|| QueueError::Publish("broker closed the connection".to_string()))?;
        match decode_frame(&reply) {
            Ok(ServerFrame::Ack(ack)) if ack.ok => Ok(()),
            Ok(ServerFrame::Ack(ack)) => Err(QueueError::Publish(ack.info)),
            Ok(other) => Err(QueueError::Publish(format!(
                "unexpected reply frame: {other:?}"
            ))),
            Err(e) => Err(QueueError::Publish(format!("undecodable ack: {e}"))),
        }
    }

    /// Closes the session.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let _ = inner.writer.shutdown().await;
    }
}

/// Subscribe-side broker session.
///
/// A background reader task parses delivery frames off the socket and
/// forwards them into a bounded channel sized to `max_in_flight`.
#[derive(Debug)]
pub struct Consumer {
    envelopes: flume::Receiver<Envelope>,
    writer: Arc<Mutex<BufWriter<OwnedWriteHalf>>>,
    shutdown: watch::Sender<bool>,
}

impl Consumer {
    /// Opens a subscription against `(topic, channel)` at `addr`.
    ///
    /// `max_in_flight` caps how many unacknowledged deliveries the broker
    /// will keep outstanding for this channel.
    pub async fn connect(
        addr: &str,
        topic: &str,
        channel: &str,
        max_in_flight: usize,
    ) -> Result<Consumer, QueueError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| QueueError::Connection(format!("consumer connect to {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let writer = Arc::new(Mutex::new(BufWriter::new(write_half)));

        // Subscribe handshake; the broker acks before any delivery.
        let sub = encode_command(&Command::Sub {
            topic: topic.to_string(),
            channel: channel.to_string(),
            max_in_flight: max_in_flight as u32,
        })
        .map_err(|e| QueueError::Connection(format!("subscribe encode: {e}")))?;
        {
            let mut w = writer.lock().await;
            w.write_all(&sub)
                .await
                .map_err(|e| QueueError::Connection(format!("subscribe write: {e}")))?;
            w.flush()
                .await
                .map_err(|e| QueueError::Connection(format!("subscribe flush: {e}")))?;
        }
        let reply = read_frame(&mut reader)
            .await
            .map_err(|e| QueueError::Connection(format!("subscribe ack read: {e}")))?
            .ok_or_else(|| QueueError::Connection("broker closed the connection".to_string()))?;
        match decode_frame(&reply) {
            Ok(ServerFrame::Ack(ack)) if ack.ok => {}
            Ok(ServerFrame::Ack(ack)) => return Err(QueueError::Connection(ack.info)),
            Ok(other) => {
                return Err(QueueError::Connection(format!(
                    "unexpected subscribe reply: {other:?}"
                )))
            }
            Err(e) => return Err(QueueError::Connection(format!("undecodable ack: {e}"))),
        }

        let (tx, rx) = flume::bounded(max_in_flight.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(read_loop(reader, tx, shutdown_rx));

        Ok(Consumer {
            envelopes: rx,
            writer,
            shutdown,
        })
    }

    /// The stream of received envelopes. The receiver can be cloned and
    /// drained from any task; it ends only when the session closes.
    pub fn messages(&self) -> flume::Receiver<Envelope> {
        self.envelopes.clone()
    }

    /// Acknowledges an envelope so the broker will not redeliver it.
    pub async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let frame = encode_command(&Command::Fin { id: envelope.id })
            .map_err(|e| QueueError::Connection(format!("finish encode: {e}")))?;
        let mut w = self.writer.lock().await;
        w.write_all(&frame)
            .await
            .map_err(|e| QueueError::Connection(format!("finish write: {e}")))?;
        w.flush()
            .await
            .map_err(|e| QueueError::Connection(format!("finish flush: {e}")))
    }

    /// Stops the reader task and closes the session.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    tx: flume::Sender<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = read_frame(&mut reader) => frame,
        };
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("consumer stream closed by broker");
                break;
            }
            Err(e) => {
                warn!("consumer stream read failed: {e}");
                break;
            }
        };
        match decode_frame(&body) {
            Ok(ServerFrame::Msg(msg)) => {
                let envelope = Envelope {
                    id: msg.id,
                    body: msg.body,
                };
                // Bounded send: waits when the local stream is not being
                // drained, which keeps broker-side in-flight as the only
                // real backpressure bound.
                if tx.send_async(envelope).await.is_err() {
                    break;
                }
            }
            Ok(other) => warn!("unexpected frame on consumer stream: {other:?}"),
            Err(e) => warn!("undecodable frame on consumer stream: {e}"),
        }
    }
}
