//! Broker engine.
//!
//! A small topic/channel broker with at-least-once delivery: messages
//! published to a topic are copied to each of its channels; each channel
//! delivers to its subscribers round-robin, caps unacknowledged deliveries
//! at the channel's max-in-flight, and redelivers anything not finished
//! within the requeue wait. Messages published before a topic has any
//! channel are held in a topic backlog and drained into the first channel
//! created.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::protocol::{
    decode_command, encode_frame, read_frame, Ack, Command, Msg, ServerFrame,
};

/// Broker runtime options.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Listen address; port 0 picks a free port.
    pub bind_addr: String,
    /// Delay before an unacknowledged delivery is requeued.
    pub requeue_wait: Duration,
    /// How often the requeue sweep runs.
    pub sweep_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4150".to_string(),
            requeue_wait: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

/// Monotonic message id, shared across all topics.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct StoredMessage {
    id: u64,
    body: Bytes,
}

impl StoredMessage {
    fn new(body: Bytes) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            body,
        })
    }
}

type Writer = Arc<tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>>;

#[derive(Clone)]
struct SubscriberHandle {
    id: u64,
    writer: Writer,
}

struct InFlight {
    msg: Arc<StoredMessage>,
    deadline: Instant,
    sub: u64,
}

struct ChannelState {
    pending: VecDeque<Arc<StoredMessage>>,
    in_flight: HashMap<u64, InFlight>,
    subscribers: Vec<SubscriberHandle>,
    max_in_flight: usize,
    rr: usize,
}

/// A named subscription group within a topic. Each message reaching the
/// channel is delivered to exactly one of its subscribers at a time.
struct Channel {
    topic: String,
    name: String,
    requeue_wait: Duration,
    state: Mutex<ChannelState>,
}

impl Channel {
    fn new(topic: &str, name: &str, requeue_wait: Duration) -> Self {
        Self {
            topic: topic.to_string(),
            name: name.to_string(),
            requeue_wait,
            state: Mutex::new(ChannelState {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
                subscribers: Vec::new(),
                max_in_flight: 1,
                rr: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel lock poisoned")
    }

    fn publish(&self, msg: Arc<StoredMessage>) {
        self.lock().pending.push_back(msg);
    }

    fn subscribe(&self, handle: SubscriberHandle, max_in_flight: usize) {
        let mut st = self.lock();
        st.subscribers.push(handle);
        // A channel inherits the largest cap its subscribers asked for.
        st.max_in_flight = st.max_in_flight.max(max_in_flight.max(1));
    }

    /// Removes a subscriber and returns its unacknowledged deliveries to
    /// the head of the pending queue.
    fn drop_subscriber(&self, sub_id: u64) {
        let mut st = self.lock();
        st.subscribers.retain(|s| s.id != sub_id);
        let orphaned: Vec<u64> = st
            .in_flight
            .iter()
            .filter(|(_, inf)| inf.sub == sub_id)
            .map(|(id, _)| *id)
            .collect();
        for id in orphaned {
            if let Some(inf) = st.in_flight.remove(&id) {
                st.pending.push_front(inf.msg);
            }
        }
    }

    /// Acknowledges a delivery; returns false for unknown ids (already
    /// finished, or requeued in the meantime).
    fn finish(&self, id: u64) -> bool {
        self.lock().in_flight.remove(&id).is_some()
    }

    /// Returns one in-flight delivery to the pending queue.
    fn requeue(&self, id: u64) {
        let mut st = self.lock();
        if let Some(inf) = st.in_flight.remove(&id) {
            st.pending.push_front(inf.msg);
        }
    }

    /// Moves deliveries whose requeue wait elapsed back to pending.
    /// Returns how many were requeued.
    fn sweep(&self, now: Instant) -> usize {
        let mut st = self.lock();
        let expired: Vec<u64> = st
            .in_flight
            .iter()
            .filter(|(_, inf)| inf.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some(inf) = st.in_flight.remove(&id) {
                debug!(
                    topic = %self.topic,
                    channel = %self.name,
                    msg_id = id,
                    "requeueing unacknowledged message"
                );
                st.pending.push_front(inf.msg);
            }
        }
        count
    }

    /// Delivers pending messages to subscribers up to the in-flight cap.
    ///
    /// Delivery slots are claimed under the state lock; the actual socket
    /// writes happen outside it. A failed write requeues the message and
    /// drops the subscriber.
    async fn flush(&self) {
        let deliveries = {
            let mut st = self.lock();
            let mut out = Vec::new();
            while !st.pending.is_empty()
                && st.in_flight.len() < st.max_in_flight
                && !st.subscribers.is_empty()
            {
                let msg = st.pending.pop_front().expect("pending checked non-empty");
                let idx = st.rr % st.subscribers.len();
                st.rr = st.rr.wrapping_add(1);
                let sub = st.subscribers[idx].clone();
                let deadline = Instant::now() + self.requeue_wait;
                st.in_flight.insert(
                    msg.id,
                    InFlight {
                        msg: Arc::clone(&msg),
                        deadline,
                        sub: sub.id,
                    },
                );
                out.push((sub, msg));
            }
            out
        };

        for (sub, msg) in deliveries {
            let frame = match encode_frame(&ServerFrame::Msg(Msg {
                id: msg.id,
                body: msg.body.clone(),
            })) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(msg_id = msg.id, "unencodable delivery frame: {e}");
                    self.requeue(msg.id);
                    continue;
                }
            };
            let mut writer = sub.writer.lock().await;
            let res = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;
            drop(writer);
            if let Err(e) = res {
                warn!(
                    topic = %self.topic,
                    channel = %self.name,
                    msg_id = msg.id,
                    "delivery write failed, requeueing: {e}"
                );
                self.requeue(msg.id);
                self.drop_subscriber(sub.id);
            }
        }
    }
}

/// A named message stream. Holds a backlog until the first channel exists.
struct Topic {
    name: String,
    backlog: Mutex<VecDeque<Arc<StoredMessage>>>,
    channels: DashMap<String, Arc<Channel>>,
}

impl Topic {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backlog: Mutex::new(VecDeque::new()),
            channels: DashMap::new(),
        }
    }

    /// Copies a message into every channel, or into the backlog if no
    /// channel exists yet. Returns the channels that need a flush.
    fn publish(&self, msg: Arc<StoredMessage>) -> Vec<Arc<Channel>> {
        if self.channels.is_empty() {
            let mut backlog = self.backlog.lock().expect("backlog lock poisoned");
            backlog.push_back(msg);
            if self.channels.is_empty() {
                return Vec::new();
            }
            // A channel appeared while we buffered; hand the backlog over.
            let drained: Vec<Arc<StoredMessage>> = backlog.drain(..).collect();
            drop(backlog);
            let mut touched = Vec::with_capacity(self.channels.len());
            for entry in self.channels.iter() {
                for m in &drained {
                    entry.value().publish(Arc::clone(m));
                }
                touched.push(Arc::clone(entry.value()));
            }
            return touched;
        }
        let mut touched = Vec::with_capacity(self.channels.len());
        for entry in self.channels.iter() {
            entry.value().publish(Arc::clone(&msg));
            touched.push(Arc::clone(entry.value()));
        }
        touched
    }

    fn get_or_create_channel(&self, name: &str, requeue_wait: Duration) -> Arc<Channel> {
        let channel = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %self.name, channel = %name, "creating channel");
                Arc::new(Channel::new(&self.name, name, requeue_wait))
            })
            .clone();
        // The first channel inherits everything published before any
        // channel existed. Taken outside the registry entry lock so the
        // backlog mutex never nests inside it.
        let drained: Vec<Arc<StoredMessage>> = {
            let mut backlog = self.backlog.lock().expect("backlog lock poisoned");
            backlog.drain(..).collect()
        };
        if !drained.is_empty() {
            let mut st = channel.lock();
            for m in drained {
                st.pending.push_back(m);
            }
        }
        channel
    }
}

#[derive(Default)]
struct TopicRegistry {
    topics: DashMap<String, Arc<Topic>>,
}

impl TopicRegistry {
    fn get_or_create(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %name, "creating topic");
                Arc::new(Topic::new(name))
            })
            .clone()
    }
}

/// A running broker instance. Dropping the handle (or calling
/// [`Broker::shutdown`]) stops the accept loop, the requeue sweep, and all
/// client connections, and releases the listen port.
pub struct Broker {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Binds the listener and starts the accept loop and requeue sweep.
    pub async fn bind(opts: BrokerOptions) -> anyhow::Result<Broker> {
        let listener = TcpListener::bind(&opts.bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "broker listening");

        let registry = Arc::new(TopicRegistry::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&registry),
            opts.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(sweep_loop(registry, opts.sweep_interval, shutdown_rx));

        Ok(Broker { addr, shutdown })
    }

    /// The bound listen address (useful when binding port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals every broker task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<TopicRegistry>,
    opts: BrokerOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("broker accept loop stopping");
                return;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = socket.set_nodelay(true) {
                    warn!("set_nodelay failed for {peer}: {e}");
                }
                debug!(%peer, "client connected");
                let registry = Arc::clone(&registry);
                let opts = opts.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, registry, opts, shutdown_rx).await {
                        warn!(%peer, "client handler error: {e:?}");
                    }
                    debug!(%peer, "client disconnected");
                });
            }
        }
    }
}

async fn sweep_loop(
    registry: Arc<TopicRegistry>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = interval(period);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tick.tick() => {
                let now = Instant::now();
                let mut stale = Vec::new();
                for topic in registry.topics.iter() {
                    for channel in topic.value().channels.iter() {
                        if channel.value().sweep(now) > 0 {
                            stale.push(Arc::clone(channel.value()));
                        }
                    }
                }
                for channel in stale {
                    channel.flush().await;
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    registry: Arc<TopicRegistry>,
    opts: BrokerOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    // Shared with channel delivery for server->client frames.
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(BufWriter::new(write_half)));

    let sub_id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let mut subscription: Option<Arc<Channel>> = None;

    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.changed() => break,
            frame = read_frame(&mut reader) => frame?,
        };
        let Some(frame) = frame else { break };

        let cmd = match decode_command(&frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                // Skip the bad frame, keep the connection alive.
                warn!("undecodable command frame: {e}");
                continue;
            }
        };

        match cmd {
            Command::Pub { topic, body } => {
                let ack = if topic.is_empty() {
                    Ack {
                        ok: false,
                        info: "topic name must not be empty".to_string(),
                    }
                } else {
                    let msg = StoredMessage::new(body);
                    let touched = registry.get_or_create(&topic).publish(msg);
                    for channel in &touched {
                        channel.flush().await;
                    }
                    Ack {
                        ok: true,
                        info: String::new(),
                    }
                };
                write_frame(&writer, &ServerFrame::Ack(ack)).await?;
            }
            Command::Sub {
                topic,
                channel,
                max_in_flight,
            } => {
                if subscription.is_some() {
                    let ack = Ack {
                        ok: false,
                        info: "connection is already subscribed".to_string(),
                    };
                    write_frame(&writer, &ServerFrame::Ack(ack)).await?;
                    continue;
                }
                let chan = registry
                    .get_or_create(&topic)
                    .get_or_create_channel(&channel, opts.requeue_wait);
                // Ack before registering the subscriber so no delivery
                // frame can precede the ack on this connection.
                write_frame(
                    &writer,
                    &ServerFrame::Ack(Ack {
                        ok: true,
                        info: String::new(),
                    }),
                )
                .await?;
                chan.subscribe(
                    SubscriberHandle {
                        id: sub_id,
                        writer: Arc::clone(&writer),
                    },
                    max_in_flight as usize,
                );
                chan.flush().await;
                subscription = Some(chan);
            }
            Command::Fin { id } => {
                if let Some(chan) = &subscription {
                    if chan.finish(id) {
                        chan.flush().await;
                    } else {
                        debug!(msg_id = id, "finish for unknown delivery");
                    }
                } else {
                    warn!(msg_id = id, "finish on a connection with no subscription");
                }
            }
        }
    }

    if let Some(chan) = subscription {
        chan.drop_subscriber(sub_id);
        chan.flush().await;
    }
    Ok(())
}

async fn write_frame(writer: &Writer, frame: &ServerFrame) -> std::io::Result<()> {
    let bytes = encode_frame(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut w = writer.lock().await;
    w.write_all(&bytes).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: &'static [u8]) -> Arc<StoredMessage> {
        StoredMessage::new(Bytes::from_static(body))
    }

    #[test]
    fn backlog_drains_into_first_channel() {
        let topic = Topic::new("t");
        assert!(topic.publish(msg(b"a")).is_empty());
        assert!(topic.publish(msg(b"b")).is_empty());

        let chan = topic.get_or_create_channel("c", Duration::from_secs(30));
        let st = chan.lock();
        assert_eq!(st.pending.len(), 2);
        assert_eq!(&st.pending[0].body[..], b"a");
        assert_eq!(&st.pending[1].body[..], b"b");
    }

    #[test]
    fn publish_after_channel_skips_backlog() {
        let topic = Topic::new("t");
        let chan = topic.get_or_create_channel("c", Duration::from_secs(30));
        let touched = topic.publish(msg(b"x"));
        assert_eq!(touched.len(), 1);
        assert_eq!(chan.lock().pending.len(), 1);
        assert!(topic.backlog.lock().unwrap().is_empty());
    }

    #[test]
    fn finish_is_idempotent_per_delivery() {
        let chan = Channel::new("t", "c", Duration::from_secs(30));
        let m = msg(b"a");
        chan.lock().in_flight.insert(
            m.id,
            InFlight {
                msg: Arc::clone(&m),
                deadline: Instant::now() + Duration::from_secs(30),
                sub: 1,
            },
        );
        assert!(chan.finish(m.id));
        assert!(!chan.finish(m.id));
    }

    #[test]
    fn sweep_requeues_expired_deliveries() {
        let chan = Channel::new("t", "c", Duration::from_millis(100));
        let m = msg(b"a");
        let deadline = Instant::now() + Duration::from_millis(100);
        chan.lock().in_flight.insert(
            m.id,
            InFlight {
                msg: Arc::clone(&m),
                deadline,
                sub: 1,
            },
        );

        assert_eq!(chan.sweep(Instant::now()), 0);
        assert_eq!(chan.sweep(deadline + Duration::from_millis(50)), 1);

        let st = chan.lock();
        assert!(st.in_flight.is_empty());
        assert_eq!(st.pending.len(), 1);
    }

    #[test]
    fn dropped_subscriber_returns_in_flight() {
        let chan = Channel::new("t", "c", Duration::from_secs(30));
        let m = msg(b"a");
        chan.lock().in_flight.insert(
            m.id,
            InFlight {
                msg: Arc::clone(&m),
                deadline: Instant::now() + Duration::from_secs(30),
                sub: 7,
            },
        );
        chan.drop_subscriber(7);
        let st = chan.lock();
        assert!(st.in_flight.is_empty());
        assert_eq!(st.pending.len(), 1);
    }
}
