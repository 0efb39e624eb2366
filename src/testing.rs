// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! [`MemoryTransport`] implements the transport traits against an in-process
//! broker. It records every declaration, binding, qos call and publish, routes
//! published messages to bound queues, and lets tests inject deliveries and
//! fail dials, publishes or the whole connection.

use crate::{
    errors::TransportError,
    exchange::ExchangeKind,
    options::Options,
    transport::{
        Acknowledger, Channel, Connection, Delivery, DeliveryStream, Headers, Publishing,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

/// A message accepted by [`Channel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub message: Publishing,
}

/// A queue binding, as declared through [`Channel::queue_bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

struct ConnectionState {
    open: bool,
    failure: Option<TransportError>,
    close_tx: Option<oneshot::Sender<TransportError>>,
}

struct ChannelState {
    connection: u64,
    open: bool,
}

struct ConsumerSlot {
    channel: u64,
    queue: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Broker {
    next_id: u64,
    dials: usize,
    fail_dials: usize,
    fail_publishes: usize,
    channel_opens: usize,
    fail_channel_at: Vec<usize>,
    channel_delay: Duration,
    current: Option<u64>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    consumers: Vec<ConsumerSlot>,
    cursor: HashMap<String, usize>,
    exchanges: Vec<(String, ExchangeKind)>,
    queues: Vec<String>,
    bindings: Vec<Binding>,
    qos: Vec<(u16, u32)>,
    published: Vec<Published>,
    closed_channels: usize,
    acks: usize,
}

impl Broker {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, id: u64) -> bool {
        self.channels.get(&id).map(|c| c.open).unwrap_or(false)
    }

    /// Closes `connection` and its channels. Consumer senders are dropped so
    /// their delivery streams end.
    fn shutdown(&mut self, connection: u64) -> Option<oneshot::Sender<TransportError>> {
        let state = self.connections.get_mut(&connection)?;
        state.open = false;
        let close_tx = state.close_tx.take();

        let mut dead = vec![];
        for (id, channel) in self.channels.iter_mut() {
            if channel.connection == connection && channel.open {
                channel.open = false;
                dead.push(*id);
            }
        }
        self.consumers.retain(|slot| !dead.contains(&slot.channel));

        if self.current == Some(connection) {
            self.current = None;
        }
        close_tx
    }

    fn live_consumers(&self, queue: &str) -> Vec<usize> {
        self.consumers
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.queue == queue && !slot.tx.is_closed() && self.channel_open(slot.channel)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    fn deliver(&mut self, queue: &str, data: Vec<u8>, headers: Headers, acker: MemoryAcker) -> bool {
        let live = self.live_consumers(queue);
        if live.is_empty() {
            return false;
        }

        let cursor = self.cursor.entry(queue.to_owned()).or_default();
        let slot = &self.consumers[live[*cursor % live.len()]];
        *cursor += 1;

        slot.tx
            .send(Delivery::new(data, headers, Box::new(acker)))
            .is_ok()
    }

    fn exchange_kind(&self, name: &str) -> ExchangeKind {
        self.exchanges
            .iter()
            .rev()
            .find(|(exchange, _)| exchange == name)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_default()
    }

    fn routes(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_owned()];
        }

        let kind = self.exchange_kind(exchange);
        let mut queues: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) => p == k && go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

type Shared = Arc<Mutex<Broker>>;

fn lock(broker: &Shared) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory transport. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Shared,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Number of dial attempts, failed ones included.
    pub fn dial_count(&self) -> usize {
        lock(&self.broker).dials
    }

    /// Makes the next `n` dials fail with a network error.
    pub fn fail_next_dials(&self, n: usize) {
        lock(&self.broker).fail_dials = n;
    }

    /// Makes the next `n` publishes fail with a broker rejection.
    pub fn fail_publishes(&self, n: usize) {
        lock(&self.broker).fail_publishes = n;
    }

    /// Number of channel open attempts across every connection.
    pub fn channel_count(&self) -> usize {
        lock(&self.broker).channel_opens
    }

    /// Makes the `n`-th channel open attempt fail with a network error,
    /// counting from the first one ever made on this transport.
    pub fn fail_channel_at(&self, n: usize) {
        lock(&self.broker).fail_channel_at.push(n);
    }

    /// Delays every later channel open by `delay`.
    pub fn delay_channels(&self, delay: Duration) {
        lock(&self.broker).channel_delay = delay;
    }

    /// Kills the current connection with `err`, as if the broker or the
    /// network dropped it.
    pub fn fail(&self, err: TransportError) {
        let close_tx = {
            let mut broker = lock(&self.broker);
            let Some(current) = broker.current else {
                return;
            };
            if let Some(state) = broker.connections.get_mut(&current) {
                state.failure = Some(err.clone());
            }
            broker.shutdown(current)
        };

        if let Some(tx) = close_tx {
            let _ = tx.send(err);
        }
    }

    /// Delivers `body` to one live consumer of `queue`, round robin.
    ///
    /// Returns false when the queue has no live consumer.
    pub fn deliver(&self, queue: &str, body: &[u8]) -> bool {
        let acker = MemoryAcker {
            broker: self.broker.clone(),
        };
        lock(&self.broker).deliver(queue, body.to_vec(), Headers::new(), acker)
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.broker).published.clone()
    }

    /// Number of channels closed while open.
    pub fn closed_channels(&self) -> usize {
        lock(&self.broker).closed_channels
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        lock(&self.broker)
            .exchanges
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        lock(&self.broker).queues.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        lock(&self.broker).bindings.clone()
    }

    /// Every `(prefetch_count, prefetch_size)` pair applied so far.
    pub fn qos(&self) -> Vec<(u16, u32)> {
        lock(&self.broker).qos.clone()
    }

    pub fn acks(&self) -> usize {
        lock(&self.broker).acks
    }

    /// Number of open consume calls on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock(&self.broker).live_consumers(queue).len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, _dsn: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut broker = lock(&self.broker);
        broker.dials += 1;

        if broker.fail_dials > 0 {
            broker.fail_dials -= 1;
            return Err(TransportError::Network("connection refused".into()));
        }

        let id = broker.id();
        broker.connections.insert(
            id,
            ConnectionState {
                open: true,
                failure: None,
                close_tx: None,
            },
        );
        broker.current = Some(id);

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Shared,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let delay = lock(&self.broker).channel_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut broker = lock(&self.broker);
        broker.channel_opens += 1;
        let attempt = broker.channel_opens;
        if let Some(pos) = broker.fail_channel_at.iter().position(|n| *n == attempt) {
            broker.fail_channel_at.swap_remove(pos);
            return Err(TransportError::Network("channel open timed out".into()));
        }

        let open = broker
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false);
        if !open {
            return Err(TransportError::closed("connection"));
        }

        let id = broker.id();
        broker.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn notify_close(&self) -> oneshot::Receiver<TransportError> {
        let (tx, rx) = oneshot::channel();
        let mut broker = lock(&self.broker);
        if let Some(state) = broker.connections.get_mut(&self.id) {
            match (&state.failure, state.open) {
                (Some(err), _) => {
                    let _ = tx.send(err.clone());
                }
                (None, true) => state.close_tx = Some(tx),
                (None, false) => {}
            }
        }
        rx
    }

    async fn close(&self) -> Result<(), TransportError> {
        // dropping the close sender tells the watcher the close was on purpose
        let _ = lock(&self.broker).shutdown(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    broker: Shared,
}

impl MemoryChannel {
    fn open(&self) -> Result<MutexGuard<'_, Broker>, TransportError> {
        let broker = lock(&self.broker);
        if !broker.channel_open(self.id) {
            return Err(TransportError::closed("channel"));
        }
        Ok(broker)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        _options: &Options,
    ) -> Result<(), TransportError> {
        self.open()?.exchanges.push((name.to_owned(), kind.clone()));
        Ok(())
    }

    async fn queue_declare(&self, name: &str, _options: &Options) -> Result<(), TransportError> {
        self.open()?.queues.push(name.to_owned());
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _options: &Options,
    ) -> Result<(), TransportError> {
        let mut broker = self.open()?;
        let binding = Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !broker.bindings.contains(&binding) {
            broker.bindings.push(binding);
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), TransportError> {
        self.open()?.qos.push((prefetch_count, prefetch_size));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _options: &Options,
    ) -> Result<DeliveryStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.open()?.consumers.push(ConsumerSlot {
            channel: self.id,
            queue: queue.to_owned(),
            tx,
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<(), TransportError> {
        let mut broker = self.open()?;

        if broker.fail_publishes > 0 {
            broker.fail_publishes -= 1;
            return Err(TransportError::Protocol {
                reason: "publish rejected".into(),
                server: true,
            });
        }

        for queue in broker.routes(exchange, routing_key) {
            let acker = MemoryAcker {
                broker: self.broker.clone(),
            };
            broker.deliver(&queue, message.body.clone(), message.headers.clone(), acker);
        }

        broker.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            mandatory,
            immediate,
            message,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut broker = lock(&self.broker);
        let Some(channel) = broker.channels.get_mut(&self.id) else {
            return Ok(());
        };
        if !channel.open {
            return Ok(());
        }

        channel.open = false;
        broker.closed_channels += 1;
        let id = self.id;
        broker.consumers.retain(|slot| slot.channel != id);
        Ok(())
    }
}

struct MemoryAcker {
    broker: Shared,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        lock(&self.broker).acks += 1;
        Ok(())
    }
}

/// Polls `f` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("order.created", "order.deleted"));
    }

    #[tokio::test]
    async fn failed_connection_ends_consume_streams() {
        use futures_util::StreamExt;

        let transport = MemoryTransport::new();
        let connection = transport.dial("amqp://memory").await.unwrap();
        let closed = connection.notify_close();
        let channel = connection.channel().await.unwrap();
        let mut deliveries = channel
            .consume("orders_q", "orders-1", &Options::default())
            .await
            .unwrap();

        assert!(transport.deliver("orders_q", b"one"));
        transport.fail(TransportError::Network("reset".into()));

        assert_eq!(deliveries.next().await.unwrap().data, b"one");
        assert!(deliveries.next().await.is_none());
        assert_eq!(closed.await.unwrap(), TransportError::Network("reset".into()));
        assert!(channel.qos(1, 0).await.is_err());
        assert!(!transport.deliver("orders_q", b"two"));
    }

    #[tokio::test]
    async fn scheduled_channel_failures_hit_the_right_attempt() {
        let transport = MemoryTransport::new();
        transport.fail_channel_at(2);
        let connection = transport.dial("amqp://memory").await.unwrap();

        assert!(connection.channel().await.is_ok());
        assert_eq!(
            connection.channel().await.err(),
            Some(TransportError::Network("channel open timed out".into()))
        );
        assert!(connection.channel().await.is_ok());
        assert_eq!(transport.channel_count(), 3);
    }

    #[tokio::test]
    async fn purposeful_close_drops_the_notifier() {
        let transport = MemoryTransport::new();
        let connection = transport.dial("amqp://memory").await.unwrap();
        let closed = connection.notify_close();

        connection.close().await.unwrap();
        assert!(closed.await.is_err());
    }
}
