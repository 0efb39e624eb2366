// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! A producer owns a bounded mailbox and a publish task. `produce` only
//! enqueues; the task dequeues in order and publishes on the producer's
//! channel. The mailbox outlives the channel, so messages waiting in it survive
//! a reconnect. A message that fails to publish is reported and dropped: the
//! producer publishes at most once per dequeue.

use crate::{
    config::ProducerConfig,
    errors::AmqpError,
    options::Options,
    otel,
    status::{RunState, Status},
    transport::{Channel, Headers, Publishing},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Publishing capability handed out to applications.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Enqueues `payload` for publishing, waiting while the mailbox is full.
    ///
    /// # Parameters
    /// * `payload` - Message body, sent with the producer's `contentType` option
    ///
    /// # Returns
    /// Ok(()) once the message is in the mailbox, or `MailboxClosed` when the
    /// producer is gone. Publish failures are reported on the error stream.
    async fn produce(&self, payload: Vec<u8>) -> Result<(), AmqpError>;
}

/// Producer publishing to an AMQP exchange.
pub struct AmqpProducer {
    name: String,
    exchange: String,
    routing_key: String,
    mandatory: bool,
    immediate: bool,
    options: Options,
    status: Status,
    channel: Mutex<Arc<dyn Channel>>,
    outbox: mpsc::Sender<Vec<u8>>,
    mailbox: Mutex<mpsc::Receiver<Vec<u8>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    errors: mpsc::UnboundedSender<AmqpError>,
}

impl AmqpProducer {
    /// Creates an idle producer; `start` launches its publish task.
    ///
    /// A `buffer_size` of zero gives a mailbox of one message.
    pub(crate) fn new(
        config: &ProducerConfig,
        channel: Arc<dyn Channel>,
        errors: mpsc::UnboundedSender<AmqpError>,
    ) -> Self {
        let (outbox, mailbox) = mpsc::channel(config.buffer_size.max(1));

        AmqpProducer {
            name: config.name.clone(),
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
            mandatory: config.mandatory,
            immediate: config.immediate,
            options: config.options.clone(),
            status: Status::new(),
            channel: Mutex::new(channel),
            outbox,
            mailbox: Mutex::new(mailbox),
            shutdown: Mutex::new(None),
            errors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the publish task is running.
    pub fn state(&self) -> RunState {
        self.status.get()
    }

    /// Replaces the channel used by the next run of the publish task.
    pub(crate) async fn set_channel(&self, channel: Arc<dyn Channel>) {
        *self.channel.lock().await = channel;
    }

    /// Launches the publish task on the current channel.
    pub(crate) async fn start(self: &Arc<Self>) {
        let channel = self.channel.lock().await.clone();
        let (tx, rx) = oneshot::channel();

        {
            let mut shutdown = self.shutdown.lock().await;
            if self.status.get() == RunState::Running {
                warn!(producer = self.name.as_str(), "producer is already running");
                return;
            }
            *shutdown = Some(tx);
            self.status.mark_running();
        }

        debug!(producer = self.name.as_str(), "starting producer");
        tokio::spawn(self.clone().worker(channel, rx));
    }

    /// Signals the publish task to close its channel and return.
    ///
    /// Only the first call after a start has an effect. Messages left in the
    /// mailbox are kept for the next start.
    ///
    /// # Returns
    /// As soon as the signal is sent; the task closes its channel on its own
    pub async fn stop(&self) {
        let mut shutdown = self.shutdown.lock().await;
        if self.status.mark_stopped_if_running() {
            debug!(producer = self.name.as_str(), "stopping producer");
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn worker(self: Arc<Self>, channel: Arc<dyn Channel>, mut shutdown: oneshot::Receiver<()>) {
        // a previous run may still be draining, wait for it to release the mailbox
        let mut mailbox = tokio::select! {
            biased;
            _ = &mut shutdown => {
                self.close_channel(channel.as_ref()).await;
                return;
            }
            mailbox = self.mailbox.lock() => mailbox,
        };

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.close_channel(channel.as_ref()).await;
                    return;
                }
                message = mailbox.recv() => match message {
                    Some(body) => {
                        if let Err(err) = self.publish(channel.as_ref(), body).await {
                            let _ = self.errors.send(err);
                        }
                    }
                    None => return,
                },
            }
        }
    }

    async fn publish(&self, channel: &dyn Channel, body: Vec<u8>) -> Result<(), AmqpError> {
        let mut headers = Headers::new();
        otel::inject_current(&mut headers);

        let message = Publishing {
            body,
            content_type: self.options.content_type.clone(),
            delivery_mode: self.options.delivery_mode,
            message_id: Uuid::new_v4().to_string(),
            headers,
        };

        match channel
            .publish(
                &self.exchange,
                &self.routing_key,
                self.mandatory,
                self.immediate,
                message,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    producer = self.name.as_str(),
                    "error publishing message"
                );
                Err(AmqpError::PublishingError(err))
            }
            _ => Ok(()),
        }
    }

    async fn close_channel(&self, channel: &dyn Channel) {
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), producer = self.name.as_str(), "error closing channel");
            let _ = self.errors.send(AmqpError::CloseChannelError(err));
        }
    }
}

#[async_trait]
impl Producer for AmqpProducer {
    async fn produce(&self, payload: Vec<u8>) -> Result<(), AmqpError> {
        self.outbox
            .send(payload)
            .await
            .map_err(|_| AmqpError::MailboxClosed(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, MemoryTransport};
    use crate::transport::Transport;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn config(buffer_size: usize) -> ProducerConfig {
        ProducerConfig {
            name: "orders".into(),
            exchange: "orders".into(),
            routing_key: "order.created".into(),
            buffer_size,
            mandatory: true,
            ..ProducerConfig::default()
        }
    }

    async fn producer(
        transport: &MemoryTransport,
        buffer_size: usize,
    ) -> (Arc<AmqpProducer>, mpsc::UnboundedReceiver<AmqpError>) {
        let connection = transport.dial("amqp://memory").await.unwrap();
        let channel = connection.channel().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(AmqpProducer::new(&config(buffer_size), channel, tx)), rx)
    }

    #[tokio::test]
    async fn publishes_in_enqueue_order() {
        let transport = MemoryTransport::new();
        let (producer, _errors) = producer(&transport, 4).await;
        producer.start().await;

        for i in 0..20u8 {
            producer.produce(vec![i]).await.unwrap();
        }

        assert!(wait_until(TIMEOUT, || transport.published().len() == 20).await);
        let published = transport.published();
        let bodies: Vec<u8> = published.iter().map(|p| p.message.body[0]).collect();
        assert_eq!(bodies, (0..20u8).collect::<Vec<_>>());
        assert_eq!(published[0].exchange, "orders");
        assert_eq!(published[0].routing_key, "order.created");
        assert!(published[0].mandatory);
        assert!(!published[0].immediate);
        assert_eq!(published[0].message.content_type, "application/json");
        assert_eq!(published[0].message.delivery_mode, 1);
    }

    #[tokio::test]
    async fn messages_wait_in_the_mailbox_until_started() {
        let transport = MemoryTransport::new();
        let (producer, _errors) = producer(&transport, 8).await;

        producer.produce(b"early".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.published().is_empty());

        producer.start().await;
        assert!(wait_until(TIMEOUT, || transport.published().len() == 1).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_once() {
        let transport = MemoryTransport::new();
        let (producer, _errors) = producer(&transport, 1).await;
        producer.start().await;

        producer.stop().await;
        producer.stop().await;

        assert_eq!(producer.state(), RunState::Stopped);
        assert!(wait_until(TIMEOUT, || transport.closed_channels() == 1).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.closed_channels(), 1);
    }

    #[tokio::test]
    async fn publish_failures_are_reported_and_not_retried() {
        let transport = MemoryTransport::new();
        let (producer, mut errors) = producer(&transport, 4).await;
        producer.start().await;

        transport.fail_publishes(1);
        producer.produce(b"lost".to_vec()).await.unwrap();
        producer.produce(b"kept".to_vec()).await.unwrap();

        let err = errors.recv().await.unwrap();
        assert!(matches!(err, AmqpError::PublishingError(_)));
        assert!(wait_until(TIMEOUT, || transport.published().len() == 1).await);
        assert_eq!(transport.published()[0].message.body, b"kept");
    }

    #[tokio::test]
    async fn restart_resumes_the_mailbox_on_the_new_channel() {
        let transport = MemoryTransport::new();
        let (producer, _errors) = producer(&transport, 8).await;
        producer.start().await;
        producer.stop().await;

        producer.produce(b"queued".to_vec()).await.unwrap();

        let connection = transport.dial("amqp://memory").await.unwrap();
        producer.set_channel(connection.channel().await.unwrap()).await;
        producer.start().await;

        assert!(wait_until(TIMEOUT, || transport.published().len() == 1).await);
        assert_eq!(producer.state(), RunState::Running);
    }
}
