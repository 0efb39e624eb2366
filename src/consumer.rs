// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! A consumer fans a queue out to a fixed pool of workers. Each worker owns a
//! channel and the delivery stream of one consume call on it, and runs a loop
//! that hands every delivery to the consumer's handler. Workers process their
//! deliveries one at a time, but there is no ordering between workers.
//!
//! Workers are created once, when the consumer is registered. On reconnect only
//! their channel and stream are replaced.

use crate::{
    config::ConsumerConfig,
    errors::AmqpError,
    options::Options,
    otel,
    status::{RunState, Status},
    transport::{Channel, Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status as SpanStatus},
};
use std::{
    borrow::Cow,
    sync::{Arc, OnceLock},
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Application callback invoked with the payload of every delivery.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]);
}

#[async_trait]
impl<F> ConsumerHandler for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    async fn handle(&self, payload: &[u8]) {
        self(payload)
    }
}

/// Consuming capability handed out to applications.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Binds `handler` and starts every worker. Only the first call has an
    /// effect.
    ///
    /// # Parameters
    /// * `handler` - Callback invoked with each delivery payload; the delivery
    ///   is acked once it returns, unless the consumer uses `noAck`
    async fn consume(&self, handler: Arc<dyn ConsumerHandler>);
}

#[derive(Default)]
struct Link {
    channel: Option<Arc<dyn Channel>>,
    deliveries: Option<DeliveryStream>,
}

/// One consume loop of a consumer.
pub(crate) struct Worker {
    id: usize,
    consumer: String,
    queue: String,
    no_ack: bool,
    status: Status,
    link: Mutex<Link>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    errors: mpsc::UnboundedSender<AmqpError>,
}

impl Worker {
    fn new(id: usize, config: &ConsumerConfig, errors: mpsc::UnboundedSender<AmqpError>) -> Self {
        Worker {
            id,
            consumer: config.name.clone(),
            queue: config.queue.clone(),
            no_ack: config.options.no_ack,
            status: Status::new(),
            link: Mutex::new(Link::default()),
            shutdown: Mutex::new(None),
            errors,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.status.get()
    }

    /// Replaces the channel and delivery stream used by the next run.
    pub(crate) async fn bind(&self, channel: Arc<dyn Channel>, deliveries: DeliveryStream) {
        let mut link = self.link.lock().await;
        link.channel = Some(channel);
        link.deliveries = Some(deliveries);
    }

    /// Starts the consume loop on the bound stream.
    pub(crate) async fn run(self: &Arc<Self>, handler: Arc<dyn ConsumerHandler>) {
        let (tx, rx) = oneshot::channel();

        let (channel, deliveries) = {
            let mut shutdown = self.shutdown.lock().await;
            if self.status.get() == RunState::Running {
                return;
            }

            let mut link = self.link.lock().await;
            let (Some(channel), Some(deliveries)) = (link.channel.clone(), link.deliveries.take())
            else {
                warn!(
                    consumer = self.consumer.as_str(),
                    worker = self.id,
                    "worker has no delivery stream, waiting for a new channel"
                );
                return;
            };

            *shutdown = Some(tx);
            self.status.mark_running();
            (channel, deliveries)
        };

        debug!(consumer = self.consumer.as_str(), worker = self.id, "starting worker");
        tokio::spawn(self.clone().consume_loop(channel, deliveries, handler, rx));
    }

    /// Signals the loop to close its channel and return. Only the first call
    /// after a run has an effect.
    pub(crate) async fn stop(&self) {
        let mut shutdown = self.shutdown.lock().await;
        if self.status.mark_stopped_if_running() {
            debug!(consumer = self.consumer.as_str(), worker = self.id, "stopping worker");
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn consume_loop(
        self: Arc<Self>,
        channel: Arc<dyn Channel>,
        mut deliveries: DeliveryStream,
        handler: Arc<dyn ConsumerHandler>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let tracer = global::tracer("amqp consumer");
        let mut exhausted = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    if let Err(err) = channel.close().await {
                        debug!(error = err.to_string(), worker = self.id, "error closing channel");
                        let _ = self.errors.send(AmqpError::CloseChannelError(err));
                    }
                    return;
                }
                delivery = deliveries.next(), if !exhausted => {
                    let delivery = delivery.unwrap_or_else(Delivery::closed);

                    if !delivery.is_acknowledgeable() {
                        if self.status.mark_stopped_if_running() {
                            warn!(
                                consumer = self.consumer.as_str(),
                                worker = self.id,
                                "delivery stream closed by the broker, worker stopped"
                            );
                            return;
                        }
                        // a stop is in flight, only its signal is left to wait for
                        exhausted = true;
                        continue;
                    }

                    self.dispatch(&tracer, delivery, handler.as_ref()).await;
                }
            }
        }
    }

    async fn dispatch(&self, tracer: &BoxedTracer, delivery: Delivery, handler: &dyn ConsumerHandler) {
        let Delivery {
            data,
            mut headers,
            acker,
        } = delivery;

        let (_ctx, mut span) = otel::new_span(&mut headers, tracer, &self.queue);

        debug!(consumer = self.consumer.as_str(), worker = self.id, "received message");
        handler.handle(&data).await;

        if !self.no_ack {
            if let Some(acker) = acker {
                if let Err(err) = acker.ack().await {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(SpanStatus::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    span.end();
                    let _ = self.errors.send(AmqpError::AckMessageError(err));
                    return;
                }
            }
        }

        span.set_status(SpanStatus::Ok);
        span.end();
    }
}

/// Consumer of one queue, backed by a pool of workers.
pub struct AmqpConsumer {
    name: String,
    queue: String,
    prefetch_count: u16,
    prefetch_size: u32,
    options: Options,
    workers: Vec<Arc<Worker>>,
    handler: OnceLock<Arc<dyn ConsumerHandler>>,
}

impl AmqpConsumer {
    /// Creates a consumer with its idle workers. A worker count of zero means
    /// one worker.
    pub(crate) fn new(config: &ConsumerConfig, errors: mpsc::UnboundedSender<AmqpError>) -> Self {
        let workers = (0..config.workers.max(1))
            .map(|id| Arc::new(Worker::new(id, config, errors.clone())))
            .collect();

        AmqpConsumer {
            name: config.name.clone(),
            queue: config.queue.clone(),
            prefetch_count: config.prefetch_count,
            prefetch_size: config.prefetch_size,
            options: config.options.clone(),
            workers,
            handler: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Number of workers whose loop is currently running.
    pub fn running_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| worker.state() == RunState::Running)
            .count()
    }

    pub(crate) fn worker_pool(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Prepares `worker` to consume on `channel`: applies the prefetch
    /// settings, issues the consume call and binds the resulting stream.
    pub(crate) async fn bind_worker(
        &self,
        worker: &Worker,
        channel: Arc<dyn Channel>,
    ) -> Result<(), AmqpError> {
        if let Err(err) = channel.qos(self.prefetch_count, self.prefetch_size).await {
            error!(error = err.to_string(), consumer = self.name.as_str(), "error to configure qos");
            let _ = channel.close().await;
            return Err(AmqpError::QoSDeclarationError(self.name.clone(), err));
        }

        let tag = format!("{}-{}", self.name, Uuid::new_v4());
        let deliveries = match channel.consume(&self.queue, &tag, &self.options).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = err.to_string(), consumer = self.name.as_str(), "error to create the consumer");
                let _ = channel.close().await;
                return Err(AmqpError::BindingConsumerError(self.name.clone(), err));
            }
        };

        worker.bind(channel, deliveries).await;
        Ok(())
    }

    /// Restarts every worker with the bound handler. Without a handler the
    /// workers stay idle until `consume` is called.
    pub(crate) async fn restart(&self) {
        let Some(handler) = self.handler.get().cloned() else {
            return;
        };

        for worker in &self.workers {
            worker.run(handler.clone()).await;
        }
    }

    /// Stops every worker. Each worker closes its channel on the way out.
    ///
    /// The bound handler is kept, so a later restart resumes consuming.
    pub async fn stop(&self) {
        for worker in &self.workers {
            worker.stop().await;
        }
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn consume(&self, handler: Arc<dyn ConsumerHandler>) {
        if self.handler.set(handler.clone()).is_err() {
            debug!(consumer = self.name.as_str(), "handler already bound");
            return;
        }

        for worker in &self.workers {
            worker.run(handler.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::TransportError,
        testing::wait_until,
        transport::{Acknowledger, Headers, MockChannel},
    };
    use futures_util::stream;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct CountingAcker(Arc<AtomicUsize>);

    #[async_trait]
    impl Acknowledger for CountingAcker {
        async fn ack(&self) -> Result<(), TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(workers: usize) -> ConsumerConfig {
        ConsumerConfig {
            name: "orders".into(),
            queue: "orders_q".into(),
            workers,
            prefetch_count: 10,
            ..ConsumerConfig::default()
        }
    }

    fn open_stream(messages: usize, acks: Arc<AtomicUsize>) -> DeliveryStream {
        let deliveries: Vec<Delivery> = (0..messages)
            .map(|i| {
                Delivery::new(
                    vec![i as u8],
                    Headers::new(),
                    Box::new(CountingAcker(acks.clone())),
                )
            })
            .collect();
        Box::pin(stream::iter(deliveries).chain(stream::pending()))
    }

    fn channel(messages: usize, acks: Arc<AtomicUsize>, closes: Arc<AtomicUsize>) -> Arc<dyn Channel> {
        let mut channel = MockChannel::new();
        channel
            .expect_qos()
            .withf(|count, size| *count == 10 && *size == 0)
            .returning(|_, _| Ok(()));
        channel
            .expect_consume()
            .withf(|queue, tag, _| queue == "orders_q" && tag.starts_with("orders-"))
            .return_once(move |_, _, _| Ok(open_stream(messages, acks)));
        channel.expect_close().returning(move || {
            closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Arc::new(channel)
    }

    async fn consumer(workers: usize, messages: usize) -> (AmqpConsumer, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (errors, _) = mpsc::unbounded_channel();
        let consumer = AmqpConsumer::new(&config(workers), errors);
        let acks = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        for worker in consumer.worker_pool() {
            consumer
                .bind_worker(worker, channel(messages, acks.clone(), closes.clone()))
                .await
                .unwrap();
        }

        (consumer, acks, closes)
    }

    #[tokio::test]
    async fn zero_workers_means_one() {
        let (errors, _) = mpsc::unbounded_channel();
        assert_eq!(AmqpConsumer::new(&config(0), errors).workers(), 1);
    }

    #[tokio::test]
    async fn consume_runs_every_worker_once() {
        let (consumer, acks, _) = consumer(3, 2).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        consumer
            .consume(Arc::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        assert_eq!(consumer.running_workers(), 3);

        let counter = second.clone();
        consumer
            .consume(Arc::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        assert!(wait_until(TIMEOUT, || calls.load(Ordering::SeqCst) == 6).await);
        assert!(wait_until(TIMEOUT, || acks.load(Ordering::SeqCst) == 6).await);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(consumer.running_workers(), 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (consumer, _, closes) = consumer(2, 0).await;
        consumer.consume(Arc::new(|_: &[u8]| {})).await;

        consumer.stop().await;
        consumer.stop().await;

        assert_eq!(consumer.running_workers(), 0);
        assert!(wait_until(TIMEOUT, || closes.load(Ordering::SeqCst) == 2).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_stream_stops_the_worker() {
        let (errors, _) = mpsc::unbounded_channel();
        let consumer = AmqpConsumer::new(&config(1), errors);
        let worker = &consumer.worker_pool()[0];

        let mut channel = MockChannel::new();
        channel.expect_close().never();
        let deliveries: DeliveryStream = Box::pin(stream::iter(vec![Delivery::closed()]).chain(stream::pending()));
        worker.bind(Arc::new(channel), deliveries).await;

        consumer.consume(Arc::new(|_: &[u8]| {})).await;

        assert!(wait_until(TIMEOUT, || worker.state() == RunState::Stopped).await);
        worker.stop().await;
        assert_eq!(worker.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn qos_failure_is_reported_with_the_consumer_name() {
        let (errors, _) = mpsc::unbounded_channel();
        let consumer = AmqpConsumer::new(&config(1), errors);

        let mut channel = MockChannel::new();
        channel
            .expect_qos()
            .returning(|_, _| Err(TransportError::closed("channel")));
        channel.expect_consume().never();
        channel.expect_close().times(1).returning(|| Ok(()));

        let err = consumer
            .bind_worker(&consumer.worker_pool()[0], Arc::new(channel))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::QoSDeclarationError("orders".into(), TransportError::closed("channel"))
        );
    }
}
