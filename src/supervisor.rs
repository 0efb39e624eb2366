// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! The supervisor owns the broker connection and every producer and consumer
//! built on it. Runtime errors flow into an internal stream; a dispatcher task
//! forwards each one to the public error stream and starts a reconnect when the
//! error is recoverable. Reconnects are single-flight: errors raised while a
//! cycle is in progress are reported but do not start another one.
//!
//! A reconnect cycle waits the configured delay, stops every entity, redials,
//! re-declares the topology and restarts producers and consumers on fresh
//! channels. Producer mailboxes and consumer handlers survive the cycle.
//! Closing waits for a cycle that is past its delay and stops whatever it
//! restarted.

use crate::{
    config::{Config, ConsumerConfig, ProducerConfig},
    consumer::AmqpConsumer,
    errors::{AmqpError, EntityKind, TransportError},
    publisher::AmqpProducer,
    registry::Registry,
    topology::{AmqpTopology, Topology},
    transport::{Channel, Connection, Transport},
};
use futures_util::future::join_all;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, PoisonError, Weak,
};
use tokio::{
    sync::{broadcast, mpsc, Mutex as AsyncMutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Capacity of the public error stream. Slow subscribers miss the oldest
/// errors instead of blocking the supervisor.
pub const ERROR_STREAM_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ReconnectState {
    Ready = 0,
    Reconnecting = 1,
    Closed = 2,
}

struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

pub(crate) struct Supervisor {
    config: Config,
    transport: Arc<dyn Transport>,
    topology: AmqpTopology,
    session: RwLock<Option<Session>>,
    producers: Registry<AmqpProducer>,
    consumers: Registry<AmqpConsumer>,
    reconnect: AtomicU8,
    cycle: AsyncMutex<()>,
    internal: mpsc::UnboundedSender<AmqpError>,
    public: broadcast::Sender<AmqpError>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Dials `dsn` and opens the control channel. A connection whose channel fails
/// to open is closed before returning.
async fn connect(transport: &dyn Transport, dsn: &str) -> Result<Session, AmqpError> {
    debug!("connecting to the broker...");
    let connection = transport.dial(dsn).await.map_err(|err| {
        error!(error = err.to_string(), "failure to connect");
        AmqpError::ConnectionError(err)
    })?;

    match connection.channel().await {
        Ok(channel) => {
            debug!("connected");
            Ok(Session {
                connection,
                channel,
            })
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            let _ = connection.close().await;
            Err(AmqpError::ConnectionError(err))
        }
    }
}

impl Supervisor {
    /// Connects, installs the topology and registers every configured producer
    /// and consumer. Any failure closes the connection and is returned.
    pub(crate) async fn start(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Supervisor>, AmqpError> {
        let session = connect(transport.as_ref(), &config.dsn).await?;

        let (internal, errors) = mpsc::unbounded_channel();
        let (public, _) = broadcast::channel(ERROR_STREAM_CAPACITY);

        let supervisor = Arc::new(Supervisor {
            topology: config.topology(),
            producers: Registry::new(config.producers.len()),
            consumers: Registry::new(config.consumers.len()),
            config,
            transport,
            session: RwLock::new(None),
            reconnect: AtomicU8::new(ReconnectState::Ready as u8),
            cycle: AsyncMutex::new(()),
            internal,
            public,
            tasks: Mutex::new(vec![]),
        });

        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&supervisor), errors));
        supervisor.track(dispatcher);
        supervisor.attach(session).await;

        if let Err(err) = supervisor.initial_setup().await {
            error!(error = err.to_string(), "failure to set up the messaging layer");
            let _ = supervisor.close().await;
            return Err(err);
        }

        info!(
            producers = supervisor.producers.len(),
            consumers = supervisor.consumers.len(),
            "messaging layer ready"
        );
        Ok(supervisor)
    }

    async fn initial_setup(&self) -> Result<(), AmqpError> {
        let channel = self.control_channel().await?;
        self.topology.install(channel.as_ref()).await?;

        for config in &self.config.producers {
            self.register_producer(config).await?;
        }

        for config in &self.config.consumers {
            self.register_consumer(config).await?;
        }

        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn is_closed(&self) -> bool {
        self.state() == ReconnectState::Closed
    }

    fn state(&self) -> ReconnectState {
        match self.reconnect.load(Ordering::Acquire) {
            0 => ReconnectState::Ready,
            1 => ReconnectState::Reconnecting,
            _ => ReconnectState::Closed,
        }
    }

    /// Installs `session` and watches its connection for unexpected closes.
    async fn attach(&self, session: Session) {
        let closed = session.connection.notify_close();
        let errors = self.internal.clone();

        let watcher = tokio::spawn(async move {
            // the sender is dropped without a value on a purposeful close
            if let Ok(err) = closed.await {
                warn!(error = err.to_string(), "connection closed");
                let _ = errors.send(AmqpError::TransportClosed(err));
            }
        });
        self.track(watcher);

        *self.session.write().await = Some(session);
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>, AmqpError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.connection.clone())
            .ok_or_else(|| AmqpError::ChannelError(TransportError::closed("connection")))
    }

    async fn control_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.channel.clone())
            .ok_or_else(|| AmqpError::ChannelError(TransportError::closed("connection")))
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        self.connection().await?.channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err)
        })
    }

    async fn register_producer(&self, config: &ProducerConfig) -> Result<(), AmqpError> {
        if self.producers.contains(&config.name) {
            error!(producer = config.name.as_str(), "duplicated producer");
            return Err(AmqpError::DuplicateRegistration {
                kind: EntityKind::Producer,
                name: config.name.clone(),
            });
        }

        let channel = self.open_channel().await?;
        let producer = Arc::new(AmqpProducer::new(config, channel, self.internal.clone()));
        producer.start().await;

        self.producers.set(&config.name, producer);
        debug!(producer = config.name.as_str(), "producer registered");
        Ok(())
    }

    async fn register_consumer(&self, config: &ConsumerConfig) -> Result<(), AmqpError> {
        if self.consumers.contains(&config.name) {
            error!(consumer = config.name.as_str(), "duplicated consumer");
            return Err(AmqpError::DuplicateRegistration {
                kind: EntityKind::Consumer,
                name: config.name.clone(),
            });
        }

        let consumer = AmqpConsumer::new(config, self.internal.clone());
        for worker in consumer.worker_pool() {
            let channel = self.open_channel().await?;
            consumer.bind_worker(worker, channel).await?;
        }

        self.consumers.set(&config.name, Arc::new(consumer));
        debug!(consumer = config.name.as_str(), "consumer registered");
        Ok(())
    }

    pub(crate) fn producer(&self, name: &str) -> Option<Arc<AmqpProducer>> {
        self.producers.get(name)
    }

    pub(crate) fn consumer(&self, name: &str) -> Option<Arc<AmqpConsumer>> {
        self.consumers.get(name)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AmqpError> {
        self.public.subscribe()
    }

    /// Takes the reconnect guard. Fails while a cycle is in flight or after
    /// close.
    fn begin_reconnect(&self) -> bool {
        self.reconnect
            .compare_exchange(
                ReconnectState::Ready as u8,
                ReconnectState::Reconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn end_reconnect(&self) {
        let _ = self.reconnect.compare_exchange(
            ReconnectState::Reconnecting as u8,
            ReconnectState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Runs one reconnect cycle. The caller holds the guard.
    ///
    /// Everything after the delay runs under the cycle lock, so `close` waits
    /// for a cycle in progress and tears down whatever it restarted.
    async fn reconnect(self: Arc<Self>) {
        info!(delay = ?self.config.reconnect_delay, "reconnecting...");
        tokio::time::sleep(self.config.reconnect_delay).await;

        let _cycle = self.cycle.lock().await;
        if self.is_closed() {
            debug!("closed while waiting to reconnect");
            return;
        }

        self.stop_all().await;

        let errors = match self.redial().await {
            Ok(()) => self.restore().await,
            Err(err) => vec![err],
        };

        self.end_reconnect();

        // reported after the guard is released so a recoverable failure
        // starts the next cycle
        for err in errors {
            let _ = self.internal.send(err);
        }
    }

    async fn stop_all(&self) {
        let mut stops = self
            .producers
            .go_each(|producer| async move { producer.stop().await });
        stops.extend(
            self.consumers
                .go_each(|consumer| async move { consumer.stop().await }),
        );
        join_all(stops).await;
    }

    async fn redial(&self) -> Result<(), AmqpError> {
        let session = connect(self.transport.as_ref(), &self.config.dsn).await?;

        if self.is_closed() {
            let _ = session.connection.close().await;
            return Err(AmqpError::ConnectionError(
                TransportError::closed("connection"),
            ));
        }

        let previous = self.session.write().await.take();
        if let Some(previous) = previous {
            if let Err(err) = previous.connection.close().await {
                debug!(error = err.to_string(), "error closing the previous connection");
            }
        }

        self.attach(session).await;
        info!("reconnected");
        Ok(())
    }

    /// Re-declares the topology and restarts every producer and consumer on
    /// fresh channels. Returns the failures met on the way.
    async fn restore(self: &Arc<Self>) -> Vec<AmqpError> {
        let mut errors = vec![];

        match self.control_channel().await {
            Ok(channel) => {
                if let Err(err) = self.topology.install(channel.as_ref()).await {
                    errors.push(err);
                }
            }
            Err(err) => errors.push(err),
        }

        if self.is_closed() {
            return errors;
        }

        let supervisor = self.clone();
        let restarts = self.producers.go_each(move |producer| {
            let supervisor = supervisor.clone();
            async move {
                let channel = supervisor.open_channel().await.inspect_err(|_| {
                    warn!(producer = producer.name(), "producer left stopped");
                })?;

                if supervisor.is_closed() {
                    let _ = channel.close().await;
                    return Ok(());
                }

                producer.set_channel(channel).await;
                producer.start().await;
                Ok::<(), AmqpError>(())
            }
        });

        for restart in join_all(restarts).await {
            match restart {
                Ok(Err(err)) => errors.push(err),
                Err(err) => error!(error = err.to_string(), "producer restart task failed"),
                Ok(Ok(())) => {}
            }
        }

        for consumer in self.consumers.values() {
            for worker in consumer.worker_pool() {
                if self.is_closed() {
                    return errors;
                }

                let bound = match self.open_channel().await {
                    Ok(channel) => consumer.bind_worker(worker, channel).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = bound {
                    errors.push(err);
                }
            }
            consumer.restart().await;
        }

        errors
    }

    /// Stops every entity and closes the connection. Later errors no longer
    /// trigger reconnects.
    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        let previous = self
            .reconnect
            .swap(ReconnectState::Closed as u8, Ordering::AcqRel);
        if previous == ReconnectState::Closed as u8 {
            return Ok(());
        }

        info!("closing the messaging layer");
        let _cycle = self.cycle.lock().await;
        self.stop_all().await;

        let session = self.session.write().await.take();

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }

        match session {
            Some(session) => session.connection.close().await.map_err(|err| {
                error!(error = err.to_string(), "error closing the connection");
                AmqpError::ConnectionError(err)
            }),
            None => Ok(()),
        }
    }
}

/// Forwards internal errors to the public stream and starts a reconnect for
/// the recoverable ones.
async fn dispatch(supervisor: Weak<Supervisor>, mut errors: mpsc::UnboundedReceiver<AmqpError>) {
    while let Some(err) = errors.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            return;
        };

        // no subscriber is not an error
        let _ = supervisor.public.send(err.clone());

        if !err.should_reconnect() {
            continue;
        }

        if supervisor.begin_reconnect() {
            let cycle = tokio::spawn(supervisor.clone().reconnect());
            supervisor.track(cycle);
        } else {
            debug!(error = err.to_string(), "reconnect already in progress");
        }
    }
}
