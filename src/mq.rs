// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Queue Service
//!
//! [`MessageQueue`] is the entry point of the messaging layer. It is built
//! from a [`Config`] and a [`Transport`], sets everything up eagerly and hands
//! out the registered producers and consumers by name. There is no global
//! instance: construct one and pass it to whatever needs it.
//!
//! ```no_run
//! use mqueue::{channel::LapinTransport, mq::{MessageQueue, Mq}};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), mqueue::errors::AmqpError> {
//! let mq = MessageQueue::init("settings.json", "rabbit", Arc::new(LapinTransport::new())).await?;
//!
//! mq.set_consumer_handler("orders", Arc::new(|payload: &[u8]| {
//!     println!("{} bytes", payload.len());
//! }))
//! .await?;
//!
//! mq.get_producer("orders")?.produce(br#"{"id": 1}"#.to_vec()).await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    config::{Config, Settings},
    consumer::{Consumer, ConsumerHandler},
    errors::AmqpError,
    publisher::Producer,
    supervisor::Supervisor,
    transport::Transport,
};
use async_trait::async_trait;
use std::{path::Path, sync::Arc};
use tokio::sync::broadcast;
use tracing::warn;

/// Runtime surface of the messaging layer.
#[async_trait]
pub trait Mq: Send + Sync {
    /// Looks up a registered producer.
    ///
    /// # Parameters
    /// * `name` - Name given in the `producers` section
    ///
    /// # Returns
    /// The producer, or `ProducerNotFound` for an unknown name
    fn get_producer(&self, name: &str) -> Result<Arc<dyn Producer>, AmqpError>;

    /// Looks up a registered consumer; `ConsumerNotFound` for an unknown name.
    fn get_consumer(&self, name: &str) -> Result<Arc<dyn Consumer>, AmqpError>;

    /// Binds `handler` to the consumer `name` and starts its workers.
    ///
    /// # Parameters
    /// * `name` - Name given in the `consumers` section
    /// * `handler` - Callback for every delivery; a second handler is ignored
    ///
    /// # Returns
    /// Ok(()) or `ConsumerNotFound`
    async fn set_consumer_handler(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError>;

    /// Subscribes to the runtime error stream.
    ///
    /// # Returns
    /// A receiver of every error raised from now on. Subscribers that fall
    /// more than [`crate::ERROR_STREAM_CAPACITY`] errors behind lose the
    /// oldest ones.
    fn error(&self) -> broadcast::Receiver<AmqpError>;

    /// Stops every producer and consumer and closes the connection. No
    /// reconnect happens afterwards; closing twice is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Messaging service backed by one broker connection.
#[derive(Clone)]
pub struct MessageQueue {
    supervisor: Arc<Supervisor>,
}

impl MessageQueue {
    /// Connects to the broker and sets up the configured topology, producers
    /// and consumers.
    ///
    /// # Parameters
    /// * `config` - Broker configuration
    /// * `transport` - Broker client, [`crate::channel::LapinTransport`] in
    ///   production
    ///
    /// # Returns
    /// The ready service, or the first setup error. The connection is closed
    /// when setup fails.
    pub async fn new(config: Config, transport: Arc<dyn Transport>) -> Result<MessageQueue, AmqpError> {
        let supervisor = Supervisor::start(config, transport).await?;
        Ok(MessageQueue { supervisor })
    }

    /// Loads the section of `broker` from the settings file at `path`, then
    /// behaves as [`MessageQueue::new`].
    pub async fn init(
        path: impl AsRef<Path>,
        broker: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<MessageQueue, AmqpError> {
        let settings = Settings::from_file(path)?;
        let config = settings.broker(broker)?.clone();
        MessageQueue::new(config, transport).await
    }
}

#[async_trait]
impl Mq for MessageQueue {
    fn get_producer(&self, name: &str) -> Result<Arc<dyn Producer>, AmqpError> {
        match self.supervisor.producer(name) {
            Some(producer) => Ok(producer),
            None => {
                warn!(producer = name, "producer not found");
                Err(AmqpError::ProducerNotFound(name.to_owned()))
            }
        }
    }

    fn get_consumer(&self, name: &str) -> Result<Arc<dyn Consumer>, AmqpError> {
        match self.supervisor.consumer(name) {
            Some(consumer) => Ok(consumer),
            None => {
                warn!(consumer = name, "consumer not found");
                Err(AmqpError::ConsumerNotFound(name.to_owned()))
            }
        }
    }

    async fn set_consumer_handler(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        self.get_consumer(name)?.consume(handler).await;
        Ok(())
    }

    fn error(&self) -> broadcast::Receiver<AmqpError> {
        self.supervisor.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.supervisor.close().await
    }
}
