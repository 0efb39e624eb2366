// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! The topology is the set of exchanges, queues and bindings declared on the
//! broker. It is described once, by the configuration, and installed on every
//! (re)connection. Declarations are idempotent on the broker side, so
//! installing the same topology twice is harmless.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation that declares through a [`Channel`]

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Channel,
};
use async_trait::async_trait;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self
    where
        Self: Sized;

    /// Adds a queue definition, and its binding, to the topology.
    fn queue(self, def: QueueDefinition) -> Self
    where
        Self: Sized;

    /// Declares every exchange, then every queue followed by its binding.
    async fn install(&self, channel: &dyn Channel) -> Result<(), AmqpError>;
}

/// Immutable topology descriptor declared through an AMQP channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    async fn install(&self, channel: &dyn Channel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self, channel: &dyn Channel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel
                .exchange_declare(&exch.name, &exch.kind, &exch.options)
                .await
            {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                return Err(AmqpError::DeclareExchangeError(exch.name.clone(), err));
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn Channel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = channel.queue_declare(&def.name, &def.options).await {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                return Err(AmqpError::DeclareQueueError(def.name.clone(), err));
            }

            debug!("queue: {} was created", def.name);

            // the default exchange binds every queue implicitly
            if !def.exchange.is_empty() {
                Self::bind_queue(channel, def.binding()).await?;
            }
        }

        Ok(())
    }

    async fn bind_queue(channel: &dyn Channel, binding: QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                binding.options,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                    err,
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::TransportError, exchange::ExchangeKind, transport::MockChannel};
    use mockall::Sequence;

    fn topology() -> AmqpTopology {
        AmqpTopology::new()
            .exchange(ExchangeDefinition::new("orders").kind(ExchangeKind::Topic))
            .queue(QueueDefinition::new("orders_q").bind("orders", "order.*"))
            .queue(QueueDefinition::new("direct_q"))
    }

    #[tokio::test]
    async fn declares_exchanges_before_queues_and_bindings() {
        let mut channel = MockChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_exchange_declare()
            .withf(|name, kind, _| name == "orders" && *kind == ExchangeKind::Topic)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|name, options| name == "orders_q" && options.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        channel
            .expect_queue_bind()
            .withf(|queue, exchange, key, _| {
                queue == "orders_q" && exchange == "orders" && key == "order.*"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_queue_declare()
            .withf(|name, _| name == "direct_q")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        topology().install(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn failed_exchange_declaration_aborts_install() {
        let mut channel = MockChannel::new();
        channel
            .expect_exchange_declare()
            .returning(|_, _, _| Err(TransportError::Network("reset".into())));
        channel.expect_queue_declare().never();

        let err = topology().install(&channel).await.unwrap_err();

        assert!(err.is_topology());
        assert_eq!(
            err,
            AmqpError::DeclareExchangeError(
                "orders".into(),
                TransportError::Network("reset".into())
            )
        );
    }

    #[tokio::test]
    async fn failed_binding_names_exchange_and_queue() {
        let mut channel = MockChannel::new();
        channel.expect_exchange_declare().returning(|_, _, _| Ok(()));
        channel.expect_queue_declare().returning(|_, _| Ok(()));
        channel.expect_queue_bind().returning(|_, _, _, _| {
            Err(TransportError::Protocol {
                reason: "NOT_FOUND".into(),
                server: true,
            })
        });

        let err = topology().install(&channel).await.unwrap_err();

        assert!(matches!(
            err,
            AmqpError::BindingExchangeToQueueError(ref exchange, ref queue, _)
                if exchange == "orders" && queue == "orders_q"
        ));
    }

    #[tokio::test]
    async fn install_is_repeatable() {
        let mut channel = MockChannel::new();
        channel
            .expect_exchange_declare()
            .times(2)
            .returning(|_, _, _| Ok(()));
        channel.expect_queue_declare().times(4).returning(|_, _| Ok(()));
        channel
            .expect_queue_bind()
            .times(2)
            .withf(|queue, exchange, key, _| {
                queue == "orders_q" && exchange == "orders" && key == "order.*"
            })
            .returning(|_, _, _, _| Ok(()));

        let topology = topology();
        topology.install(&channel).await.unwrap();
        topology.install(&channel).await.unwrap();
    }
}
