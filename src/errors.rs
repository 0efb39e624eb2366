// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error types for every stage of the messaging layer:
//! loading configuration, connecting, declaring the topology, registering
//! producers and consumers, and the runtime failures that are surfaced on the
//! asynchronous error stream.
//!
//! Transport failures are kept in a transport-neutral shape, [`TransportError`],
//! so the connection supervisor can decide whether a failure should trigger a
//! reconnect.

use std::fmt;
use thiserror::Error;

/// Reply code used for operations attempted on a channel or connection that is
/// no longer open.
pub const CHANNEL_ERROR_CODE: u16 = 504;

/// A failure reported by the broker transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket failed: refused dial, reset, missed heartbeats.
    #[error("network failure: {0}")]
    Network(String),

    /// An AMQP level error. `server` is true when the broker initiated it,
    /// e.g. a `PRECONDITION_FAILED` channel close.
    #[error("protocol error: {reason}")]
    Protocol { reason: String, server: bool },
}

impl TransportError {
    /// Client side protocol error for a channel or connection that is closed.
    pub fn closed(what: &str) -> Self {
        TransportError::Protocol {
            reason: format!("{} is not open ({})", what, CHANNEL_ERROR_CODE),
            server: false,
        }
    }

    /// Network errors and client side protocol errors are recoverable by
    /// redialing; broker initiated protocol errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Protocol { server, .. } => !server,
        }
    }
}

/// The kind of a registered entity, used in registration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Producer,
    Consumer,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Producer => f.write_str("producer"),
            EntityKind::Consumer => f.write_str("consumer"),
        }
    }
}

/// Represents errors that can occur during messaging operations.
///
/// Setup errors (configuration, connection, topology, registration) are
/// returned to the caller and abort startup. Runtime errors are published on
/// the error stream returned by [`crate::mq::Mq::error`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The configuration could not be read or parsed
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(TransportError),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(TransportError),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, TransportError),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, TransportError),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, TransportError),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`: {1}")]
    QoSDeclarationError(String, TransportError),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    BindingConsumerError(String, TransportError),

    /// A producer or consumer name is used twice
    #[error("{kind} with name `{name}` is already registered")]
    DuplicateRegistration { kind: EntityKind, name: String },

    /// Lookup of an unknown producer
    #[error("producer `{0}` is not registered, check your configuration")]
    ProducerNotFound(String),

    /// Lookup of an unknown consumer
    #[error("consumer `{0}` is not registered, check your configuration")]
    ConsumerNotFound(String),

    /// The producer mailbox can no longer accept messages
    #[error("producer `{0}` mailbox is closed")]
    MailboxClosed(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(TransportError),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(TransportError),

    /// Error closing a producer or worker channel
    #[error("failure to close channel: {0}")]
    CloseChannelError(TransportError),

    /// The connection was closed underneath us
    #[error("connection closed: {0}")]
    TransportClosed(TransportError),
}

impl AmqpError {
    /// The transport failure carried by this error, if any.
    pub fn transport(&self) -> Option<&TransportError> {
        match self {
            AmqpError::ConnectionError(err)
            | AmqpError::ChannelError(err)
            | AmqpError::DeclareExchangeError(_, err)
            | AmqpError::DeclareQueueError(_, err)
            | AmqpError::BindingExchangeToQueueError(_, _, err)
            | AmqpError::QoSDeclarationError(_, err)
            | AmqpError::BindingConsumerError(_, err)
            | AmqpError::PublishingError(err)
            | AmqpError::AckMessageError(err)
            | AmqpError::CloseChannelError(err)
            | AmqpError::TransportClosed(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this error should start a reconnect cycle.
    ///
    /// Closing a channel that already died with its connection is expected
    /// while stopping, so close failures are only reported.
    pub fn should_reconnect(&self) -> bool {
        if matches!(self, AmqpError::CloseChannelError(_)) {
            return false;
        }

        self.transport()
            .map(TransportError::is_recoverable)
            .unwrap_or(false)
    }

    /// Declaration and binding failures.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(..)
                | AmqpError::DeclareQueueError(..)
                | AmqpError::BindingExchangeToQueueError(..)
        )
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}

impl From<serde_yaml::Error> for AmqpError {
    fn from(err: serde_yaml::Error) -> Self {
        AmqpError::ConfigError(err.to_string())
    }
}
