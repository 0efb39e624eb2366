// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The messaging layer never talks to a broker client library directly. It
//! drives the traits in this module, which mirror the primitives every AMQP
//! client offers: dial a connection, open channels on it, declare topology,
//! consume and publish, and get notified when the connection dies.
//!
//! [`crate::channel::LapinTransport`] binds these traits to `lapin`;
//! [`crate::testing::MemoryTransport`] is an in-process double.

use crate::{errors::TransportError, exchange::ExchangeKind, options::Options};
use async_trait::async_trait;
use futures_util::stream::Stream;
use std::{collections::BTreeMap, fmt, pin::Pin, sync::Arc};
use tokio::sync::oneshot;

/// Stream of inbound deliveries for one consume call.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Message headers carried alongside a payload.
pub type Headers = BTreeMap<String, String>;

/// Entry point of a transport: dials connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Resolves with the error that closed the connection.
    ///
    /// The sender is dropped without a value when the connection is closed on
    /// purpose.
    fn notify_close(&self) -> oneshot::Receiver<TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// An AMQP channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Channel: Send + Sync {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &Options,
    ) -> Result<(), TransportError>;

    async fn queue_declare(&self, name: &str, options: &Options) -> Result<(), TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: &Options,
    ) -> Result<(), TransportError>;

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &Options,
    ) -> Result<DeliveryStream, TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
}

/// An outbound message with its publish properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub content_type: String,
    pub delivery_mode: u8,
    pub message_id: String,
    pub headers: Headers,
}

/// One inbound message.
///
/// A delivery without an acknowledger is how a transport reports that the
/// underlying consume stream was closed by the broker.
pub struct Delivery {
    pub data: Vec<u8>,
    pub headers: Headers,
    pub acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(data: Vec<u8>, headers: Headers, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            data,
            headers,
            acker: Some(acker),
        }
    }

    /// A delivery that signals the end of the consume stream.
    pub fn closed() -> Self {
        Delivery {
            data: vec![],
            headers: Headers::default(),
            acker: None,
        }
    }

    pub fn is_acknowledgeable(&self) -> bool {
        self.acker.is_some()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("data", &self.data)
            .field("headers", &self.headers)
            .field("acknowledgeable", &self.is_acknowledgeable())
            .finish()
    }
}
