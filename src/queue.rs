// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue definitions declared by the topology. Every
//! queue in the configuration is declared and then bound to its exchange with
//! its routing key.

use crate::options::{ArgValue, Options};
use serde::Deserialize;

/// Argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a queue and of its binding, as described by the `queues`
/// configuration section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub binding_options: Options,
    #[serde(default)]
    pub options: Options,
}

impl QueueDefinition {
    /// Creates a durable queue definition bound to the default exchange.
    ///
    /// # Parameters
    /// * `name` - The queue name
    ///
    /// # Returns
    /// A definition without binding and with default options
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Binds the queue to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `exchange` - Exchange to bind to; empty keeps the default exchange and
    ///   skips the binding
    /// * `routing_key` - Binding key, with `*` and `#` wildcards on topic
    ///   exchanges
    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    /// Options of the queue declaration.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Options of the binding, used only when an exchange is set.
    pub fn binding_options(mut self, options: Options) -> Self {
        self.binding_options = options;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// # Parameters
    /// * `ttl` - Time in milliseconds, stored as `x-message-ttl`
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.options = self
            .options
            .arg(AMQP_HEADERS_MESSAGE_TTL, ArgValue::Int32(ttl));
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.options = self
            .options
            .arg(AMQP_HEADERS_MAX_LENGTH, ArgValue::Int32(max));
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.options = self
            .options
            .arg(AMQP_HEADERS_MAX_LENGTH_BYTES, ArgValue::Int32(max_bytes));
        self
    }

    /// Turns the queue into a priority queue.
    ///
    /// # Parameters
    /// * `max` - Highest priority, stored as a 64-bit `x-max-priority`
    pub fn max_priority(mut self, max: i64) -> Self {
        self.options = self
            .options
            .arg(crate::options::AMQP_ARGS_MAX_PRIORITY, ArgValue::Int64(max));
        self
    }

    /// The binding of this queue to its exchange.
    pub fn binding(&self) -> QueueBinding<'_> {
        QueueBinding {
            queue_name: &self.name,
            exchange_name: &self.exchange,
            routing_key: &self.routing_key,
            options: &self.binding_options,
        }
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, Copy)]
pub struct QueueBinding<'qeb> {
    pub queue_name: &'qeb str,
    pub exchange_name: &'qeb str,
    pub routing_key: &'qeb str,
    pub options: &'qeb Options,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_queue_with_binding() {
        let def: QueueDefinition = serde_json::from_value(json!({
            "exchange": "orders",
            "name": "orders_q",
            "routing_key": "order.created",
            "binding_options": {"no_wait": true},
            "options": {"exclusive": true, "args": {"x-max-priority": 10.0}}
        }))
        .unwrap();

        let binding = def.binding();
        assert_eq!(binding.queue_name, "orders_q");
        assert_eq!(binding.exchange_name, "orders");
        assert_eq!(binding.routing_key, "order.created");
        assert!(binding.options.no_wait);
        assert!(def.options.exclusive);
        assert_eq!(
            def.options.args.unwrap()["x-max-priority"],
            ArgValue::Int64(10)
        );
    }

    #[test]
    fn typed_helpers_fill_the_args_table() {
        let def = QueueDefinition::new("jobs")
            .ttl(30_000)
            .max_length(100)
            .max_priority(5);

        let args = def.options.args.unwrap();
        assert_eq!(args[AMQP_HEADERS_MESSAGE_TTL], ArgValue::Int32(30_000));
        assert_eq!(args[AMQP_HEADERS_MAX_LENGTH], ArgValue::Int32(100));
        assert_eq!(args["x-max-priority"], ArgValue::Int64(5));
    }
}
