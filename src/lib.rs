// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # mqueue
//!
//! A resilient AMQP messaging layer. A declarative [`config::Config`] describes
//! the exchanges, queues, producers and consumers; [`mq::MessageQueue`] sets
//! them up on a broker connection and keeps them alive across connection
//! failures.

mod otel;
mod registry;
mod status;
mod supervisor;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod mq;
pub mod options;
pub mod publisher;
pub mod queue;
pub mod testing;
pub mod topology;
pub mod transport;

pub use config::{Config, ConsumerConfig, ProducerConfig, Settings};
pub use consumer::{Consumer, ConsumerHandler};
pub use errors::{AmqpError, TransportError};
pub use mq::{MessageQueue, Mq};
pub use publisher::Producer;
pub use status::RunState;
pub use supervisor::ERROR_STREAM_CAPACITY;
