// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism of the broker: they decide how
//! published messages are distributed to queues. This module defines the
//! supported exchange types and the owned definition the topology declares.

use crate::options::{ArgValue, Options};
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in the broker.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    /// The type name sent to the broker.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => "x-delayed-message",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            "x-delayed-message" => Ok(ExchangeKind::XMessageDelayed),
            other => Err(format!("unsupported exchange type `{}`", other)),
        }
    }
}

impl TryFrom<String> for ExchangeKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of an exchange as described by the `exchanges` configuration
/// section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub options: Options,
}

impl ExchangeDefinition {
    /// Creates a durable direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    ///
    /// # Returns
    /// A definition with default options, to refine with the builder methods
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            options: Options::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Creates a delayed exchange routing like `kind` once the delay expires.
    ///
    /// This requires the x-delayed-message plugin on the broker.
    ///
    /// # Parameters
    /// * `kind` - Routing applied once the delay expires, stored in the
    ///   `x-delayed-type` argument
    pub fn delayed(mut self, kind: ExchangeKind) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.options = self.options.arg(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE,
            ArgValue::Str(kind.as_str().to_owned()),
        );
        self
    }
}
