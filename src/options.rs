// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Entity Options
//!
//! Exchanges, queues, bindings, producers and consumers all carry a free-form
//! `options` map in the configuration. This module decodes such a map once,
//! at load time, into the typed [`Options`] table:
//!
//! - keys are canonicalized from `snake_case` to `camelCase`
//!   (`auto_delete` and `autoDelete` are the same option),
//! - unset options take their value from a fixed default table,
//! - the `args` sub-map is kept open but its values are narrowed to
//!   [`ArgValue`], coercing numbers to the integer widths the broker expects.

use crate::errors::AmqpError;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Default content type for published messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Non persistent delivery mode
pub const DEFAULT_DELIVERY_MODE: u8 = 1;
/// The only argument the broker expects as a 64 bit integer
pub const AMQP_ARGS_MAX_PRIORITY: &str = "x-max-priority";

const KEY_ARGS: &str = "args";
const KEY_AUTO_DELETE: &str = "autoDelete";
const KEY_CONTENT_TYPE: &str = "contentType";
const KEY_DELIVERY_MODE: &str = "deliveryMode";
const KEY_DURABLE: &str = "durable";
const KEY_EXCLUSIVE: &str = "exclusive";
const KEY_INTERNAL: &str = "internal";
const KEY_NO_ACK: &str = "noAck";
const KEY_NO_LOCAL: &str = "noLocal";
const KEY_NO_WAIT: &str = "noWait";

/// Raw, not yet normalized options as they appear in the configuration.
pub type RawOptions = Map<String, Value>;

/// Normalized `args` table.
pub type Arguments = BTreeMap<String, ArgValue>;

/// A value of the `args` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Str(String),
}

/// Normalized option table shared by every entity kind.
///
/// Each broker operation reads only the fields it understands, e.g. an exchange
/// declaration reads `durable`, `auto_delete`, `internal`, `no_wait` and `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub no_ack: bool,
    pub no_local: bool,
    pub delivery_mode: u8,
    pub content_type: String,
    pub args: Option<Arguments>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            durable: true,
            auto_delete: false,
            internal: false,
            exclusive: false,
            no_wait: false,
            no_ack: false,
            no_local: false,
            delivery_mode: DEFAULT_DELIVERY_MODE,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            args: None,
        }
    }
}

impl Options {
    /// Normalizes a raw option map.
    ///
    /// Unknown keys are ignored with a warning; a known key holding a value of
    /// the wrong type is a configuration error.
    pub fn from_raw(raw: &RawOptions) -> Result<Options, AmqpError> {
        let mut options = Options::default();

        for (key, value) in normalize_keys(raw) {
            match key.as_str() {
                KEY_DURABLE => options.durable = as_bool(&key, &value)?,
                KEY_AUTO_DELETE => options.auto_delete = as_bool(&key, &value)?,
                KEY_INTERNAL => options.internal = as_bool(&key, &value)?,
                KEY_EXCLUSIVE => options.exclusive = as_bool(&key, &value)?,
                KEY_NO_WAIT => options.no_wait = as_bool(&key, &value)?,
                KEY_NO_ACK => options.no_ack = as_bool(&key, &value)?,
                KEY_NO_LOCAL => options.no_local = as_bool(&key, &value)?,
                KEY_DELIVERY_MODE => {
                    options.delivery_mode = value
                        .as_u64()
                        .and_then(|mode| u8::try_from(mode).ok())
                        .ok_or_else(|| invalid(&key, "a small unsigned integer"))?
                }
                KEY_CONTENT_TYPE => {
                    options.content_type = value
                        .as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| invalid(&key, "a string"))?
                }
                KEY_ARGS => options.args = Some(build_args(&value)?),
                _ => warn!(option = key.as_str(), "ignoring unknown option"),
            }
        }

        Ok(options)
    }

    /// Adds one argument, creating the table when needed.
    pub fn arg(mut self, key: &str, value: ArgValue) -> Self {
        self.args
            .get_or_insert_with(Arguments::default)
            .insert(key.to_owned(), value);
        self
    }
}

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<RawOptions>::deserialize(deserializer)?.unwrap_or_default();
        Options::from_raw(&raw).map_err(serde::de::Error::custom)
    }
}

/// Converts a `snake_case` key to `camelCase`, dropping spaces.
///
/// Keys that are already camel cased are returned unchanged.
pub fn camel_case(key: &str) -> String {
    let compact: String = key.chars().filter(|c| *c != ' ').collect();

    let mut out = String::with_capacity(compact.len());
    for (i, part) in compact.split('_').enumerate() {
        if i == 0 {
            out.push_str(part);
            continue;
        }

        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }

    out
}

/// Returns a copy of `raw` with every top level key camel cased.
pub fn normalize_keys(raw: &RawOptions) -> RawOptions {
    raw.iter()
        .map(|(key, value)| (camel_case(key), value.clone()))
        .collect()
}

/// Builds the canonical `args` table.
///
/// The table may be written either as a map or as a list of `[key, value]`
/// pairs.
pub fn build_args(value: &Value) -> Result<Arguments, AmqpError> {
    let mut args = Arguments::new();

    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                args.insert(key.clone(), coerce_arg(key, value)?);
            }
        }
        Value::Array(pairs) => {
            for pair in pairs {
                let (key, value) = match pair.as_array().map(Vec::as_slice) {
                    Some([Value::String(key), value]) => (key, value),
                    _ => {
                        return Err(AmqpError::ConfigError(
                            "args entries must be [key, value] pairs".to_owned(),
                        ))
                    }
                };
                args.insert(key.clone(), coerce_arg(key, value)?);
            }
        }
        _ => return Err(invalid(KEY_ARGS, "a map or a list of pairs")),
    }

    Ok(args)
}

fn coerce_arg(key: &str, value: &Value) -> Result<ArgValue, AmqpError> {
    match value {
        Value::Bool(b) => Ok(ArgValue::Bool(*b)),
        Value::String(s) => Ok(ArgValue::Str(s.clone())),
        Value::Number(number) => {
            let int = match number.as_i64() {
                Some(int) => int,
                None => number
                    .as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                    .map(|f| f as i64)
                    .ok_or_else(|| invalid(key, "an integer value"))?,
            };

            if key == AMQP_ARGS_MAX_PRIORITY {
                return Ok(ArgValue::Int64(int));
            }

            // values outside the 32 bit range are kept lossless
            Ok(i32::try_from(int)
                .map(ArgValue::Int32)
                .unwrap_or(ArgValue::Int64(int)))
        }
        _ => Err(invalid(key, "a boolean, a number or a string")),
    }
}

fn as_bool(key: &str, value: &Value) -> Result<bool, AmqpError> {
    value.as_bool().ok_or_else(|| invalid(key, "a boolean"))
}

fn invalid(key: &str, expected: &str) -> AmqpError {
    AmqpError::ConfigError(format!("option `{}` must be {}", key, expected))
}
