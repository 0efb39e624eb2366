// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Binds the transport traits to `lapin`. Connections report unexpected
//! closes through `on_error`, consume streams end with a closed delivery when
//! lapin reports a consumer error, and lapin errors are mapped into
//! [`TransportError`] so the supervisor can classify them.

use crate::{
    errors::TransportError,
    exchange::ExchangeKind,
    options::{ArgValue, Arguments, Options},
    transport::{self, Acknowledger, DeliveryStream, Headers, Publishing, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ConnectionProperties,
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with `lapin`.
///
/// Every dial opens a fresh `lapin::Connection`; the supervisor dials again on
/// each reconnect.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new() -> Self {
        LapinTransport::default()
    }

    /// Sets the connection name shown in the broker management UI.
    ///
    /// # Parameters
    /// * `name` - Sent as the `connection_name` client property
    ///
    /// # Returns
    /// The transport, for chaining
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, dsn: &str) -> Result<Arc<dyn transport::Connection>, TransportError> {
        debug!("creating amqp connection...");
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let conn = lapin::Connection::connect(dsn, properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                map_error(&err)
            })?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection::new(conn)))
    }
}

/// Close notification armed when the connection is created, so an error
/// raised before anyone subscribes is kept until they do.
struct CloseNotifier {
    tx: Mutex<Option<oneshot::Sender<TransportError>>>,
    rx: Mutex<Option<oneshot::Receiver<TransportError>>>,
}

impl CloseNotifier {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        CloseNotifier {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Sends `err` once; later errors are dropped.
    fn notify(&self, err: TransportError) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(err);
        }
    }

    /// Hands out the receiver. Only the first caller is notified, later ones
    /// get a receiver that resolves as a purposeful close.
    fn subscribe(&self) -> oneshot::Receiver<TransportError> {
        match self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(rx) => rx,
            None => oneshot::channel().1,
        }
    }

    /// Drops the sender without a value.
    fn disarm(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// A `lapin` connection.
pub struct LapinConnection {
    conn: lapin::Connection,
    notifier: Arc<CloseNotifier>,
}

impl LapinConnection {
    fn new(conn: lapin::Connection) -> Self {
        let notifier = Arc::new(CloseNotifier::new());

        let on_error = notifier.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection closed");
            on_error.notify(map_error(&err));
        });

        LapinConnection { conn, notifier }
    }
}

#[async_trait]
impl transport::Connection for LapinConnection {
    async fn channel(&self) -> Result<Arc<dyn transport::Channel>, TransportError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_error(&err))
            }
        }
    }

    fn notify_close(&self) -> oneshot::Receiver<TransportError> {
        self.notifier.subscribe()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.notifier.disarm();

        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| map_error(&err))
    }
}

/// A `lapin` channel.
pub struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl transport::Channel for LapinChannel {
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &Options,
    ) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                name,
                kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: options.no_wait,
                },
                field_table(options.args.as_ref()),
            )
            .await
            .map_err(|err| map_error(&err))
    }

    async fn queue_declare(&self, name: &str, options: &Options) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                },
                field_table(options.args.as_ref()),
            )
            .await
            .map(|_| ())
            .map_err(|err| map_error(&err))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: &Options,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions {
                    nowait: options.no_wait,
                },
                field_table(options.args.as_ref()),
            )
            .await
            .map_err(|err| map_error(&err))
    }

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), TransportError> {
        if prefetch_size > 0 {
            debug!(prefetch_size, "prefetch size is not supported by the broker client, ignoring");
        }

        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| map_error(&err))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &Options,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                field_table(options.args.as_ref()),
            )
            .await
            .map_err(|err| map_error(&err))?;

        Ok(Box::pin(consumer.map(|delivery| match delivery {
            Ok(delivery) => transport::Delivery::new(
                delivery.data,
                headers(&delivery.properties),
                Box::new(LapinAcker(delivery.acker)),
            ),
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                transport::Delivery::closed()
            }
        })))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: Publishing,
    ) -> Result<(), TransportError> {
        let headers: FieldTable = message
            .headers
            .into_iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                )
            })
            .collect::<std::collections::BTreeMap<_, _>>()
            .into();

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_delivery_mode(message.delivery_mode)
            .with_message_id(ShortString::from(message.message_id))
            .with_headers(headers);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                &message.body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| map_error(&err))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| map_error(&err))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| map_error(&err))
    }
}

fn field_table(args: Option<&Arguments>) -> FieldTable {
    let mut table = FieldTable::default();

    for (key, value) in args.into_iter().flatten() {
        let value = match value {
            ArgValue::Bool(v) => AMQPValue::Boolean(*v),
            ArgValue::Int32(v) => AMQPValue::LongInt(*v),
            ArgValue::Int64(v) => AMQPValue::LongLongInt(*v),
            ArgValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }

    table
}

fn headers(props: &BasicProperties) -> Headers {
    let Some(table) = props.headers() else {
        return Headers::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .ok()
                .map(|value| (key.as_str().to_owned(), value.to_owned())),
            AMQPValue::ShortString(value) => Some((key.as_str().to_owned(), value.as_str().to_owned())),
            _ => None,
        })
        .collect()
}

/// Socket level failures are network errors, broker replies are server
/// initiated protocol errors, everything else comes from the client side.
fn map_error(err: &lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(_) | lapin::Error::MissingHeartbeatError => {
            TransportError::Network(err.to_string())
        }
        lapin::Error::ProtocolError(_) => TransportError::Protocol {
            reason: err.to_string(),
            server: true,
        },
        _ => TransportError::Protocol {
            reason: err.to_string(),
            server: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_become_typed_field_values() {
        let args = Arguments::from([
            ("x-max-priority".to_owned(), ArgValue::Int64(5)),
            ("x-message-ttl".to_owned(), ArgValue::Int32(1000)),
            ("x-single-active-consumer".to_owned(), ArgValue::Bool(true)),
            ("x-delayed-type".to_owned(), ArgValue::Str("direct".into())),
        ]);

        let table = field_table(Some(&args));
        let inner = table.inner();

        assert_eq!(inner.get("x-max-priority"), Some(&AMQPValue::LongLongInt(5)));
        assert_eq!(inner.get("x-message-ttl"), Some(&AMQPValue::LongInt(1000)));
        assert_eq!(inner.get("x-single-active-consumer"), Some(&AMQPValue::Boolean(true)));
        assert_eq!(
            inner.get("x-delayed-type"),
            Some(&AMQPValue::LongString(LongString::from("direct")))
        );
        assert!(field_table(None).inner().is_empty());
    }

    #[test]
    fn string_headers_are_extracted() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        table.insert(ShortString::from("x-retries"), AMQPValue::LongInt(3));

        let props = BasicProperties::default().with_headers(table);
        let headers = headers(&props);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["traceparent"], "00-abc-def-01");
    }

    #[test]
    fn close_before_subscribing_is_kept() {
        let notifier = CloseNotifier::new();
        notifier.notify(TransportError::Network("reset".into()));
        notifier.notify(TransportError::Network("second".into()));

        let mut closed = notifier.subscribe();
        assert_eq!(closed.try_recv(), Ok(TransportError::Network("reset".into())));
        assert!(notifier.subscribe().try_recv().is_err());
    }

    #[test]
    fn disarmed_notifier_reports_a_purposeful_close() {
        let notifier = CloseNotifier::new();
        let mut closed = notifier.subscribe();

        notifier.disarm();
        notifier.notify(TransportError::Network("reset".into()));
        assert_eq!(closed.try_recv(), Err(oneshot::error::TryRecvError::Closed));
    }

    #[test]
    fn heartbeat_loss_is_a_network_failure() {
        assert!(map_error(&lapin::Error::MissingHeartbeatError).is_recoverable());
        assert!(matches!(
            map_error(&lapin::Error::ChannelsLimitReached),
            TransportError::Protocol { server: false, .. }
        ));
    }
}
