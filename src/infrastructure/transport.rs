// Copyright 2025 Cowboy AI, LLC.

//! Broker transport abstraction
//!
//! The bus talks to a message broker through three traits: a connector that
//! opens physical connections, a connection that multiplexes logical channels
//! and reports disruptive signals, and a channel that declares topology,
//! publishes and consumes. Adapters live next to this module.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::retry::Transient;

/// Errors raised by broker adapters
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker could not be reached
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Socket level failure on an established link
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The channel was closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The broker rejected the operation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials were rejected
    #[error("Access refused: {0}")]
    AccessRefused(String),
}

impl Transient for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Io(_))
    }
}

/// Disruptive condition reported by a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The connection shut down
    Shutdown,
    /// The broker is throttling the connection
    Blocked,
    /// A client callback failed
    CallbackException,
}

/// Message handed to [`BrokerChannel::publish`]
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Exchange to publish to
    pub exchange: String,
    /// Routing key, the event name
    pub routing_key: String,
    /// Encoded body
    pub body: Bytes,
    /// Survive broker restarts
    pub persistent: bool,
    /// Report the message back when no queue is bound for it
    pub mandatory: bool,
}

/// Broker verdict on a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted and routed to at least one queue
    Routed,
    /// Mandatory message with no matching binding
    Returned,
}

/// Acknowledges one delivery back to the broker
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Remove the delivery from its queue
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

/// Message received from a queue
pub struct Delivery {
    /// Routing key the message was published with
    pub routing_key: String,
    /// Raw body
    pub body: Bytes,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    /// Create a delivery with its acknowledgment handle
    pub fn new(routing_key: impl Into<String>, body: Bytes, acker: Box<dyn DeliveryAcker>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            acker,
        }
    }

    /// Split off the acknowledgment handle
    pub fn into_parts(self) -> (String, Bytes, Box<dyn DeliveryAcker>) {
        (self.routing_key, self.body, self.acker)
    }

    /// Acknowledge the delivery
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of deliveries from one queue
///
/// An `Err` item means the channel failed; the stream should be dropped and
/// consumption restarted on a fresh channel.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Logical channel multiplexed over a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare the exchange, idempotently
    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    /// Declare a durable queue on the exchange, idempotently
    async fn declare_queue(&self, exchange: &str, queue: &str) -> Result<(), TransportError>;

    /// Route messages with `routing_key` to `queue`
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Stop routing messages with `routing_key` to `queue`
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish a message
    async fn publish(&self, message: OutgoingMessage) -> Result<PublishOutcome, TransportError>;

    /// Start consuming a queue
    async fn consume(&self, exchange: &str, queue: &str) -> Result<DeliveryStream, TransportError>;

    /// Close the channel
    async fn close(&self) -> Result<(), TransportError>;
}

/// Physical broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is currently usable
    fn is_open(&self) -> bool;

    /// Open a new logical channel
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, TransportError>;

    /// Subscribe to disruptive signals
    fn signals(&self) -> broadcast::Receiver<ConnectionSignal>;

    /// Close the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for broker connections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a physical connection
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(TransportError::Unreachable("refused".into()), true)]
    #[test_case(TransportError::Io("reset".into()), true)]
    #[test_case(TransportError::ConnectionClosed, false)]
    #[test_case(TransportError::ChannelClosed, false)]
    #[test_case(TransportError::Protocol("no such stream".into()), false)]
    #[test_case(TransportError::AccessRefused("bad token".into()), false)]
    fn test_transient_classification(error: TransportError, transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }
}
