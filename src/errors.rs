// Copyright 2025 Cowboy AI, LLC.

//! Error types for event bus operations

use thiserror::Error;

use crate::codec::CodecError;
use crate::infrastructure::persistent_connection::ConnectionError;
use crate::infrastructure::transport::TransportError;
use crate::subscriptions::RegistryError;

/// Errors surfaced to callers of the event bus
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The configured queue name is empty
    #[error("Invalid queue name: {0:?}")]
    InvalidQueueName(String),

    /// No broker connection could be established
    #[error("Broker connection unavailable")]
    ConnectionUnavailable,

    /// The broker kept failing after every retry
    #[error("Broker unreachable after {attempts} attempts: {reason}")]
    BrokerUnreachable {
        /// Number of send attempts made
        attempts: u32,
        /// Last transport failure
        reason: String,
    },

    /// Event payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),

    /// Subscription bookkeeping rejected the operation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Non-transient transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The bus has been closed
    #[error("Event bus is closed")]
    Closed,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

impl From<ConnectionError> for EventBusError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Unavailable | ConnectionError::Disposed => {
                EventBusError::ConnectionUnavailable
            }
            ConnectionError::Transport(err) => EventBusError::Transport(err),
        }
    }
}

impl EventBusError {
    /// Check if this error stems from the broker being out of reach
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            EventBusError::ConnectionUnavailable | EventBusError::BrokerUnreachable { .. }
        )
    }

    /// Check if this error is a programming or configuration mistake
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            EventBusError::InvalidQueueName(_)
                | EventBusError::Registry(RegistryError::DuplicateSubscription { .. })
                | EventBusError::Registry(RegistryError::EventNameConflict { .. })
        )
    }
}
