// Copyright 2025 Cowboy AI, LLC.

//! Event bus configuration

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Exchange used when none is configured
pub const DEFAULT_EXCHANGE_NAME: &str = "cim_event_bus";

/// Configuration for an [`EventBus`](crate::EventBus)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Exchange identifying the logical bus
    pub exchange_name: String,

    /// Queue this bus instance consumes from, must not be blank
    pub queue_name: String,

    /// Retry policy for connect and publish
    pub retry: RetryPolicy,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            exchange_name: DEFAULT_EXCHANGE_NAME.to_string(),
            queue_name: String::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EventBusConfig {
    /// Configuration for a queue on the default exchange
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    /// Use a different exchange
    pub fn with_exchange(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    /// Use a different retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builder() {
        let config = EventBusConfig::new("identity")
            .with_exchange("marketplace")
            .with_retry(RetryPolicy::new(2, Duration::from_millis(10)));

        assert_eq!(config.queue_name, "identity");
        assert_eq!(config.exchange_name, "marketplace");
        assert_eq!(config.retry.retry_count, 2);
        assert_eq!(config.retry.base_delay_ms, 10);
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let config: EventBusConfig =
            serde_json::from_str(r#"{"queue_name": "payments"}"#).unwrap();
        assert_eq!(config.exchange_name, DEFAULT_EXCHANGE_NAME);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
