// Copyright 2025 Cowboy AI, LLC.

//! Handler trait for integration events

use async_trait::async_trait;

use crate::events::IntegrationEvent;

/// Trait for handling one concrete integration event type
///
/// Handlers are registered as types; the bus resolves an instance from a
/// fresh container scope for every delivery.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    /// Handle a delivered integration event
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}
