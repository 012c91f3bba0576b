// Copyright 2025 Cowboy AI, LLC.

//! Subscription registry
//!
//! In-memory bookkeeping of which handler types are subscribed to which event
//! names, plus the table used to turn an event name back into a concrete
//! payload type at delivery time. The registry performs no I/O.
//!
//! An event name is present if and only if at least one subscription exists
//! for it. Removing the last subscription of a name drops its event type and
//! publishes an [`EventNameRemoved`] notification to every watcher.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::codec::{self, CodecError};
use crate::event_handler::IntegrationEventHandler;
use crate::events::{simple_type_name, IntegrationEvent};
use crate::integration::{ContainerError, ServiceScope};

const REMOVAL_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by subscription bookkeeping
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The handler type is already subscribed to the event name
    #[error("Handler {handler} already registered for '{event_name}'")]
    DuplicateSubscription {
        /// Event name
        event_name: String,
        /// Handler type name
        handler: String,
    },

    /// No event type is known under the name
    #[error("No event type registered for '{0}'")]
    EventTypeNotFound(String),

    /// Two distinct Rust types share one event name
    #[error("Event name '{event_name}' already maps to {existing}, cannot map it to {requested}")]
    EventNameConflict {
        /// Event name
        event_name: String,
        /// Type already registered under the name
        existing: &'static str,
        /// Type that was rejected
        requested: &'static str,
    },
}

/// Notification that an event name lost its last subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNameRemoved {
    /// Event name that is no longer subscribed
    pub event_name: String,
}

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>, CodecError>;

fn decode_as<E: IntegrationEvent>(body: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
    let event: E = codec::decode(body)?;
    Ok(Box::new(event))
}

/// Concrete payload type registered under an event name
#[derive(Clone)]
pub struct EventType {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventType {
    /// Describe an integration event type
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::event_name(),
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// Event name used for routing
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Rust type id of the payload
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified Rust type name of the payload
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode a body into this payload type
    pub fn decode(&self, body: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
        (self.decode)(body)
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Handler invocation with the payload type erased
#[async_trait]
pub trait DynamicEventHandler: Send + Sync {
    /// Handle a payload produced by [`EventType::decode`]
    async fn handle_dynamic(&self, event: Box<dyn Any + Send>) -> anyhow::Result<()>;
}

struct TypedHandler<E, H> {
    handler: Arc<H>,
    _event: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, H> DynamicEventHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn handle_dynamic(&self, event: Box<dyn Any + Send>) -> anyhow::Result<()> {
        let event = event
            .downcast::<E>()
            .map_err(|_| anyhow::anyhow!("payload is not a {}", type_name::<E>()))?;
        self.handler.handle(*event).await
    }
}

#[async_trait]
trait HandlerActivator: Send + Sync {
    async fn activate(
        &self,
        scope: &ServiceScope,
    ) -> Result<Arc<dyn DynamicEventHandler>, ContainerError>;
}

struct ScopedActivator<E, H>(PhantomData<fn() -> (E, H)>);

#[async_trait]
impl<E, H> HandlerActivator for ScopedActivator<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn activate(
        &self,
        scope: &ServiceScope,
    ) -> Result<Arc<dyn DynamicEventHandler>, ContainerError> {
        let handler = scope.resolve::<H>().await?;
        Ok(Arc::new(TypedHandler::<E, H> {
            handler,
            _event: PhantomData,
        }))
    }
}

/// Handler type (not instance) subscribed to an event
#[derive(Clone)]
pub struct HandlerType {
    type_id: TypeId,
    type_name: &'static str,
    short_name: &'static str,
    activator: Arc<dyn HandlerActivator>,
}

impl HandlerType {
    /// Describe handler `H` for event `E`
    pub fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: type_name::<H>(),
            short_name: simple_type_name::<H>(),
            activator: Arc::new(ScopedActivator::<E, H>(PhantomData)),
        }
    }

    /// Rust type id of the handler
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified Rust type name of the handler
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Unqualified handler name, for logs
    pub fn short_name(&self) -> &'static str {
        self.short_name
    }

    /// Resolve a handler instance from a container scope
    pub async fn activate(
        &self,
        scope: &ServiceScope,
    ) -> Result<Arc<dyn DynamicEventHandler>, ContainerError> {
        self.activator.activate(scope).await
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerType").field(&self.type_name).finish()
    }
}

/// Subscription descriptor: an event name bound to a handler type
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    event_name: String,
    handler_type: HandlerType,
}

impl SubscriptionInfo {
    /// Event name of this subscription
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Handler type of this subscription
    pub fn handler_type(&self) -> &HandlerType {
        &self.handler_type
    }
}

impl PartialEq for SubscriptionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.event_name == other.event_name
            && self.handler_type.type_id == other.handler_type.type_id
    }
}

impl Eq for SubscriptionInfo {}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
    event_types: HashMap<String, EventType>,
}

/// Concurrent registry of event subscriptions
///
/// Clones share the same state.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    state: Arc<RwLock<RegistryState>>,
    removals: broadcast::Sender<EventNameRemoved>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("event_names", &self.event_names())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (removals, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            removals,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive a notification each time an event name loses its last subscription
    pub fn watch_removals(&self) -> broadcast::Receiver<EventNameRemoved> {
        self.removals.subscribe()
    }

    /// Subscribe handler `H` to event `E`
    pub fn add_subscription<E, H>(&self) -> Result<(), RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.add(EventType::of::<E>(), HandlerType::of::<E, H>())
    }

    /// Subscribe a described handler type to a described event type
    pub fn add(&self, event_type: EventType, handler_type: HandlerType) -> Result<(), RegistryError> {
        let event_name = event_type.name().to_string();
        let mut state = self.write();

        if let Some(existing) = state.event_types.get(&event_name) {
            if existing.type_id != event_type.type_id {
                return Err(RegistryError::EventNameConflict {
                    event_name,
                    existing: existing.type_name,
                    requested: event_type.type_name,
                });
            }
        }

        let duplicate = state.handlers.get(&event_name).is_some_and(|subscriptions| {
            subscriptions
                .iter()
                .any(|s| s.handler_type.type_id == handler_type.type_id)
        });
        if duplicate {
            return Err(RegistryError::DuplicateSubscription {
                event_name,
                handler: handler_type.short_name().to_string(),
            });
        }

        debug!(
            event_name = %event_name,
            handler = handler_type.short_name(),
            "Adding subscription"
        );

        state
            .handlers
            .entry(event_name.clone())
            .or_default()
            .push(SubscriptionInfo {
                event_name: event_name.clone(),
                handler_type,
            });
        state.event_types.entry(event_name).or_insert(event_type);
        Ok(())
    }

    /// Remove the subscription of handler `H` to event `E`
    ///
    /// Returns false when no such subscription exists.
    pub fn remove_subscription<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.remove(E::event_name(), TypeId::of::<H>())
    }

    /// Remove the subscription of a handler type id to an event name
    pub fn remove(&self, event_name: &str, handler_type_id: TypeId) -> bool {
        let name_removed = {
            let mut state = self.write();
            let Some(subscriptions) = state.handlers.get_mut(event_name) else {
                return false;
            };
            let Some(position) = subscriptions
                .iter()
                .position(|s| s.handler_type.type_id == handler_type_id)
            else {
                return false;
            };
            subscriptions.remove(position);

            if subscriptions.is_empty() {
                state.handlers.remove(event_name);
                state.event_types.remove(event_name);
                true
            } else {
                false
            }
        };

        if name_removed {
            debug!(event_name, "Event name has no subscriptions left");
            // No watchers is fine; the notification is informational then.
            let _ = self.removals.send(EventNameRemoved {
                event_name: event_name.to_string(),
            });
        }
        true
    }

    /// Snapshot of the subscriptions for an event name, empty when unknown
    pub fn handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo> {
        self.read()
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Check whether an event name has at least one subscription
    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.read().handlers.contains_key(event_name)
    }

    /// Resolve the payload type registered under an event name
    pub fn event_type_by_name(&self, event_name: &str) -> Result<EventType, RegistryError> {
        self.read()
            .event_types
            .get(event_name)
            .cloned()
            .ok_or_else(|| RegistryError::EventTypeNotFound(event_name.to_string()))
    }

    /// Check whether the registry holds no subscriptions at all
    pub fn is_empty(&self) -> bool {
        self.read().handlers.is_empty()
    }

    /// Sorted list of subscribed event names
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop every subscription without notifications
    pub fn clear(&self) {
        let mut state = self.write();
        state.handlers.clear();
        state.event_types.clear();
    }
}
