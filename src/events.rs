// Copyright 2025 Cowboy AI, LLC.

//! Integration events
//!
//! Integration events are immutable facts published to other services through
//! the bus. Each concrete event type carries an [`EventMetadata`] (generated id
//! and creation timestamp) and is routed by its simple type name.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and creation time shared by every integration event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Unique event identifier
    pub id: Uuid,
    /// When the event was created
    pub creation_date: DateTime<Utc>,
}

impl EventMetadata {
    /// Create metadata for an event occurring now
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
        }
    }

    /// Rebuild metadata from known values
    pub fn from_parts(id: Uuid, creation_date: DateTime<Utc>) -> Self {
        Self { id, creation_date }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Base trait for all integration events
///
/// The event name used as routing key defaults to the simple name of the
/// implementing type.
///
/// # Examples
///
/// ```rust
/// use cim_event_bus::{EventMetadata, IntegrationEvent};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// struct ConfirmationCodeIssued {
///     metadata: EventMetadata,
///     email: String,
///     code: String,
/// }
///
/// impl IntegrationEvent for ConfirmationCodeIssued {
///     fn metadata(&self) -> &EventMetadata {
///         &self.metadata
///     }
/// }
///
/// assert_eq!(ConfirmationCodeIssued::event_name(), "ConfirmationCodeIssued");
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity and creation time of this event
    fn metadata(&self) -> &EventMetadata;

    /// Unique id of this event
    fn id(&self) -> Uuid {
        self.metadata().id
    }

    /// Creation timestamp of this event
    fn creation_date(&self) -> DateTime<Utc> {
        self.metadata().creation_date
    }

    /// Name used as routing key and registry key
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        simple_type_name::<Self>()
    }
}

/// Simple (unqualified, generic-free) name of a type
///
/// `my_app::events::OrderPlaced` becomes `OrderPlaced` and
/// `my_app::Wrapper<my_app::Inner>` becomes `Wrapper`.
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = match full.find('<') {
        Some(index) => &full[..index],
        None => full,
    };
    match without_generics.rfind("::") {
        Some(index) => &without_generics[index + 2..],
        None => without_generics,
    }
}
