// Copyright 2025 Cowboy AI, LLC.

//! Subscription registry properties

mod support;

use cim_event_bus::{EventNameRemoved, RegistryError, SubscriptionRegistry};
use pretty_assertions::assert_eq;
use support::*;
use test_case::test_case;
use tokio::sync::broadcast::error::TryRecvError;

#[test]
fn test_subscribe_then_has_subscriptions() {
    let registry = SubscriptionRegistry::new();
    registry
        .add_subscription::<OrderPlaced, ReserveStock>()
        .unwrap();

    assert!(registry.has_subscriptions_for_event("OrderPlaced"));
    assert!(!registry.is_empty());
    assert_eq!(registry.event_names(), vec!["OrderPlaced".to_string()]);

    let event_type = registry.event_type_by_name("OrderPlaced").unwrap();
    assert_eq!(event_type.name(), "OrderPlaced");
}

#[test]
fn test_second_identical_subscription_fails() {
    let registry = SubscriptionRegistry::new();
    registry
        .add_subscription::<OrderPlaced, ReserveStock>()
        .unwrap();

    let err = registry
        .add_subscription::<OrderPlaced, ReserveStock>()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Handler ReserveStock already registered for 'OrderPlaced'"
    );
}

#[test]
fn test_removing_last_subscription_notifies_once() {
    let registry = SubscriptionRegistry::new();
    let mut removals = registry.watch_removals();
    registry
        .add_subscription::<OrderPlaced, ReserveStock>()
        .unwrap();
    registry
        .add_subscription::<OrderPlaced, NotifyCustomer>()
        .unwrap();

    assert!(registry.remove_subscription::<OrderPlaced, ReserveStock>());
    assert_eq!(removals.try_recv(), Err(TryRecvError::Empty));

    assert!(registry.remove_subscription::<OrderPlaced, NotifyCustomer>());
    assert_eq!(
        removals.try_recv(),
        Ok(EventNameRemoved {
            event_name: "OrderPlaced".to_string()
        })
    );
    assert_eq!(removals.try_recv(), Err(TryRecvError::Empty));

    assert!(!registry.has_subscriptions_for_event("OrderPlaced"));
    assert!(registry.is_empty());
    assert_eq!(
        registry.event_type_by_name("OrderPlaced").err(),
        Some(RegistryError::EventTypeNotFound("OrderPlaced".to_string()))
    );
}

#[test_case("OrderPlaced" ; "known elsewhere but never subscribed")]
#[test_case("" ; "empty name")]
#[test_case("orderplaced" ; "different casing")]
fn test_unknown_name_has_no_handlers(event_name: &str) {
    let registry = SubscriptionRegistry::new();
    registry
        .add_subscription::<OrderShipped, TrackShipment>()
        .unwrap();

    assert!(registry.handlers_for_event(event_name).is_empty());
    assert!(!registry.has_subscriptions_for_event(event_name));
}

#[test]
fn test_handlers_are_listed_in_registration_order() {
    let registry = SubscriptionRegistry::new();
    registry
        .add_subscription::<OrderPlaced, NotifyCustomer>()
        .unwrap();
    registry
        .add_subscription::<OrderPlaced, RejectOrder>()
        .unwrap();
    registry
        .add_subscription::<OrderPlaced, ReserveStock>()
        .unwrap();

    let names: Vec<&str> = registry
        .handlers_for_event("OrderPlaced")
        .iter()
        .map(|s| s.handler_type().short_name())
        .collect();
    assert_eq!(names, vec!["NotifyCustomer", "RejectOrder", "ReserveStock"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mutation_keeps_invariants() {
    let registry = SubscriptionRegistry::new();
    let mut removals = registry.watch_removals();

    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    let _ = registry.add_subscription::<OrderPlaced, ReserveStock>();
                    let _ = registry.add_subscription::<OrderShipped, TrackShipment>();
                } else {
                    registry.remove_subscription::<OrderPlaced, ReserveStock>();
                    let _ = registry.handlers_for_event("OrderShipped");
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever the interleaving, a name is present iff it has a handler.
    for name in ["OrderPlaced", "OrderShipped"] {
        let handlers = registry.handlers_for_event(name);
        assert!(handlers.len() <= 1);
        assert_eq!(registry.has_subscriptions_for_event(name), !handlers.is_empty());
        assert_eq!(
            registry.event_type_by_name(name).is_ok(),
            !handlers.is_empty()
        );
    }

    while let Ok(removed) = removals.try_recv() {
        assert_eq!(removed.event_name, "OrderPlaced");
    }
}
