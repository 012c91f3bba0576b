// Copyright 2025 Cowboy AI, LLC.

//! Dependency injection for integration event handlers
//!
//! The host application registers handler types (and whatever they depend on)
//! in a [`ServiceContainer`]. The event bus opens a [`ServiceScope`] for every
//! handler invocation and resolves the handler from it; scoped services live
//! exactly as long as that scope.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by the service container
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContainerError {
    /// Nothing is registered for the requested type
    #[error("Service of type {0} not registered")]
    NotRegistered(&'static str),

    /// The type already has a registration
    #[error("Service of type {0} already registered")]
    AlreadyRegistered(&'static str),

    /// The registered factory failed
    #[error("Factory for {service} failed: {reason}")]
    FactoryFailed {
        /// Type the factory builds
        service: &'static str,
        /// Failure reported by the factory
        reason: String,
    },
}

/// Service lifetime management
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceLifetime {
    /// New instance for each request
    Transient,

    /// New instance for each scope
    Scoped,

    /// Single instance for application lifetime
    Singleton,
}

/// Builds a service, resolving its dependencies from the given scope
pub type Factory<T> = Arc<
    dyn for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>> + Send + Sync,
>;

struct Registration<T> {
    lifetime: ServiceLifetime,
    factory: Option<Factory<T>>,
    singleton: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> Clone for Registration<T> {
    fn clone(&self) -> Self {
        Self {
            lifetime: self.lifetime,
            factory: self.factory.clone(),
            singleton: self.singleton.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Registration<T> {
    async fn build(&self, scope: &ServiceScope) -> Result<Arc<T>, ContainerError> {
        match &self.factory {
            Some(factory) => factory(scope).await.map(Arc::new),
            None => Err(ContainerError::NotRegistered(type_name::<T>())),
        }
    }
}

type Registrations = Arc<RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>;

/// Dependency injection container
#[derive(Clone, Default)]
pub struct ServiceContainer {
    registrations: Registrations,
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContainer").finish_non_exhaustive()
    }
}

impl ServiceContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    async fn register<T: Send + Sync + 'static>(
        &self,
        registration: Registration<T>,
    ) -> Result<(), ContainerError> {
        let mut registrations = self.registrations.write().await;
        let type_id = TypeId::of::<T>();

        if registrations.contains_key(&type_id) {
            return Err(ContainerError::AlreadyRegistered(type_name::<T>()));
        }

        registrations.insert(type_id, Box::new(registration));
        Ok(())
    }

    /// Register an existing instance as a singleton
    pub async fn register_instance<T: Send + Sync + 'static>(
        &self,
        service: T,
    ) -> Result<(), ContainerError> {
        self.register(Registration::<T> {
            lifetime: ServiceLifetime::Singleton,
            factory: None,
            singleton: Arc::new(RwLock::new(Some(Arc::new(service)))),
        })
        .await
    }

    /// Register a factory with the given lifetime
    pub async fn register_factory<T, F>(
        &self,
        lifetime: ServiceLifetime,
        factory: F,
    ) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register(Registration::<T> {
            lifetime,
            factory: Some(Arc::new(factory)),
            singleton: Arc::new(RwLock::new(None)),
        })
        .await
    }

    /// Register a factory that builds a new instance for each resolution
    pub async fn register_transient<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_factory(ServiceLifetime::Transient, factory)
            .await
    }

    /// Register a factory that builds one instance per scope
    pub async fn register_scoped<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_factory(ServiceLifetime::Scoped, factory).await
    }

    /// Register a factory that builds a single shared instance on first use
    pub async fn register_singleton<T, F>(&self, factory: F) -> Result<(), ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_factory(ServiceLifetime::Singleton, factory)
            .await
    }

    /// Check whether a type has a registration
    pub async fn is_registered<T: 'static>(&self) -> bool {
        self.registrations
            .read()
            .await
            .contains_key(&TypeId::of::<T>())
    }

    /// Resolve a service outside any explicit scope
    pub async fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.create_scope().resolve::<T>().await
    }

    /// Create a scope; scoped services are cached in it and dropped with it
    pub fn create_scope(&self) -> ServiceScope {
        ServiceScope {
            registrations: self.registrations.clone(),
            scoped: RwLock::new(HashMap::new()),
        }
    }
}

/// Resolution scope, one per handler invocation
pub struct ServiceScope {
    registrations: Registrations,
    scoped: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceScope {
    /// Resolve a service within this scope
    pub async fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        let registration = {
            let registrations = self.registrations.read().await;
            registrations
                .get(&TypeId::of::<T>())
                .and_then(|entry| entry.downcast_ref::<Registration<T>>())
                .cloned()
        }
        .ok_or(ContainerError::NotRegistered(type_name::<T>()))?;

        match registration.lifetime {
            ServiceLifetime::Transient => registration.build(self).await,
            ServiceLifetime::Singleton => {
                let read_lock = registration.singleton.read().await;
                if let Some(instance) = read_lock.as_ref() {
                    return Ok(instance.clone());
                }
                drop(read_lock);

                let mut write_lock = registration.singleton.write().await;
                if let Some(instance) = write_lock.as_ref() {
                    return Ok(instance.clone());
                }

                let instance = registration.build(self).await?;
                *write_lock = Some(instance.clone());
                Ok(instance)
            }
            ServiceLifetime::Scoped => {
                let type_id = TypeId::of::<T>();
                if let Some(instance) = self.cached::<T>(type_id).await {
                    return Ok(instance);
                }

                // The cache lock is not held while the factory runs.
                let built = registration.build(self).await?;

                let mut scoped = self.scoped.write().await;
                if let Some(existing) = scoped.get(&type_id).cloned() {
                    if let Ok(instance) = existing.downcast::<T>() {
                        return Ok(instance);
                    }
                }
                scoped.insert(type_id, built.clone());
                Ok(built)
            }
        }
    }

    async fn cached<T: Send + Sync + 'static>(&self, type_id: TypeId) -> Option<Arc<T>> {
        let existing = self.scoped.read().await.get(&type_id).cloned()?;
        existing.downcast::<T>().ok()
    }
}

/// Builder for configuring dependency injection
#[derive(Default)]
pub struct ContainerBuilder {
    container: ServiceContainer,
}

impl ContainerBuilder {
    /// Start with an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing instance
    pub async fn add_instance<T: Send + Sync + 'static>(
        self,
        service: T,
    ) -> Result<Self, ContainerError> {
        self.container.register_instance(service).await?;
        Ok(self)
    }

    /// Add a transient factory
    pub async fn add_transient<T, F>(self, factory: F) -> Result<Self, ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.container.register_transient(factory).await?;
        Ok(self)
    }

    /// Add a scoped factory
    pub async fn add_scoped<T, F>(self, factory: F) -> Result<Self, ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.container.register_scoped(factory).await?;
        Ok(self)
    }

    /// Add a singleton factory
    pub async fn add_singleton<T, F>(self, factory: F) -> Result<Self, ContainerError>
    where
        T: Send + Sync + 'static,
        F: for<'a> Fn(&'a ServiceScope) -> BoxFuture<'a, Result<T, ContainerError>>
            + Send
            + Sync
            + 'static,
    {
        self.container.register_singleton(factory).await?;
        Ok(self)
    }

    /// Finish configuration
    pub fn build(self) -> ServiceContainer {
        self.container
    }
}
