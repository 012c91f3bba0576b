// Copyright 2025 Cowboy AI, LLC.

//! Integration with the host application
//!
//! The host owns the dependency injection container in which integration
//! event handlers are registered; the bus only resolves from it.

pub mod dependency_injection;

pub use dependency_injection::{
    ContainerBuilder, ContainerError, ServiceContainer, ServiceLifetime, ServiceScope,
};
