//! Driver Registry
//!
//! Explicit registration table mapping protocol-type tags to driver
//! constructors, built once at process start. Adding a codec binding means
//! implementing `DriverFactory` and registering it in
//! `register_builtin_drivers`; the task manager never changes.

use std::sync::Arc;

use dashmap::DashMap;
use edgelink_model::Protocol;

use super::Driver;
use crate::error::{CollectError, Result};

/// Lowercase, separator-free form used as registry key
pub fn normalize_protocol_type(tag: &str) -> String {
    tag.trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Constructs drivers for one protocol family
pub trait DriverFactory: Send + Sync {
    /// Protocol-type tags (and aliases) handled by this factory
    fn protocol_types(&self) -> &'static [&'static str];

    /// Build an unopened driver bound to `protocol`
    fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>>;
}

pub struct DriverRegistry {
    factories: DashMap<String, Arc<dyn DriverFactory>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("protocol_types", &self.registered_types())
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry with every bundled codec binding
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        register_builtin_drivers(&registry);
        registry
    }

    /// Register a factory under all of its tags; a later registration wins
    pub fn register(&self, factory: Arc<dyn DriverFactory>) {
        for tag in factory.protocol_types() {
            self.factories
                .insert(normalize_protocol_type(tag), Arc::clone(&factory));
        }
    }

    pub fn contains(&self, protocol_type: &str) -> bool {
        self.factories
            .contains_key(&normalize_protocol_type(protocol_type))
    }

    /// Instantiate the driver for `protocol`; unknown tags are `NotFound`
    pub fn create(&self, protocol: Arc<Protocol>) -> Result<Arc<dyn Driver>> {
        let factory = self
            .factories
            .get(&normalize_protocol_type(&protocol.protocol_type))
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| {
                CollectError::NotFound(format!("Driver for protocol type {}", protocol.protocol_type))
            })?;
        factory.create(protocol)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|r| r.key().clone()).collect();
        types.sort();
        types
    }
}

/// Register every bundled codec binding
pub fn register_builtin_drivers(registry: &DriverRegistry) {
    super::modbus::register(registry);
    super::http_api::register(registry);
    super::database::register(registry);
    super::simulator::register(registry);
}
