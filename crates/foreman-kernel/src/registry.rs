//! [`ServiceRegistry`] – name → service map shared by the whole process.
//!
//! Worker modules register themselves during startup; the executor resolves
//! each pipeline stage's worker from here by its well-known name.  A lookup
//! miss is an ordinary outcome, not an error: optional workers may simply be
//! absent.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use foreman_middleware::{EventBus, Topic};
use foreman_types::{EventPayload, RegistryError};
use tracing::{debug, info};

use crate::service::Service;

const SOURCE: &str = "foreman-kernel::registry";

#[derive(Default)]
struct Entries {
    services: HashMap<String, Arc<dyn Service>>,
    /// Names in registration order.
    order: Vec<String>,
}

/// Central registry of named worker services.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use foreman_kernel::{FnService, ServiceRegistry};
///
/// let registry = ServiceRegistry::new();
/// registry.register("developer-agent", Arc::new(FnService::noop("developer-agent"))).unwrap();
///
/// // Second registration under the same name is rejected.
/// assert!(registry.register("developer-agent", Arc::new(FnService::noop("other"))).is_err());
/// assert!(registry.get("tester-agent").is_none());
/// ```
#[derive(Default)]
pub struct ServiceRegistry {
    entries: RwLock<Entries>,
    bus: Option<EventBus>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that announces changes on `bus`.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            entries: RwLock::default(),
            bus: Some(bus),
        }
    }

    /// Register `service` under `name`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Duplicate`] – `name` is taken; the existing entry is
    ///   left untouched.
    /// - [`RegistryError::Invalid`] – `name` is blank, or the service is
    ///   missing its `start` or `stop` operation.
    pub fn register(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::Invalid {
                name,
                reason: "service name must not be blank".to_string(),
            });
        }
        let lifecycle = service.lifecycle();
        if !lifecycle.is_complete() {
            let missing = match (lifecycle.start, lifecycle.stop) {
                (false, false) => "start and stop",
                (false, true) => "start",
                _ => "stop",
            };
            return Err(RegistryError::Invalid {
                name,
                reason: format!("missing {missing} operation"),
            });
        }

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.services.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            entries.services.insert(name.clone(), service);
            entries.order.push(name.clone());
        }

        info!(service = %name, "service registered");
        self.announce(EventPayload::ServiceRegistered { name });
        Ok(())
    }

    /// Look up the service registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .services
            .get(name)
            .cloned()
    }

    /// Remove `name` from the registry and hand back its service.  No-ops
    /// when the name is not registered.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Service>> {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let removed = entries.services.remove(name);
            if removed.is_some() {
                entries.order.retain(|n| n != name);
            }
            removed
        };
        match removed {
            Some(service) => {
                info!(service = %name, "service unregistered");
                self.announce(EventPayload::ServiceUnregistered {
                    name: name.to_string(),
                });
                Some(service)
            }
            None => {
                debug!(service = %name, "unregister of unknown service ignored");
                None
            }
        }
    }

    /// Registered names in registration order.
    pub fn list(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    /// Registered `(name, service)` pairs in registration order.
    pub fn entries(&self) -> Vec<(String, Arc<dyn Service>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .order
            .iter()
            .filter_map(|name| {
                entries
                    .services
                    .get(name)
                    .map(|svc| (name.clone(), Arc::clone(svc)))
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn announce(&self, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            bus.emit(Topic::Services, SOURCE, payload);
        }
    }
}
