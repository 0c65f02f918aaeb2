use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::definition::ServiceDefinition;
use super::error::InvocationError;
use super::instance::ServiceInstance;
use crate::traits::ServiceRegistry;

// ---------------------------------------------------------------------------
// ServiceEntry
// ---------------------------------------------------------------------------

/// A registered service with its process-wide state.
struct ServiceEntry {
    id: u64,
    definition: Arc<ServiceDefinition>,
    active: AtomicBool,
    usage: Arc<AtomicU64>,
}

// ---------------------------------------------------------------------------
// ServiceStore
// ---------------------------------------------------------------------------

/// In-memory service registry.
///
/// Provides three lookup mechanisms:
/// - **By implementation id**: the primary key, owning the definition
/// - **By name**: resolves public service names to implementation ids
/// - **By numeric id**: assigned at registration, stable for the process lifetime
///
/// Active flags and usage counters are atomics; readers never take a lock.
pub struct ServiceStore {
    by_impl: DashMap<String, Arc<ServiceEntry>>,
    name_to_impl: DashMap<String, String>,
    id_to_impl: DashMap<u64, String>,
    next_id: AtomicU64,
    /// Registration order, for listing.
    order: RwLock<Vec<String>>,
}

impl ServiceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_impl: DashMap::new(),
            name_to_impl: DashMap::new(),
            id_to_impl: DashMap::new(),
            next_id: AtomicU64::new(1),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Registers a service and returns its numeric id. Registering an
    /// implementation id again replaces the definition and keeps the id,
    /// the usage counter and the active flag.
    pub fn register(&self, definition: ServiceDefinition) -> u64 {
        let impl_id = definition.impl_id.clone();
        let name = definition.name.clone();
        let definition = Arc::new(definition);

        let entry = if let Some(existing) = self.by_impl.get(&impl_id) {
            Arc::new(ServiceEntry {
                id: existing.id,
                definition,
                active: AtomicBool::new(existing.active.load(Ordering::Acquire)),
                usage: existing.usage.clone(),
            })
        } else {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.order.write().push(impl_id.clone());
            Arc::new(ServiceEntry {
                id,
                definition,
                active: AtomicBool::new(true),
                usage: Arc::new(AtomicU64::new(0)),
            })
        };

        let id = entry.id;
        self.id_to_impl.insert(id, impl_id.clone());
        self.name_to_impl.insert(name, impl_id.clone());
        self.by_impl.insert(impl_id, entry);
        id
    }

    /// Marks a service active or inactive. Returns `false` for unknown names.
    pub fn set_active(&self, name: &str, active: bool) -> bool {
        let Some(impl_id) = self.name_to_impl.get(name).map(|e| e.value().clone()) else {
            return false;
        };
        match self.by_impl.get(&impl_id) {
            Some(entry) => {
                entry.active.store(active, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Usage counter of a service, if registered.
    #[must_use]
    pub fn usage(&self, name: &str) -> Option<u64> {
        let impl_id = self.name_to_impl.get(name)?.value().clone();
        self.by_impl
            .get(&impl_id)
            .map(|e| e.usage.load(Ordering::Relaxed))
    }

    /// Numeric id of a service, if registered.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<u64> {
        let impl_id = self.name_to_impl.get(name)?.value().clone();
        self.by_impl.get(&impl_id).map(|e| e.id)
    }

    /// Service names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.order
            .read()
            .iter()
            .filter_map(|impl_id| self.by_impl.get(impl_id).map(|e| e.definition.name.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_impl.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_impl.is_empty()
    }
}

impl Default for ServiceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry for ServiceStore {
    fn new_instance(&self, impl_id: &str) -> Result<(ServiceInstance, bool), InvocationError> {
        let entry = self
            .by_impl
            .get(impl_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| InvocationError::not_found(format!("service `{impl_id}` not found")))?;
        let instance = ServiceInstance::new(entry.definition.clone(), entry.usage.clone());
        Ok((instance, entry.active.load(Ordering::Acquire)))
    }

    fn resolve_name_to_impl(&self, name: &str) -> Result<String, InvocationError> {
        self.name_to_impl
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| InvocationError::not_found(format!("service `{name}` not found")))
    }

    fn resolve_id_to_impl(&self, id: u64) -> Result<String, InvocationError> {
        self.id_to_impl
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| InvocationError::not_found(format!("service id {id} not found")))
    }

    fn contains_name(&self, name: &str) -> bool {
        self.name_to_impl.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
