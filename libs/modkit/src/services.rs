//! Process-wide service registry.
//!
//! Design:
//! - Flat namespace: one provider per service name for the lifetime of the entry.
//! - Writes are partitioned by owner module id: only the owner can replace or remove its entry.
//! - Value = `Arc<T>` stored as `Arc<dyn Any + Send + Sync>`; typed reads downcast on read.
//!   `T` may be a trait object (`dyn my::Api`).
//! - Reads are sync and lock-shared; safe from request handlers at any time.
//!
//! Notes:
//! - A lookup miss is `None`, never an error. Use [`ServiceRegistry::require`] when a
//!   structured "service unavailable" result is wanted.
//! - Removing an entry does not invalidate `Arc`s already handed out to consumers.

use parking_lot::RwLock;
use std::{any::Any, collections::HashMap, fmt, sync::Arc};

/// Opaque service handle as stored in the registry.
///
/// The published `Arc<T>` is itself boxed into this `Arc<dyn Any>`, so
/// `instance.downcast::<T>()` never succeeds. Recover the typed handle with
/// `instance.downcast_ref::<Arc<T>>()`, or skip this type entirely via
/// [`ServiceRegistry::get_typed`] / `ModuleCtx::get_service_typed`.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

struct Entry {
    owner: Arc<str>,
    type_name: &'static str,
    instance: ServiceInstance,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("service '{name}' is already registered by module '{existing_owner}' (attempted by '{owner}')")]
    DuplicateServiceName {
        name: String,
        owner: String,
        existing_owner: String,
    },
    #[error("service name must not be empty (module '{owner}')")]
    EmptyName { owner: String },
}

/// Structured soft failure for consumers that need a service which is not there.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("service '{service}' is unavailable")]
pub struct ServiceUnavailable {
    pub service: String,
}

impl ServiceUnavailable {
    pub const CODE: &'static str = "SERVICE_UNAVAILABLE";

    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    /// Envelope used by function-style handlers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": Self::CODE,
                "message": self.to_string(),
                "service": self.service,
            }
        })
    }
}

/// Diagnostics row for one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub owner: String,
    pub type_name: &'static str,
}

/// Read-only view of a [`ServiceRegistry`], handed to module code.
///
/// Writes go through `ModuleCtx::register_service` / `unregister_service`,
/// which attribute them to the calling module.
#[derive(Clone, Copy)]
pub struct ServiceLookup<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> ServiceLookup<'a> {
    pub(crate) fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    pub fn get(&self, name: &str) -> Option<ServiceInstance> {
        self.registry.get(name)
    }

    pub fn get_typed<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.registry.get_typed::<T>(name)
    }

    pub fn require<T>(&self, name: &str) -> Result<Arc<T>, ServiceUnavailable>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.registry.require::<T>(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.registry.owner_of(name)
    }

    pub fn entries(&self) -> Vec<ServiceInfo> {
        self.registry.entries()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

impl fmt::Debug for ServiceLookup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.registry, f)
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    map: RwLock<HashMap<String, Entry>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.entries())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `instance` under `name` on behalf of `owner`.
    pub fn register<T>(&self, owner: &str, name: &str, instance: Arc<T>) -> Result<(), ServiceError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(ServiceError::EmptyName {
                owner: owner.to_string(),
            });
        }

        let mut w = self.map.write();
        if let Some(existing) = w.get(name) {
            if &*existing.owner != owner {
                return Err(ServiceError::DuplicateServiceName {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    existing_owner: existing.owner.to_string(),
                });
            }
            tracing::warn!(module = owner, service = name, "service re-registered by its owner; replacing instance");
        }

        w.insert(
            name.to_string(),
            Entry {
                owner: Arc::from(owner),
                type_name: std::any::type_name::<T>(),
                instance: Arc::new(instance),
            },
        );
        tracing::debug!(module = owner, service = name, "service registered");
        Ok(())
    }

    /// Untyped lookup. See [`ServiceInstance`] for how to downcast the result.
    pub fn get(&self, name: &str) -> Option<ServiceInstance> {
        self.map.read().get(name).map(|e| e.instance.clone())
    }

    /// Typed lookup; a type mismatch is treated like a miss.
    pub fn get_typed<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let r = self.map.read();
        let entry = r.get(name)?;
        match entry.instance.downcast_ref::<Arc<T>>() {
            Some(arc_t) => Some(arc_t.clone()),
            None => {
                tracing::debug!(
                    service = name,
                    stored = entry.type_name,
                    requested = std::any::type_name::<T>(),
                    "service type mismatch"
                );
                None
            }
        }
    }

    /// Typed lookup that turns a miss into [`ServiceUnavailable`].
    pub fn require<T>(&self, name: &str) -> Result<Arc<T>, ServiceUnavailable>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get_typed::<T>(name)
            .ok_or_else(|| ServiceUnavailable::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.read().contains_key(name)
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.map.read().get(name).map(|e| e.owner.to_string())
    }

    /// Remove `name` if `owner` holds it. Returns whether anything was removed.
    pub fn unregister(&self, owner: &str, name: &str) -> bool {
        let mut w = self.map.write();
        match w.get(name) {
            Some(e) if &*e.owner == owner => {
                w.remove(name);
                tracing::debug!(module = owner, service = name, "service unregistered");
                true
            }
            _ => false,
        }
    }

    /// Remove every entry owned by `owner`; returns the removed names, sorted.
    pub fn unregister_owner(&self, owner: &str) -> Vec<String> {
        let mut w = self.map.write();
        let mut names: Vec<String> = w
            .iter()
            .filter(|(_, e)| &*e.owner == owner)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        for n in &names {
            w.remove(n);
        }
        names
    }

    /// Snapshot sorted by name.
    pub fn entries(&self) -> Vec<ServiceInfo> {
        let mut out: Vec<ServiceInfo> = self
            .map
            .read()
            .iter()
            .map(|(name, e)| ServiceInfo {
                name: name.clone(),
                owner: e.owner.to_string(),
                type_name: e.type_name,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
