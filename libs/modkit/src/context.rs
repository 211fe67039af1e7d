use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::contracts::{SetupHook, ShutdownHandler};
use crate::services::{
    ServiceError, ServiceInstance, ServiceLookup, ServiceRegistry, ServiceUnavailable,
};

/// Provider of module-specific configuration (raw JSON sections only).
pub trait ConfigProvider: Send + Sync {
    /// Returns raw JSON section for the module, if any.
    fn get_module_config(&self, module_id: &str) -> Option<&serde_json::Value>;
}

/// Lifecycle window a module's hooks are currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Phase 1: publish services, register hooks. No shared I/O.
    Structural,
    /// Phase 2: registry is complete; resource-touching setup.
    Operational,
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("module '{module}' cannot {action} during {phase:?}")]
    PhaseClosed {
        module: String,
        action: &'static str,
        phase: Phase,
    },
    #[error("module '{module}' attempted to register a hook for '{target}'")]
    ForeignModule { module: String, target: String },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("no ConfigProvider")]
    NoConfigProvider,
    #[error("missing module config: {0}")]
    MissingConfig(String),
    #[error("invalid {module} config: {source}")]
    InvalidConfig {
        module: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-module hook sink shared between the host and every context view of that module.
pub struct ModuleHooks {
    inner: Mutex<HooksInner>,
}

struct HooksInner {
    phase: Phase,
    setup_hook: Option<SetupHook>,
    shutdown_handlers: Vec<ShutdownHandler>,
    services: Vec<String>,
}

impl Default for ModuleHooks {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HooksInner {
                phase: Phase::Structural,
                setup_hook: None,
                shutdown_handlers: Vec::new(),
                services: Vec::new(),
            }),
        }
    }
}

impl ModuleHooks {
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn registered_services(&self) -> Vec<String> {
        self.inner.lock().services.clone()
    }

    pub fn has_setup_hook(&self) -> bool {
        self.inner.lock().setup_hook.is_some()
    }

    pub fn shutdown_handler_count(&self) -> usize {
        self.inner.lock().shutdown_handlers.len()
    }

    pub(crate) fn enter(&self, phase: Phase) {
        self.inner.lock().phase = phase;
    }

    pub(crate) fn take_setup_hook(&self) -> Option<SetupHook> {
        self.inner.lock().setup_hook.take()
    }

    pub(crate) fn take_shutdown_handlers(&self) -> Vec<ShutdownHandler> {
        std::mem::take(&mut self.inner.lock().shutdown_handlers)
    }

    pub(crate) fn forget_services(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().services)
    }
}

/// Process-lifetime context shared by every module view.
#[derive(Clone)]
pub struct HostCtx {
    pub(crate) services: Arc<ServiceRegistry>,
    pub(crate) config_provider: Option<Arc<dyn ConfigProvider>>,
    pub(crate) cancellation_token: CancellationToken,
}

pub struct ModuleCtxBuilder {
    inner: HostCtx,
}

impl ModuleCtxBuilder {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            inner: HostCtx {
                services: Arc::new(ServiceRegistry::new()),
                config_provider: None,
                cancellation_token: token,
            },
        }
    }
    pub fn with_services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.inner.services = services;
        self
    }
    pub fn with_config_provider(mut self, p: Arc<dyn ConfigProvider>) -> Self {
        self.inner.config_provider = Some(p);
        self
    }
    pub fn build(self) -> HostCtx {
        self.inner
    }
}

impl HostCtx {
    pub fn services(&self) -> Arc<ServiceRegistry> {
        self.services.clone()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// A view bound to `module_id` with its own fresh hook sink.
    #[cfg(test)]
    pub(crate) fn scoped(&self, module_id: &str) -> ModuleCtx {
        self.view(module_id, Arc::new(ModuleHooks::default()))
    }

    pub(crate) fn view(&self, module_id: &str, hooks: Arc<ModuleHooks>) -> ModuleCtx {
        ModuleCtx {
            module_id: Arc::from(module_id),
            host: self.clone(),
            hooks,
        }
    }
}

/// The façade handed to module code. Every call is attributed to the bound module.
#[derive(Clone)]
pub struct ModuleCtx {
    module_id: Arc<str>,
    host: HostCtx,
    hooks: Arc<ModuleHooks>,
}

impl std::fmt::Debug for ModuleCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCtx")
            .field("module_id", &self.module_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ModuleCtx {
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn phase(&self) -> Phase {
        self.hooks.phase()
    }

    pub fn hooks(&self) -> &ModuleHooks {
        &self.hooks
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.host.cancellation_token
    }

    /// Read-only registry view; writes go through the attributed methods below.
    pub fn services(&self) -> ServiceLookup<'_> {
        ServiceLookup::new(&self.host.services)
    }

    fn ensure_phase(&self, allowed: &[Phase], action: &'static str) -> Result<(), ContextError> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(ContextError::PhaseClosed {
                module: self.module_id.to_string(),
                action,
                phase,
            })
        }
    }

    // ---- services ----

    /// Publish a service owned by this module. Phase 1 only.
    pub fn register_service<T>(&self, name: &str, instance: Arc<T>) -> Result<(), ContextError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.ensure_phase(&[Phase::Structural], "register a service")?;
        self.host.services.register::<T>(&self.module_id, name, instance)?;
        let mut inner = self.hooks.inner.lock();
        if !inner.services.iter().any(|s| s == name) {
            inner.services.push(name.to_string());
        }
        Ok(())
    }

    /// Withdraw a service this module published. Entries owned by other modules
    /// are left alone and report `false`.
    pub fn unregister_service(&self, name: &str) -> Result<bool, ContextError> {
        self.ensure_phase(
            &[Phase::Structural, Phase::Operational],
            "unregister a service",
        )?;
        if !self.host.services.unregister(&self.module_id, name) {
            return Ok(false);
        }
        self.hooks.inner.lock().services.retain(|s| s != name);
        Ok(true)
    }

    /// Untyped lookup; downcast with `downcast_ref::<Arc<T>>()`, or prefer
    /// [`get_service_typed`](Self::get_service_typed).
    pub fn get_service(&self, name: &str) -> Option<ServiceInstance> {
        self.host.services.get(name)
    }

    pub fn get_service_typed<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.host.services.get_typed::<T>(name)
    }

    pub fn require_service<T>(&self, name: &str) -> Result<Arc<T>, ServiceUnavailable>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.host.services.require::<T>(name)
    }

    // ---- hooks ----

    /// Register the phase-2 setup hook for `module_id`, which must be this module.
    pub fn register_module_setup_hook<F, Fut>(&self, module_id: &str, hook: F) -> Result<(), ContextError>
    where
        F: FnOnce(ModuleCtx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if module_id != &*self.module_id {
            return Err(ContextError::ForeignModule {
                module: self.module_id.to_string(),
                target: module_id.to_string(),
            });
        }
        self.ensure_phase(&[Phase::Structural], "register a setup hook")?;
        let boxed: SetupHook =
            Box::new(move |ctx: ModuleCtx| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(hook(ctx))
            });
        if self.hooks.inner.lock().setup_hook.replace(boxed).is_some() {
            tracing::warn!(module = %self.module_id, "setup hook registered twice; keeping the latest");
        }
        Ok(())
    }

    /// Register the phase-2 setup hook for this module.
    pub fn register_setup_hook<F, Fut>(&self, hook: F) -> Result<(), ContextError>
    where
        F: FnOnce(ModuleCtx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.module_id.clone();
        self.register_module_setup_hook(&id, hook)
    }

    /// Handlers run in registration order when the module is torn down.
    pub fn register_shutdown_handler<F, Fut>(&self, handler: F) -> Result<(), ContextError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.ensure_phase(
            &[Phase::Structural, Phase::Operational],
            "register a shutdown handler",
        )?;
        let boxed: ShutdownHandler =
            Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(handler()) });
        self.hooks.inner.lock().shutdown_handlers.push(boxed);
        Ok(())
    }

    // ---- settings ----

    /// Raw settings of any module; an empty object when none are configured.
    pub fn get_module_settings(&self, module_id: &str) -> serde_json::Value {
        self.host
            .config_provider
            .as_ref()
            .and_then(|p| p.get_module_config(module_id))
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Best-effort: deserialize this module's config into `T`, fallback to `T::default()`
    /// if section is missing or invalid.
    pub fn module_config<T: DeserializeOwned + Default>(&self) -> T {
        match &self.host.config_provider {
            Some(p) => p
                .get_module_config(&self.module_id)
                .and_then(|v| serde_json::from_value::<T>(v.clone()).ok())
                .unwrap_or_default(),
            None => T::default(),
        }
    }

    /// Strict: deserialize this module's config into `T`, returning a pathful error on failure.
    pub fn module_config_required<T: DeserializeOwned>(&self) -> Result<T, ContextError> {
        let prov = self
            .host
            .config_provider
            .as_ref()
            .ok_or(ContextError::NoConfigProvider)?;

        let val = prov
            .get_module_config(&self.module_id)
            .ok_or_else(|| ContextError::MissingConfig(self.module_id.to_string()))?;

        serde_json::from_value(val.clone()).map_err(|source| ContextError::InvalidConfig {
            module: self.module_id.to_string(),
            source,
        })
    }
}
