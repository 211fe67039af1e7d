//! # ModKit - Module Host
//!
//! Loads independently packaged modules described by manifests and drives them
//! through a two-phase lifecycle around a shared service registry.
//!
//! - **Scanner**: walks `<root>/<category>/[<namespace>/]<module>/manifest.{json,yaml}`
//! - **Resolver**: deterministic dependency order, cycle and missing-dependency errors
//! - **Host**: phase 1 (`Module::init`) for every module, then phase 2 (setup hooks),
//!   then reverse-order shutdown
//! - **Services**: process-wide, owner-attributed name → instance map
//!
//! ## Example
//!
//! ```rust,ignore
//! use modkit::{Module, ModuleCtx};
//!
//! #[derive(Default)]
//! pub struct Notes;
//!
//! #[modkit::async_trait]
//! impl Module for Notes {
//!     async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
//!         ctx.register_service("notes_service", std::sync::Arc::new(NotesService::default()))?;
//!         ctx.register_setup_hook(|ctx| async move {
//!             let _db = ctx.require_service::<Db>("database_service")?;
//!             Ok(())
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! fn make() -> std::sync::Arc<dyn Module> { std::sync::Arc::new(Notes) }
//! modkit::register_entry_point!("standard.notes", make);
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

// Re-export inventory for `register_entry_point!`
pub use inventory;

pub mod context;
pub mod contracts;
pub mod host;
pub mod manifest;
pub mod resolver;
pub mod runtime;
pub mod scanner;
pub mod services;

pub use context::{ConfigProvider, ContextError, HostCtx, ModuleCtx, ModuleCtxBuilder, Phase};
pub use contracts::{Module, SetupHook, ShutdownHandler};
pub use host::{
    EntryPointTable, FailureCause, FailurePolicy, HostError, HostOptions, LifecycleStep,
    ModuleHost, ModulePhase, ModuleRuntimeState, PhaseFailure, StartupReport,
};
pub use manifest::{Manifest, ManifestError, ModuleDescriptor};
pub use resolver::{resolve, LoadPlan, ResolveError};
pub use runtime::{run, RunError, RunOptions, ShutdownOptions};
pub use scanner::{ManifestScanner, ScanError, ScanReport, DEFAULT_CATEGORIES};
pub use services::{
    ServiceError, ServiceInfo, ServiceInstance, ServiceLookup, ServiceRegistry, ServiceUnavailable,
};
