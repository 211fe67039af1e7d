use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::ModuleCtx;

/// Core module: structural initialization (phase 1).
///
/// Publish services and register hooks here; do not touch shared persistent
/// resources. Anything that needs other modules' services or I/O belongs in the
/// setup hook registered via [`ModuleCtx::register_setup_hook`], which runs in
/// phase 2 once every module has finished `init`.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;
}

/// Deferred phase-2 callable.
pub type SetupHook = Box<dyn FnOnce(ModuleCtx) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Teardown callable, run in reverse load order.
pub type ShutdownHandler = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
