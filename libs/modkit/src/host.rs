//! Module lifecycle controller.
//!
//! Drives every module of a [`LoadPlan`] through:
//!
//! 1. **phase 1** (`Module::init`): strictly in plan order, one module at a time;
//! 2. **phase 2** (the setup hook registered in phase 1): only after *every* module
//!    finished phase 1, again in plan order;
//! 3. **shutdown**: shutdown handlers in reverse plan order, then the service
//!    registry is cleared.
//!
//! Per-module failures are caught here, recorded in the module's state and logged;
//! dependents of a failed module are failed by propagation without being invoked.

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::{HostCtx, ModuleHooks, Phase};
use crate::contracts::Module;
use crate::manifest::ModuleDescriptor;
use crate::resolver::LoadPlan;

// ----- Entry points ----------------------------------------------------------

/// Link-time registration submitted by [`register_entry_point!`](crate::register_entry_point).
pub struct EntryPoint {
    pub name: &'static str,
    pub factory: fn() -> Arc<dyn Module>,
}

inventory::collect!(EntryPoint);

/// Register a module factory under a manifest `entry_point` name.
///
/// ```rust,ignore
/// fn make() -> std::sync::Arc<dyn modkit::Module> { std::sync::Arc::new(MyModule::default()) }
/// modkit::register_entry_point!("core.database", make);
/// ```
#[macro_export]
macro_rules! register_entry_point {
    ($name:expr, $factory:path) => {
        $crate::inventory::submit! {
            $crate::host::EntryPoint { name: $name, factory: $factory }
        }
    };
}

type Factory = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

/// Maps manifest `entry_point` names to module factories.
#[derive(Default, Clone)]
pub struct EntryPointTable {
    factories: HashMap<String, Factory>,
}

impl std::fmt::Debug for EntryPointTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("EntryPointTable")
            .field("entry_points", &names)
            .finish()
    }
}

impl EntryPointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every [`EntryPoint`] linked into the binary.
    pub fn discover() -> Result<Self, HostError> {
        let mut table = Self::new();
        for ep in inventory::iter::<EntryPoint> {
            if table.factories.contains_key(ep.name) {
                return Err(HostError::DuplicateEntryPoint(ep.name.to_string()));
            }
            let factory = ep.factory;
            table.factories.insert(ep.name.to_string(), Arc::new(factory));
        }
        Ok(table)
    }

    pub fn register_factory<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(entry_point = %name, "entry point registered twice; keeping the latest");
        }
        self
    }

    /// Register a ready-made instance; every instantiation shares it.
    pub fn register_instance(&mut self, name: impl Into<String>, module: Arc<dyn Module>) -> &mut Self {
        self.register_factory(name, move || module.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn instantiate(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.factories.get(name).map(|f| f())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

// ----- State model -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulePhase {
    Unloaded,
    Phase1Complete,
    Phase2Complete,
    Failed,
}

/// Which step a module failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    Phase1,
    Phase2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureCause {
    Error,
    Panic,
    DependencyFailed { dependency: String },
    UnknownEntryPoint { entry_point: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseFailure {
    pub step: LifecycleStep,
    pub cause: FailureCause,
    pub message: String,
}

/// What to do when a module fails a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure; independent modules keep loading.
    #[default]
    Continue,
    /// Stop startup at the first failure.
    Abort,
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub failure_policy: FailurePolicy,
    /// Interval for "still running" warnings while a phase call is pending. Zero disables.
    pub slow_phase_warn: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            slow_phase_warn: Duration::from_secs(5),
        }
    }
}

/// Introspection snapshot of one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRuntimeState {
    pub module_id: String,
    pub phase: ModulePhase,
    pub registered_services: Vec<String>,
    pub has_setup_hook: bool,
    pub shutdown_handlers: usize,
    pub failure: Option<PhaseFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub order: Vec<String>,
    pub active: Vec<String>,
    pub failed: Vec<(String, PhaseFailure)>,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{step:?} failed for module '{module}': {message}")]
    Phase {
        module: String,
        step: LifecycleStep,
        message: String,
    },
    #[error("entry point '{0}' is registered more than once")]
    DuplicateEntryPoint(String),
    #[error("module host is already shut down")]
    ShutDown,
}

// ----- Controller ------------------------------------------------------------

struct ModuleSlot {
    descriptor: ModuleDescriptor,
    module: Option<Arc<dyn Module>>,
    hooks: Arc<ModuleHooks>,
    state: Mutex<SlotState>,
}

struct SlotState {
    phase: ModulePhase,
    failure: Option<PhaseFailure>,
}

pub struct ModuleHost {
    ctx: HostCtx,
    options: HostOptions,
    slots: Vec<ModuleSlot>, // plan order
    index: HashMap<String, usize>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("modules", &self.plan_order())
            .field("options", &self.options)
            .finish()
    }
}

impl ModuleHost {
    /// Instantiate every planned module through `entry_points`. Unknown entry points
    /// are not an error here; those modules fail phase 1.
    pub fn new(
        plan: LoadPlan,
        entry_points: &EntryPointTable,
        ctx: HostCtx,
        options: HostOptions,
    ) -> Self {
        let slots: Vec<ModuleSlot> = plan
            .into_modules()
            .into_iter()
            .map(|descriptor| ModuleSlot {
                module: entry_points.instantiate(&descriptor.entry_point),
                descriptor,
                hooks: Arc::new(ModuleHooks::default()),
                state: Mutex::new(SlotState {
                    phase: ModulePhase::Unloaded,
                    failure: None,
                }),
            })
            .collect();
        let index = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.descriptor.module_id.clone(), i))
            .collect();

        Self {
            ctx,
            options,
            slots,
            index,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &HostCtx {
        &self.ctx
    }

    pub fn plan_order(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|s| s.descriptor.module_id.clone())
            .collect()
    }

    /// Phase 1 then phase 2.
    pub async fn start(&self) -> Result<StartupReport, HostError> {
        self.run_phase1().await?;
        self.run_phase2().await?;
        let report = self.report();
        tracing::info!(
            active = report.active.len(),
            failed = report.failed.len(),
            "Module startup complete"
        );
        Ok(report)
    }

    // ---- phase 1 ----

    pub async fn run_phase1(&self) -> Result<(), HostError> {
        self.ensure_running()?;
        tracing::info!("Phase: structural init (phase 1)");

        for slot in &self.slots {
            let id = slot.descriptor.module_id.as_str();
            if self.phase_of(slot) != ModulePhase::Unloaded {
                continue;
            }

            if let Some(dep) = self.failed_dependency(slot) {
                self.fail(
                    slot,
                    LifecycleStep::Phase1,
                    FailureCause::DependencyFailed {
                        dependency: dep.clone(),
                    },
                    format!("dependency '{dep}' failed"),
                );
                slot.hooks.enter(Phase::Operational);
                continue;
            }

            let Some(module) = slot.module.clone() else {
                let ep = slot.descriptor.entry_point.clone();
                slot.hooks.enter(Phase::Operational);
                self.fail(
                    slot,
                    LifecycleStep::Phase1,
                    FailureCause::UnknownEntryPoint {
                        entry_point: ep.clone(),
                    },
                    format!("entry point '{ep}' is not registered"),
                );
                self.check_policy(slot, LifecycleStep::Phase1)?;
                continue;
            };

            tracing::debug!(module = id, "Running phase 1");
            let ctx = self.ctx.view(id, slot.hooks.clone());
            let res = supervise(id, LifecycleStep::Phase1, self.options.slow_phase_warn, async move {
                module.init(&ctx).await
            })
            .await;
            slot.hooks.enter(Phase::Operational);

            match res {
                Ok(()) => self.set_phase(slot, ModulePhase::Phase1Complete),
                Err((cause, message)) => {
                    // Withdraw whatever the module published before failing.
                    for name in slot.hooks.forget_services() {
                        self.ctx.services.unregister(id, &name);
                    }
                    drop(slot.hooks.take_setup_hook());
                    self.fail(slot, LifecycleStep::Phase1, cause, message);
                    self.check_policy(slot, LifecycleStep::Phase1)?;
                }
            }
        }
        Ok(())
    }

    // ---- phase 2 ----

    pub async fn run_phase2(&self) -> Result<(), HostError> {
        self.ensure_running()?;
        tracing::info!("Phase: operational setup (phase 2)");

        for slot in &self.slots {
            let id = slot.descriptor.module_id.as_str();
            if self.phase_of(slot) != ModulePhase::Phase1Complete {
                continue;
            }

            if let Some(dep) = self.failed_dependency(slot) {
                drop(slot.hooks.take_setup_hook());
                self.fail(
                    slot,
                    LifecycleStep::Phase2,
                    FailureCause::DependencyFailed {
                        dependency: dep.clone(),
                    },
                    format!("dependency '{dep}' failed"),
                );
                continue;
            }

            let Some(hook) = slot.hooks.take_setup_hook() else {
                self.set_phase(slot, ModulePhase::Phase2Complete);
                continue;
            };

            tracing::debug!(module = id, "Running phase 2 setup hook");
            let ctx = self.ctx.view(id, slot.hooks.clone());
            let res = supervise(
                id,
                LifecycleStep::Phase2,
                self.options.slow_phase_warn,
                async move { hook(ctx).await },
            )
            .await;

            match res {
                Ok(()) => self.set_phase(slot, ModulePhase::Phase2Complete),
                Err((cause, message)) => {
                    let services = slot.hooks.registered_services();
                    if !services.is_empty() {
                        tracing::warn!(
                            module = id,
                            services = ?services,
                            "module failed phase 2; its phase-1 services stay registered"
                        );
                    }
                    self.fail(slot, LifecycleStep::Phase2, cause, message);
                    self.check_policy(slot, LifecycleStep::Phase2)?;
                }
            }
        }
        Ok(())
    }

    // ---- shutdown ----

    /// Reverse plan order; every handler runs even if an earlier one failed.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Phase: shutdown");
        self.ctx.cancellation_token.cancel();

        for slot in self.slots.iter().rev() {
            let id = slot.descriptor.module_id.as_str();
            slot.hooks.enter(Phase::ShuttingDown);

            for (i, handler) in slot.hooks.take_shutdown_handlers().into_iter().enumerate() {
                let res = AssertUnwindSafe(async move { handler().await })
                    .catch_unwind()
                    .await;
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(module = id, handler = i, error = %format!("{e:#}"), "shutdown handler failed");
                    }
                    Err(panic) => {
                        tracing::error!(module = id, handler = i, panic = %panic_message(&*panic), "shutdown handler panicked");
                    }
                }
            }

            for name in slot.hooks.forget_services() {
                self.ctx.services.unregister(id, &name);
            }
        }

        self.ctx.services.clear();
        tracing::info!("Module shutdown complete");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // ---- introspection ----

    pub fn status(&self, module_id: &str) -> Option<ModulePhase> {
        self.index
            .get(module_id)
            .map(|&i| self.phase_of(&self.slots[i]))
    }

    pub fn snapshot(&self) -> Vec<ModuleRuntimeState> {
        self.slots
            .iter()
            .map(|s| {
                let st = s.state.lock();
                ModuleRuntimeState {
                    module_id: s.descriptor.module_id.clone(),
                    phase: st.phase,
                    registered_services: s.hooks.registered_services(),
                    has_setup_hook: s.hooks.has_setup_hook(),
                    shutdown_handlers: s.hooks.shutdown_handler_count(),
                    failure: st.failure.clone(),
                }
            })
            .collect()
    }

    /// Modules that completed both phases; failed modules never appear.
    pub fn active_modules(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| self.phase_of(s) == ModulePhase::Phase2Complete)
            .map(|s| s.descriptor.module_id.clone())
            .collect()
    }

    pub fn report(&self) -> StartupReport {
        let mut report = StartupReport {
            order: self.plan_order(),
            ..Default::default()
        };
        for s in &self.slots {
            let st = s.state.lock();
            match (&st.phase, &st.failure) {
                (ModulePhase::Phase2Complete, _) => report.active.push(s.descriptor.module_id.clone()),
                (ModulePhase::Failed, Some(f)) => report
                    .failed
                    .push((s.descriptor.module_id.clone(), f.clone())),
                _ => {}
            }
        }
        report
    }

    // ---- helpers ----

    fn ensure_running(&self) -> Result<(), HostError> {
        if self.is_shut_down() {
            Err(HostError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn phase_of(&self, slot: &ModuleSlot) -> ModulePhase {
        slot.state.lock().phase
    }

    fn set_phase(&self, slot: &ModuleSlot, phase: ModulePhase) {
        slot.state.lock().phase = phase;
        tracing::debug!(module = %slot.descriptor.module_id, phase = ?phase, "module phase changed");
    }

    fn failed_dependency(&self, slot: &ModuleSlot) -> Option<String> {
        slot.descriptor
            .dependencies
            .iter()
            .find(|d| {
                self.index
                    .get(d.as_str())
                    .is_some_and(|&i| self.phase_of(&self.slots[i]) == ModulePhase::Failed)
            })
            .cloned()
    }

    fn fail(&self, slot: &ModuleSlot, step: LifecycleStep, cause: FailureCause, message: String) {
        tracing::error!(
            module = %slot.descriptor.module_id,
            step = ?step,
            cause = ?cause,
            error = %message,
            "module failed"
        );
        let mut st = slot.state.lock();
        st.phase = ModulePhase::Failed;
        st.failure = Some(PhaseFailure { step, cause, message });
    }

    fn check_policy(&self, slot: &ModuleSlot, step: LifecycleStep) -> Result<(), HostError> {
        if self.options.failure_policy != FailurePolicy::Abort {
            return Ok(());
        }
        let message = slot
            .state
            .lock()
            .failure
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_default();
        Err(HostError::Phase {
            module: slot.descriptor.module_id.clone(),
            step,
            message,
        })
    }
}

/// Await a phase call to completion, catching panics and warning while it runs long.
async fn supervise<F>(
    module: &str,
    step: LifecycleStep,
    warn_every: Duration,
    fut: F,
) -> Result<(), (FailureCause, String)>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let fut = AssertUnwindSafe(fut).catch_unwind();
    tokio::pin!(fut);

    let outcome = if warn_every.is_zero() {
        fut.await
    } else {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval_at(started + warn_every, warn_every);
        loop {
            tokio::select! {
                res = &mut fut => break res,
                _ = ticker.tick() => {
                    tracing::warn!(
                        module,
                        step = ?step,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "module phase still running"
                    );
                }
            }
        }
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((FailureCause::Error, format!("{e:#}"))),
        Err(panic) => Err((FailureCause::Panic, format!("panicked: {}", panic_message(&*panic)))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ModuleCtx, ModuleCtxBuilder};
    use crate::resolver::resolve;
    use tokio_util::sync::CancellationToken;

    struct Noop;
    #[async_trait::async_trait]
    impl Module for Noop {
        async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Panics;
    #[async_trait::async_trait]
    impl Module for Panics {
        async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
            ctx.register_service("half_done", Arc::new(1u8))?;
            panic!("boom");
        }
    }

    fn make_noop() -> Arc<dyn Module> {
        Arc::new(Noop)
    }

    crate::register_entry_point!("modkit.tests.noop", make_noop);

    fn host(catalogue: &[ModuleDescriptor], table: &EntryPointTable, options: HostOptions) -> ModuleHost {
        let plan = resolve(catalogue).unwrap();
        let ctx = ModuleCtxBuilder::new(CancellationToken::new()).build();
        ModuleHost::new(plan, table, ctx, options)
    }

    #[test]
    fn discovered_table_contains_linked_entry_points() {
        let table = EntryPointTable::discover().unwrap();
        assert!(table.contains("modkit.tests.noop"));
        assert!(table.instantiate("modkit.tests.noop").is_some());
        assert!(table.instantiate("missing").is_none());
    }

    #[tokio::test]
    async fn unknown_entry_point_fails_only_that_module_and_dependents() {
        let mut table = EntryPointTable::new();
        table.register_instance("noop", Arc::new(Noop));
        let h = host(
            &[
                ModuleDescriptor::new("core.a", "noop", &[]),
                ModuleDescriptor::new("core.ghost", "nowhere", &[]),
                ModuleDescriptor::new("core.c", "noop", &["core.ghost"]),
            ],
            &table,
            HostOptions::default(),
        );

        let report = h.start().await.unwrap();
        assert_eq!(report.active, vec!["core.a".to_string()]);
        assert_eq!(h.status("core.ghost"), Some(ModulePhase::Failed));
        assert_eq!(h.status("core.c"), Some(ModulePhase::Failed));
        let (_, failure) = report.failed.iter().find(|(id, _)| id == "core.c").unwrap();
        assert_eq!(
            failure.cause,
            FailureCause::DependencyFailed {
                dependency: "core.ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn panic_in_phase1_is_contained_and_rolled_back() {
        let mut table = EntryPointTable::new();
        table.register_instance("panics", Arc::new(Panics));
        table.register_instance("noop", Arc::new(Noop));
        let h = host(
            &[
                ModuleDescriptor::new("core.bad", "panics", &[]),
                ModuleDescriptor::new("core.ok", "noop", &[]),
            ],
            &table,
            HostOptions::default(),
        );

        let report = h.start().await.unwrap();
        assert_eq!(report.active, vec!["core.ok".to_string()]);
        let (_, failure) = &report.failed[0];
        assert_eq!(failure.cause, FailureCause::Panic);
        assert!(failure.message.contains("boom"));
        assert!(h.context().services().get("half_done").is_none());
    }

    #[tokio::test]
    async fn abort_policy_stops_at_first_failure() {
        let mut table = EntryPointTable::new();
        table.register_instance("noop", Arc::new(Noop));
        let h = host(
            &[
                ModuleDescriptor::new("core.ghost", "nowhere", &[]),
                ModuleDescriptor::new("core.a", "noop", &[]),
            ],
            &table,
            HostOptions {
                failure_policy: FailurePolicy::Abort,
                ..Default::default()
            },
        );

        let err = h.start().await.unwrap_err();
        assert!(matches!(err, HostError::Phase { ref module, step: LifecycleStep::Phase1, .. } if module == "core.ghost"));
        assert_eq!(h.status("core.a"), Some(ModulePhase::Unloaded));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_restart() {
        let mut table = EntryPointTable::new();
        table.register_instance("noop", Arc::new(Noop));
        let h = host(&[ModuleDescriptor::new("core.a", "noop", &[])], &table, HostOptions::default());
        h.start().await.unwrap();
        h.shutdown().await;
        h.shutdown().await;
        assert!(h.is_shut_down());
        assert!(h.context().cancellation_token().is_cancelled());
        assert!(matches!(h.run_phase1().await, Err(HostError::ShutDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_phase_is_awaited_not_preempted() {
        struct Slow;
        #[async_trait::async_trait]
        impl Module for Slow {
            async fn init(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }
        let mut table = EntryPointTable::new();
        table.register_instance("slow", Arc::new(Slow));
        let h = host(
            &[ModuleDescriptor::new("core.slow", "slow", &[])],
            &table,
            HostOptions {
                slow_phase_warn: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let report = h.start().await.unwrap();
        assert_eq!(report.active, vec!["core.slow".to_string()]);
    }

    #[test]
    fn panic_message_extracts_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*s), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*s), "owned");
        let s: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(&*s), "unknown panic payload");
    }
}
