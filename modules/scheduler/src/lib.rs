//! Scheduler module.
//!
//! Publishes an in-memory [`Scheduler`] under [`SCHEDULER_SERVICE`] in phase 1 and
//! starts its tick loop in phase 2. Settings come from `modules.<module id>`:
//!
//! ```yaml
//! modules:
//!   core.scheduler:
//!     tick_interval: 500ms
//! ```

pub mod config;
mod service;

pub use config::SchedulerConfig;
pub use service::{apply_retention, Scheduler, TaskRun, CLEANUP_ACTION};

use async_trait::async_trait;
use chrono::Utc;
use modkit::{Module, ModuleCtx};
use parking_lot::Mutex;
use scheduler_sdk::{SchedulerApi, SCHEDULER_SERVICE};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Manifest `entry_point` this crate registers.
pub const ENTRY_POINT: &str = "scheduler";

#[derive(Default)]
pub struct SchedulerModule {
    service: Mutex<Option<Arc<Scheduler>>>,
}

impl SchedulerModule {
    /// The instance published by `init`, if it ran.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.service.lock().clone()
    }
}

#[async_trait]
impl Module for SchedulerModule {
    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg = ctx.module_config::<SchedulerConfig>();
        anyhow::ensure!(!cfg.tick_interval.is_zero(), "tick_interval must be positive");

        let service = Arc::new(Scheduler::new(cfg.history_limit));
        let api: Arc<dyn SchedulerApi> = service.clone();
        ctx.register_service::<dyn SchedulerApi>(SCHEDULER_SERVICE, api)?;
        *self.service.lock() = Some(service.clone());

        let tick = cfg.tick_interval;
        ctx.register_setup_hook(move |ctx| async move {
            let stop = ctx.cancellation_token().child_token();
            let worker = tokio::spawn(tick_loop(service, tick, stop.clone()));
            ctx.register_shutdown_handler(move || async move {
                stop.cancel();
                worker
                    .await
                    .map_err(|e| anyhow::anyhow!("scheduler tick loop: {e}"))
            })?;
            tracing::info!(module = %ctx.module_id(), tick = ?tick, "Scheduler started");
            Ok(())
        })?;
        Ok(())
    }
}

async fn tick_loop(service: Arc<Scheduler>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let fired = service.run_due(Utc::now());
                if !fired.is_empty() {
                    tracing::debug!(count = fired.len(), "scheduler tick fired tasks");
                }
            }
        }
    }
    tracing::debug!("Scheduler tick loop stopped");
}

fn make_module() -> Arc<dyn Module> {
    Arc::new(SchedulerModule::default())
}

modkit::register_entry_point!(ENTRY_POINT, make_module);
