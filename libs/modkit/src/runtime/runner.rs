//! ModKit runtime runner.
//!
//! One call drives the whole process lifetime:
//! scan the modules root, resolve the load plan, run phase 1 and phase 2,
//! wait for the stop trigger, then shut every module down in reverse order.
//!
//! Shutdown can be driven by OS signals, an external `CancellationToken`,
//! or an arbitrary future.

use std::path::{Path, PathBuf};
use std::{future::Future, pin::Pin, sync::Arc};
use tokio_util::sync::CancellationToken;

use crate::context::{ConfigProvider, ModuleCtxBuilder};
use crate::host::{EntryPointTable, HostError, HostOptions, ModuleHost, StartupReport};
use crate::resolver::{resolve, LoadPlan, ResolveError};
use crate::runtime::shutdown;
use crate::scanner::{ManifestScanner, ScanError};
use crate::services::ServiceRegistry;

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    pub modules_root: PathBuf,
    /// Category directories scanned, in order.
    pub categories: Vec<String>,
    /// Provider of module settings (raw JSON by module id).
    pub modules_cfg: Option<Arc<dyn ConfigProvider>>,
    pub entry_points: EntryPointTable,
    pub host: HostOptions,
    pub shutdown: ShutdownOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("modules root '{}' is not readable: {source}", path.display())]
    ModulesRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// Scan and resolve without instantiating anything.
#[derive(Debug)]
pub struct Discovery {
    pub plan: LoadPlan,
    pub scan_errors: Vec<ScanError>,
}

pub fn discover(modules_root: &Path, categories: &[String]) -> Result<Discovery, RunError> {
    std::fs::read_dir(modules_root).map_err(|source| RunError::ModulesRoot {
        path: modules_root.to_path_buf(),
        source,
    })?;

    // Per-module scan errors are already logged by the scanner.
    let report = ManifestScanner::new(categories.iter().cloned()).scan(modules_root);
    let plan = resolve(&report.descriptors)?;
    Ok(Discovery {
        plan,
        scan_errors: report.errors,
    })
}

/// Full cycle: scan → resolve → phase 1 → phase 2 → wait → shutdown.
///
/// A resolution failure aborts before any module runs. Under
/// [`FailurePolicy::Abort`](crate::host::FailurePolicy::Abort) a phase failure shuts down
/// whatever already started and is returned.
pub async fn run(opts: RunOptions) -> Result<StartupReport, RunError> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    let discovery = discover(&opts.modules_root, &opts.categories)?;
    tracing::info!(
        root = %opts.modules_root.display(),
        modules = discovery.plan.len(),
        skipped = discovery.scan_errors.len(),
        "Modules discovered"
    );

    // Spawn the shutdown waiter according to the chosen strategy.
    match opts.shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match shutdown::wait_for_signal().await {
                    Ok(sig) => tracing::info!(signal = sig, "shutdown: signal received"),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: signal listener failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    let mut builder =
        ModuleCtxBuilder::new(cancel.clone()).with_services(Arc::new(ServiceRegistry::new()));
    if let Some(cfg) = opts.modules_cfg {
        builder = builder.with_config_provider(cfg);
    }

    let host = ModuleHost::new(discovery.plan, &opts.entry_points, builder.build(), opts.host);

    let report = match host.start().await {
        Ok(report) => report,
        Err(e) => {
            host.shutdown().await;
            return Err(e.into());
        }
    };

    cancel.cancelled().await;
    host.shutdown().await;
    Ok(report)
}
