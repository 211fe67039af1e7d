use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use modkit::runtime::{discover, run, RunOptions, ShutdownOptions};
use modkit::{EntryPointTable, ManifestScanner};
use runtime::{AppConfig, AppConfigProvider, CliArgs};
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Ensure modules are linked and their entry points registered via inventory
#[allow(dead_code)]
fn _ensure_modules_linked() {
    let _ = std::any::type_name::<scheduler::SchedulerModule>();
}

/// ModHost - plugin host with a two-phase module lifecycle
#[derive(Parser)]
#[command(name = "modhost")]
#[command(about = "ModHost - plugin host with a two-phase module lifecycle")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module tree root (overrides host.modules_root)
    #[arg(short, long)]
    modules_root: Option<String>,

    /// Print current configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every module and run until SIGINT/SIGTERM
    Run,
    /// Scan and resolve the module tree, print the load plan
    Check,
    /// List scanned modules and scan errors
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        modules_root: cli.modules_root.clone(),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // home_dir is normalized inside
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    runtime::init_logging_from_config(&logging_config, config.home_dir());

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_host(config).await,
        Commands::Check => check_modules(&config),
        Commands::List => list_modules(&config),
    }
}

async fn run_host(config: AppConfig) -> Result<()> {
    tracing::info!(root = %config.modules_root().display(), "ModHost starting");

    let opts = RunOptions {
        modules_root: config.modules_root(),
        categories: config.host.categories.clone(),
        modules_cfg: Some(Arc::new(AppConfigProvider::new(&config))),
        entry_points: EntryPointTable::discover()?,
        host: config.host_options(),
        shutdown: ShutdownOptions::Signals,
    };

    let report = run(opts).await?;
    if !report.is_clean() {
        for (module, failure) in &report.failed {
            tracing::warn!(module = %module, step = ?failure.step, error = %failure.message, "module did not start");
        }
    }
    tracing::info!(
        active = report.active.len(),
        failed = report.failed.len(),
        "ModHost stopped"
    );
    Ok(())
}

fn check_modules(config: &AppConfig) -> Result<()> {
    let discovery = discover(&config.modules_root(), &config.host.categories)?;
    let entry_points = EntryPointTable::discover()?;

    println!("Load plan ({} modules):", discovery.plan.len());
    for (i, m) in discovery.plan.modules().iter().enumerate() {
        let linked = if entry_points.contains(&m.entry_point) {
            ""
        } else {
            " [entry point not linked]"
        };
        println!("{:>3}. {} ({}){}", i + 1, m.module_id, m.version, linked);
    }
    for err in &discovery.scan_errors {
        println!("skipped: {err}");
    }
    println!("Module check passed");
    Ok(())
}

fn list_modules(config: &AppConfig) -> Result<()> {
    let report = ManifestScanner::new(config.host.categories.iter().cloned())
        .scan(&config.modules_root());
    let errors: Vec<serde_json::Value> = report
        .errors
        .iter()
        .map(|e| {
            serde_json::json!({
                "path": e.path().display().to_string(),
                "error": e.to_string(),
            })
        })
        .collect();
    let out = serde_json::json!({
        "modules": report.descriptors,
        "errors": errors,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
