use anyhow::{Context, Result};
use modkit::{FailurePolicy, HostOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::{resolve_against, resolve_home_dir, DEFAULT_HOME_SUBDIR};

/// Application configuration: typed host/logging sections plus a free-form
/// per-module settings bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostConfig,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Directory of `<module_id>.yaml` files merged into `modules`.
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Per-module settings: module id → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct HostConfig {
    /// Normalized to an absolute path on load.
    pub home_dir: String,
    /// Module tree root; relative paths resolve against `home_dir`.
    pub modules_root: String,
    /// Category directories scanned, in order.
    pub categories: Vec<String>,
    pub failure_policy: FailurePolicy,
    /// Interval of "still running" warnings for a slow phase call; `0s` disables.
    #[serde(with = "humantime_serde")]
    pub slow_phase_warn: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            // Empty => `$HOME/.modhost`
            home_dir: String::new(),
            modules_root: "modules".to_string(),
            categories: modkit::DEFAULT_CATEGORIES
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
            failure_policy: FailurePolicy::Continue,
            slow_phase_warn: Duration::from_secs(5),
        }
    }
}

/// Logging sections keyed by target prefix (`modkit`, `modkit::host`, ...).
/// Key "default" is the catch-all for targets without their own section.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/modhost.log"; empty => no file
    #[serde(default)]
    pub file_level: String,
    /// Rotated files kept. When unset, rotated files older than one day are deleted
    /// instead; rotation itself is always triggered by size.
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

pub fn default_logging_config() -> LoggingConfig {
    HashMap::from([(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/modhost.log".to_string(),
            file_level: "debug".to_string(),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    )])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            logging: Some(default_logging_config()),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

/// Command line values that override the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub modules_root: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
}

impl AppConfig {
    /// Layered loading: defaults → YAML file → `APP__` environment variables.
    /// Normalizes `host.home_dir` into an absolute path and creates it.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        if !config_path.as_ref().is_file() {
            anyhow::bail!("config file not found: '{}'", config_path.as_ref().display());
        }

        // Optional sections stay None unless YAML/ENV provide them.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let figment = Figment::new()
            .merge(Serialized::defaults(base))
            .merge(Yaml::file(config_path.as_ref()))
            // APP__HOST__MODULES_ROOT=/srv/modules maps to host.modules_root
            .merge(Env::prefixed("APP__").split("__"));

        let mut config: AppConfig = figment
            .extract()
            .with_context(|| format!("invalid configuration '{}'", config_path.as_ref().display()))?;

        config.normalize_home_dir()?;

        if let Some(dir) = config.modules_dir.clone() {
            let dir = resolve_against(&dir, Path::new(&config.host.home_dir));
            merge_module_files(&mut config.modules, &dir)
                .with_context(|| format!("failed to read module settings from '{}'", dir.display()))?;
        }

        Ok(config)
    }

    /// Load from `config_path` if given, otherwise defaults (home_dir still normalized).
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self::default();
                c.normalize_home_dir()?;
                Ok(c)
            }
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(root) = &args.modules_root {
            self.host.modules_root = root.clone();
        }

        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            match args.verbose {
                0 => {}
                1 => default_section.console_level = "debug".to_string(),
                _ => default_section.console_level = "trace".to_string(),
            }
        }
    }

    pub fn home_dir(&self) -> &Path {
        Path::new(&self.host.home_dir)
    }

    pub fn modules_root(&self) -> PathBuf {
        resolve_against(&self.host.modules_root, self.home_dir())
    }

    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            failure_policy: self.host.failure_policy,
            slow_phase_warn: self.host.slow_phase_warn,
        }
    }

    fn normalize_home_dir(&mut self) -> Result<()> {
        let resolved = resolve_home_dir(Some(self.host.home_dir.as_str()), DEFAULT_HOME_SUBDIR, true)
            .context("Failed to resolve host.home_dir")?;
        self.host.home_dir = resolved.to_string_lossy().into_owned();
        Ok(())
    }
}

/// Module files win over inline `modules` entries with the same id.
fn merge_module_files(bag: &mut HashMap<String, serde_json::Value>, dir: &Path) -> Result<()> {
    use std::fs;
    if !dir.exists() {
        tracing::debug!(dir = %dir.display(), "modules_dir does not exist; skipping");
        return Ok(());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        })
        .collect();
    files.sort();

    for path in files {
        let Some(module_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let raw = fs::read_to_string(&path)?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in '{}'", path.display()))?;
        bag.insert(module_id.to_string(), serde_json::to_value(val)?);
    }
    Ok(())
}

/// Read-only view of the module settings bag for the module host.
#[derive(Debug, Clone)]
pub struct AppConfigProvider {
    modules: HashMap<String, serde_json::Value>,
}

impl AppConfigProvider {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            modules: config.modules.clone(),
        }
    }
}

impl modkit::ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_id: &str) -> Option<&serde_json::Value> {
        self.modules.get(module_id)
    }
}
