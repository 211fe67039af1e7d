use crate::config::{LoggingConfig, Section};
use crate::paths::resolve_against;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::{IsTerminal, Write},
    path::Path,
    sync::Arc,
};
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{filter::Targets, fmt};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

const DEFAULT_SECTION: &str = "default";

// -------- level helpers --------

fn parse_tracing_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

fn level_filter(s: &str) -> LevelFilter {
    parse_tracing_level(s).map_or(LevelFilter::OFF, LevelFilter::from_level)
}

/// Returns true if target == prefix or target starts with "prefix::"
fn matches_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

/// Per-target filter: explicit sections by target prefix, `default` for the rest.
/// `Targets` picks the most specific prefix, so explicit sections override `default`.
fn build_targets<F>(cfg: &LoggingConfig, level_of: F) -> Targets
where
    F: Fn(&Section) -> LevelFilter,
{
    let default = cfg.get(DEFAULT_SECTION).map_or(LevelFilter::OFF, &level_of);
    cfg.iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SECTION)
        .fold(Targets::new().with_default(default), |t, (name, section)| {
            t.with_target(name.clone(), level_of(section))
        })
}

fn console_targets(cfg: &LoggingConfig) -> Targets {
    build_targets(cfg, |s| level_filter(&s.console_level))
}

fn file_targets(cfg: &LoggingConfig) -> Targets {
    build_targets(cfg, |s| {
        if s.file.trim().is_empty() {
            LevelFilter::OFF
        } else {
            level_filter(&s.file_level)
        }
    })
}

// -------- rotating file writers --------

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

/// Writer that drops records routed nowhere.
struct RoutedWriter(Option<RotWriter>);

impl Write for RoutedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Route records to files by target prefix; the longest matching prefix wins.
#[derive(Default)]
struct FileRouter {
    default: Option<RotWriter>,
    by_prefix: HashMap<String, RotWriter>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            let Some(writer) = open_section_writer(name, section, base_dir) else {
                continue;
            };
            if name == DEFAULT_SECTION {
                router.default = Some(writer);
            } else {
                router.by_prefix.insert(name.clone(), writer);
            }
        }
        router
    }

    fn resolve_for(&self, target: &str) -> Option<RotWriter> {
        self.by_prefix
            .iter()
            .filter(|(prefix, _)| matches_prefix(target, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, w)| w.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = RoutedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedWriter(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedWriter(self.resolve_for(meta.target()))
    }
}

fn open_section_writer(name: &str, section: &Section, base_dir: &Path) -> Option<RotWriter> {
    if section.file.trim().is_empty() {
        return None;
    }
    let log_path = resolve_against(&section.file, base_dir);
    let max_bytes = section.max_size_mb.unwrap_or(100).saturating_mul(1024 * 1024);
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(1)),
    };

    match create_rotating_writer(&log_path, usize::try_from(max_bytes).unwrap_or(usize::MAX), limit) {
        Ok(w) => Some(w),
        Err(e) => {
            // The subscriber is not installed yet.
            eprintln!(
                "Failed to init log file for section '{}': {} ({})",
                name,
                log_path.display(),
                e
            );
            None
        }
    }
}

fn create_rotating_writer(
    log_path: &Path,
    max_bytes: usize,
    limit: FileLimit,
) -> std::io::Result<RotWriter> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rot = FileRotate::new(
        log_path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

// -------- public init --------

/// Install the global subscriber.
/// - `cfg`: logging sections keyed by target prefix
/// - `base_dir`: resolves relative log file paths (usually `host.home_dir`)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging_from_config(cfg: &LoggingConfig, base_dir: &Path) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    // Bridge `log` → `tracing` before installing the subscriber.
    let _ = tracing_log::LogTracer::init();

    if cfg.is_empty() {
        let _ = fmt()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .try_init();
        return;
    }

    let console = fmt::layer()
        .with_ansi(std::io::stdout().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets(cfg));

    let router = FileRouter::build(cfg, base_dir);
    let file = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets(cfg))
    });

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init();
}
