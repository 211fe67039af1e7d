//! Manifest scanner: walks the module tree and builds the catalogue.
//!
//! Layout:
//!
//! ```text
//! <root>/<category>/<module>/manifest.json
//! <root>/<category>/<namespace>/<module>/manifest.json
//! ```
//!
//! A directory directly under a category is a module when it holds a manifest,
//! otherwise it is a namespace whose children are modules. Nothing is
//! instantiated here.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::manifest::{Manifest, ManifestError, ModuleDescriptor, DISABLE_MARKER, MANIFEST_FILES};

/// Default category directories, in scan order.
pub const DEFAULT_CATEGORIES: &[&str] = &["core", "standard", "extensions"];

/// Per-module scan failure. Never aborts the scan.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest '{}': {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },
    #[error("duplicate module id '{module_id}' at '{}'", path.display())]
    DuplicateId { module_id: String, path: PathBuf },
}

impl ScanError {
    pub fn path(&self) -> &Path {
        match self {
            ScanError::Io { path, .. }
            | ScanError::Manifest { path, .. }
            | ScanError::DuplicateId { path, .. } => path,
        }
    }
}

/// Result of one scan: the catalogue plus the modules that were rejected.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub descriptors: Vec<ModuleDescriptor>,
    pub errors: Vec<ScanError>,
}

#[derive(Debug, Clone)]
pub struct ManifestScanner {
    categories: Vec<String>,
}

impl Default for ManifestScanner {
    fn default() -> Self {
        Self::new(DEFAULT_CATEGORIES.iter().map(|c| (*c).to_string()))
    }
}

impl ManifestScanner {
    pub fn new(categories: impl IntoIterator<Item = String>) -> Self {
        Self {
            categories: categories.into_iter().collect(),
        }
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Scan `modules_root`. A missing root or category yields an empty catalogue.
    pub fn scan(&self, modules_root: &Path) -> ScanReport {
        let mut report = ScanReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        for category in &self.categories {
            let category_dir = modules_root.join(category);
            if !category_dir.is_dir() {
                tracing::debug!(category = %category, path = %category_dir.display(), "category directory not present");
                continue;
            }
            let children = match sorted_subdirs(&category_dir) {
                Ok(c) => c,
                Err(source) => {
                    push_error(&mut report, ScanError::Io { path: category_dir, source });
                    continue;
                }
            };

            for child in children {
                if find_manifest(&child).is_some() || child.join(DISABLE_MARKER).exists() {
                    self.scan_module_dir(&child, category, &mut seen, &mut report);
                    continue;
                }

                // Namespace directory: one extra nesting level.
                let namespace = dir_name(&child);
                let prefix = format!("{category}.{namespace}");
                match sorted_subdirs(&child) {
                    Ok(modules) => {
                        for module_dir in modules {
                            self.scan_module_dir(&module_dir, &prefix, &mut seen, &mut report);
                        }
                    }
                    Err(source) => push_error(&mut report, ScanError::Io { path: child, source }),
                }
            }
        }

        tracing::info!(
            modules = report.descriptors.len(),
            errors = report.errors.len(),
            root = %modules_root.display(),
            "Module scan complete"
        );
        report
    }

    fn scan_module_dir(
        &self,
        dir: &Path,
        prefix: &str,
        seen: &mut HashSet<String>,
        report: &mut ScanReport,
    ) {
        if dir.join(DISABLE_MARKER).exists() {
            tracing::info!(path = %dir.display(), "module disabled by marker; skipping");
            return;
        }
        let Some(manifest_path) = find_manifest(dir) else {
            tracing::debug!(path = %dir.display(), "no manifest; not a module directory");
            return;
        };

        let content = match fs::read_to_string(&manifest_path) {
            Ok(c) => c,
            Err(source) => {
                push_error(report, ScanError::Io { path: manifest_path, source });
                return;
            }
        };

        let file_name = dir_name(&manifest_path);
        let descriptor = Manifest::parse(&file_name, &content)
            .and_then(|m| m.into_descriptor(prefix, dir.to_path_buf()));
        let descriptor = match descriptor {
            Ok(d) => d,
            Err(source) => {
                push_error(report, ScanError::Manifest { path: manifest_path, source });
                return;
            }
        };

        if !descriptor.enabled {
            tracing::debug!(module = %descriptor.module_id, "module disabled in manifest; skipping");
            return;
        }
        if !seen.insert(descriptor.module_id.clone()) {
            push_error(
                report,
                ScanError::DuplicateId {
                    module_id: descriptor.module_id,
                    path: manifest_path,
                },
            );
            return;
        }

        tracing::debug!(module = %descriptor.module_id, version = %descriptor.version, "module discovered");
        report.descriptors.push(descriptor);
    }
}

fn push_error(report: &mut ScanReport, err: ScanError) {
    tracing::warn!(error = %err, "module excluded from catalogue");
    report.errors.push(err);
}

fn find_manifest(dir: &Path) -> Option<PathBuf> {
    MANIFEST_FILES
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.is_file())
}

fn sorted_subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Convenience wrapper using [`DEFAULT_CATEGORIES`].
pub fn scan(modules_root: &Path) -> ScanReport {
    ManifestScanner::default().scan(modules_root)
}
