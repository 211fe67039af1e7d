//! On-disk module manifests and the immutable descriptor built from them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Manifest file names, in lookup precedence order.
pub const MANIFEST_FILES: &[&str] = &["manifest.json", "manifest.yaml", "manifest.yml"];

/// Presence of this file in a module directory excludes the module from scanning.
pub const DISABLE_MARKER: &str = ".disabled";

/// Raw manifest as written by module authors.
///
/// Required fields are modelled as `Option` so that a missing field is reported
/// by name instead of as an opaque deserialization error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Manifest {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub entry_point: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("unsupported manifest format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid JSON manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },
    #[error("invalid module id '{0}': only ASCII letters, digits, '_' and '-' are allowed")]
    InvalidId(String),
}

impl Manifest {
    /// Parse manifest text; the format is picked from the file name.
    pub fn parse(file_name: &str, content: &str) -> Result<Self, ManifestError> {
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(content)?),
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(content)?),
            _ => Err(ManifestError::UnsupportedFormat(file_name.to_string())),
        }
    }

    /// Validate required fields and build a descriptor under the given id prefix
    /// (`"core"` or `"core.storage"`).
    pub fn into_descriptor(
        self,
        prefix: &str,
        path: PathBuf,
    ) -> Result<ModuleDescriptor, ManifestError> {
        let local_id = required(self.id, "id")?;
        if !is_valid_local_id(&local_id) {
            return Err(ManifestError::InvalidId(local_id));
        }
        let name = required(self.name, "name")?;
        let version = required(self.version, "version")?;
        if let Err(e) = semver::Version::parse(&version) {
            return Err(ManifestError::InvalidVersion {
                version,
                reason: e.to_string(),
            });
        }
        let entry_point = required(self.entry_point, "entry_point")?;

        let mut dependencies: Vec<String> = Vec::with_capacity(self.dependencies.len());
        for dep in self.dependencies {
            let dep = dep.trim().to_string();
            if !dep.is_empty() && !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        Ok(ModuleDescriptor {
            module_id: format!("{prefix}.{local_id}"),
            name,
            version,
            description: self.description.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            dependencies,
            entry_point,
            enabled: self.enabled,
            path,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ManifestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ManifestError::MissingField(field)),
    }
}

fn is_valid_local_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Static description of one module. Immutable after scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleDescriptor {
    /// Globally unique, namespaced id, e.g. `core.database`.
    pub module_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    /// Ordered, de-duplicated ids of modules that must load first.
    pub dependencies: Vec<String>,
    /// Key into the [`EntryPointTable`](crate::host::EntryPointTable).
    pub entry_point: String,
    pub enabled: bool,
    /// Module directory; diagnostics only.
    pub path: PathBuf,
}

impl ModuleDescriptor {
    /// Build a descriptor in code (tests, embedded catalogues).
    pub fn new(
        module_id: impl Into<String>,
        entry_point: impl Into<String>,
        dependencies: &[&str],
    ) -> Self {
        let module_id = module_id.into();
        Self {
            name: module_id.clone(),
            module_id,
            version: "0.1.0".to_string(),
            description: String::new(),
            author: String::new(),
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
            entry_point: entry_point.into(),
            enabled: true,
            path: PathBuf::new(),
        }
    }
}
