//! Durable channel state: per-package declaration files (the operator's
//! intent) and per-package state files (the machine's progress). Both live as
//! one file per package, keyed by the canonical package name, and every write
//! is atomic (tmp file + rename) so a crash can never leave a half-written
//! document behind.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use miette::Diagnostic;
use pep440_rs::VersionSpecifiers;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NormalizedPackageName, WheelFilename};

/// After this many failures a wheel is skipped permanently.
pub const RETRY_LIMIT: u32 = 3;

/// One wheel the operator asked to have converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredWheel {
    /// The upstream wheel filename.
    pub filename: String,
}

impl DeclaredWheel {
    /// The version encoded in the wheel filename.
    pub fn version(&self) -> Option<pep440_rs::Version> {
        self.filename
            .parse::<WheelFilename>()
            .ok()
            .map(|name| name.version)
    }
}

/// The operator-maintained declaration of a tracked package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageDeclaration {
    /// Name under which the external conda ecosystem publishes this package.
    /// When set, the package is deferred to that ecosystem and never
    /// converted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_forge: Option<String>,

    /// Version constraint; the empty string means any version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version_constraint: String,

    /// Version strings the operator chose to skip.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_versions: Vec<String>,

    /// The wheels to convert, newest first by convention.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wheels: Vec<DeclaredWheel>,
}

impl PackageDeclaration {
    /// The parsed version constraint; `None` means unconstrained.
    pub fn constraint(&self) -> Option<VersionSpecifiers> {
        if self.version_constraint.is_empty() {
            return None;
        }
        VersionSpecifiers::from_str(&self.version_constraint).ok()
    }
}

/// Conversion progress of one wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WheelStatus {
    /// Declared but not yet converted.
    Pending,
    /// Successfully converted into the channel.
    Converted,
    /// The last attempt failed; will be retried.
    Failed,
    /// Failed [`RETRY_LIMIT`] times; permanently abandoned.
    Skipped,
}

/// The translated dependency summary of a converted wheel. Names only; used
/// by closure validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySummary {
    /// Unconditional runtime dependencies.
    #[serde(default)]
    pub required: Vec<String>,
    /// Optional dependencies, per extra.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub optional: IndexMap<String, Vec<String>>,
}

/// Durable per-wheel record. Absent fields are omitted from the serialized
/// document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelState {
    /// Where the wheel is in the conversion state machine.
    pub status: WheelStatus,

    /// Upstream SHA-256 of the wheel file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Upstream upload timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_time: Option<DateTime<Utc>>,

    /// When the conversion finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_at: Option<DateTime<Utc>>,

    /// Filename of the produced `.conda` file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_file: Option<String>,

    /// Channel subdirectory the package landed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,

    /// Translated dependency summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<DependencySummary>,

    /// The raw requirement strings, verbatim, for audit and re-translation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_requirements: Option<Vec<String>>,

    /// The last error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// How many times conversion has failed. Durable across runs; never reset
    /// by pending recomputation.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
}

fn is_zero(count: &u32) -> bool {
    *count == 0
}

impl Default for WheelStatus {
    fn default() -> Self {
        WheelStatus::Pending
    }
}

/// Per-package wheel state, keyed by wheel filename. Insertion order is
/// preserved in the serialized document.
pub type PackageState = IndexMap<String, WheelState>;

/// Errors from the state store.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum StateError {
    #[error("package declaration not found: {0}")]
    MissingDeclaration(PathBuf),

    #[error("corrupt declaration file {path}: {message}")]
    CorruptDeclaration { path: PathBuf, message: String },

    #[error("corrupt state file {path}: {message}")]
    CorruptState { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The two on-disk surfaces: `<packages>/<name>.toml` declarations and
/// `<state>/<name>.json` state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    packages_dir: PathBuf,
    state_dir: PathBuf,
}

impl StateStore {
    /// Creates a store over the given directories. Nothing is touched until
    /// the first write.
    pub fn new(packages_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            packages_dir: packages_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// The set of declared packages: the file stems of the declarations
    /// directory, sorted.
    pub fn list_packages(&self) -> Result<Vec<NormalizedPackageName>, StateError> {
        let mut names = Vec::new();
        let entries = match fs_err::read_dir(&self.packages_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if let Ok(name) = NormalizedPackageName::from_str(stem) {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn declaration_path(&self, name: &NormalizedPackageName) -> PathBuf {
        self.packages_dir.join(format!("{name}.toml"))
    }

    fn state_path(&self, name: &NormalizedPackageName) -> PathBuf {
        self.state_dir.join(format!("{name}.json"))
    }

    /// Loads a package declaration. Absence is an error: operations on a
    /// package require its declaration to exist.
    pub fn load_declaration(
        &self,
        name: &NormalizedPackageName,
    ) -> Result<PackageDeclaration, StateError> {
        let path = self.declaration_path(name);
        let content = match fs_err::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::MissingDeclaration(path))
            }
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&content).map_err(|err| StateError::CorruptDeclaration {
            path,
            message: err.to_string(),
        })
    }

    /// Writes a package declaration atomically.
    pub fn save_declaration(
        &self,
        name: &NormalizedPackageName,
        declaration: &PackageDeclaration,
    ) -> Result<(), StateError> {
        let content =
            toml::to_string_pretty(declaration).expect("declarations always serialize");
        write_atomically(
            &self.packages_dir,
            &self.declaration_path(name),
            content.as_bytes(),
        )
    }

    /// True when a declaration exists for this package.
    pub fn has_declaration(&self, name: &NormalizedPackageName) -> bool {
        self.declaration_path(name).exists()
    }

    /// Loads the state of a package. A missing file is an empty state; a
    /// file that does not deserialize is corruption and is never rewritten
    /// here.
    pub fn load_state(&self, name: &NormalizedPackageName) -> Result<PackageState, StateError> {
        let path = self.state_path(name);
        let content = match fs_err::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PackageState::default())
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&content).map_err(|err| StateError::CorruptState {
            path,
            message: err.to_string(),
        })
    }

    /// Writes the state of a package atomically.
    pub fn save_state(
        &self,
        name: &NormalizedPackageName,
        state: &PackageState,
    ) -> Result<(), StateError> {
        let content = serde_json::to_vec_pretty(state).expect("state always serializes");
        write_atomically(&self.state_dir, &self.state_path(name), &content)
    }

    /// For every package with at least one converted wheel, reports the
    /// required dependencies that are not themselves declared. Results are
    /// grouped by package; packages with a complete closure are absent.
    pub fn validate_dependencies(
        &self,
    ) -> Result<IndexMap<NormalizedPackageName, Vec<String>>, StateError> {
        let packages = self.list_packages()?;
        let mut missing: IndexMap<NormalizedPackageName, Vec<String>> = IndexMap::new();

        for package in &packages {
            let state = self.load_state(package)?;
            let Some(summary) = state
                .values()
                .find(|wheel| wheel.status == WheelStatus::Converted && wheel.dependencies.is_some())
                .and_then(|wheel| wheel.dependencies.as_ref())
            else {
                continue;
            };

            let mut unmet = Vec::new();
            for dep in &summary.required {
                let name = dependency_name(dep);
                let normalized = name.to_lowercase().replace('_', "-");
                if !packages.iter().any(|p| p.as_str() == normalized) {
                    unmet.push(name.to_owned());
                }
            }
            if !unmet.is_empty() {
                missing.insert(package.clone(), unmet);
            }
        }

        Ok(missing)
    }
}

/// Strips version specifiers, extras brackets and selector text off a
/// dependency string, leaving the bare name.
fn dependency_name(dep: &str) -> &str {
    let end = dep
        .find(['[', '<', '>', '=', '!', '~', ';', ' '])
        .unwrap_or(dep.len());
    dep[..end].trim()
}

/// Writes via a sibling temp file and renames over the target, so readers
/// observe either the old or the new document, never a torn one.
fn write_atomically(dir: &Path, path: &Path, content: &[u8]) -> Result<(), StateError> {
    fs_err::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.persist(path).map_err(|err| StateError::Io(err.error))?;
    Ok(())
}

/// The wheels of a declaration that still need conversion: everything not
/// converted, not skipped, and not failed past the retry limit.
pub fn pending_wheels(
    declaration: &PackageDeclaration,
    state: &PackageState,
) -> Vec<DeclaredWheel> {
    declaration
        .wheels
        .iter()
        .filter(|wheel| match state.get(&wheel.filename) {
            Some(wheel_state) => match wheel_state.status {
                WheelStatus::Converted | WheelStatus::Skipped => false,
                WheelStatus::Failed => wheel_state.retry_count < RETRY_LIMIT,
                WheelStatus::Pending => true,
            },
            None => true,
        })
        .cloned()
        .collect()
}

/// Records a failed conversion attempt, bumping the durable retry counter.
/// The wheel becomes `skipped` permanently once the counter reaches
/// [`RETRY_LIMIT`]. Upstream facts (hash, upload time) survive the
/// transition.
pub fn record_failure(state: &mut PackageState, filename: &str, error: String) {
    let existing = state.get(filename);
    let retry_count = existing.map_or(0, |s| s.retry_count) + 1;
    let status = if retry_count < RETRY_LIMIT {
        WheelStatus::Failed
    } else {
        WheelStatus::Skipped
    };
    state.insert(
        filename.to_owned(),
        WheelState {
            status,
            sha256: existing.and_then(|s| s.sha256.clone()),
            upload_time: existing.and_then(|s| s.upload_time),
            error: Some(error),
            retry_count,
            ..WheelState::default()
        },
    );
}
