//! The sync orchestrator: walks declarations, finds wheels that still need
//! conversion, and drives them through download → convert → state persist
//! under a bounded-parallelism executor.
//!
//! Failures are scoped per wheel and become state transitions (`failed`,
//! then `skipped` once the retry budget is spent); they never abort the sync.
//! State files have a single writer at a time: all read-modify-write cycles
//! for a package go through one mutex.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use indexmap::IndexMap;
use miette::Diagnostic;
use pep440_rs::VersionSpecifiers;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::convert::{convert_wheel, ConversionResult, OutputLocation, WheelSource};
use crate::index::{PyPiClient, PyPiError};
use crate::state::{
    pending_wheels, record_failure, DependencySummary, PackageState, StateError, StateStore,
    WheelState, WheelStatus,
};
use crate::types::{NormalizedPackageName, WheelFilename};
use crate::utils::ChannelReader;

/// Knobs for a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Enumerate and report, but neither download nor write state.
    pub dry_run: bool,
    /// Bound on concurrently processed wheels.
    pub concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: 10,
        }
    }
}

/// Per-package outcome of a sync run.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Wheel filenames converted in this run.
    pub converted: Vec<String>,
    /// Wheel filenames that failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Wheel filenames that crossed the retry limit in this run.
    pub skipped: Vec<String>,
    /// Set when the package could not be processed at all (corrupt state,
    /// vanished declaration); its wheels were not attempted.
    pub halted: Option<String>,
}

/// Fatal sync errors. Everything wheel-scoped is reported through
/// [`SyncOutcome`] instead.
#[derive(Debug, Error, Diagnostic)]
#[allow(missing_docs)]
pub enum SyncError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Orchestrates conversions for the channel rooted at `channel_dir`.
pub struct Syncer {
    store: StateStore,
    pypi: PyPiClient,
    channel_dir: PathBuf,
}

struct WheelTask {
    package: NormalizedPackageName,
    filename: String,
}

impl Syncer {
    /// Creates an orchestrator over the given state store and channel root.
    pub fn new(store: StateStore, pypi: PyPiClient, channel_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            pypi,
            channel_dir: channel_dir.into(),
        }
    }

    /// Syncs every declared package. Packages with an external-ecosystem
    /// mapping are never converted here and are skipped.
    pub async fn sync_all(
        &self,
        options: &SyncOptions,
    ) -> Result<IndexMap<NormalizedPackageName, SyncOutcome>, SyncError> {
        let packages = self.store.list_packages()?;
        self.sync_packages(&packages, options).await
    }

    /// Syncs a single package by name.
    pub async fn sync_package(
        &self,
        package: NormalizedPackageName,
        options: &SyncOptions,
    ) -> Result<SyncOutcome, SyncError> {
        // A missing declaration is fatal for a directly requested package.
        self.store.load_declaration(&package)?;
        let mut outcomes = self.sync_packages(std::slice::from_ref(&package), options).await?;
        Ok(outcomes.shift_remove(&package).unwrap_or_default())
    }

    async fn sync_packages(
        &self,
        packages: &[NormalizedPackageName],
        options: &SyncOptions,
    ) -> Result<IndexMap<NormalizedPackageName, SyncOutcome>, SyncError> {
        let mut outcomes: IndexMap<NormalizedPackageName, SyncOutcome> = IndexMap::new();
        let mut tasks: Vec<WheelTask> = Vec::new();
        let mut states: HashMap<NormalizedPackageName, Arc<Mutex<PackageState>>> = HashMap::new();

        for package in packages {
            outcomes.insert(package.clone(), SyncOutcome::default());
            let declaration = match self.store.load_declaration(package) {
                Ok(declaration) => declaration,
                Err(err) => {
                    outcomes[package].halted = Some(err.to_string());
                    continue;
                }
            };
            if declaration.conda_forge.is_some() && declaration.wheels.is_empty() {
                // Pure mapping declaration; the external ecosystem provides
                // the package.
                continue;
            }
            let state = match self.store.load_state(package) {
                Ok(state) => state,
                Err(err) => {
                    outcomes[package].halted = Some(err.to_string());
                    continue;
                }
            };

            let pending = pending_wheels(&declaration, &state);
            states.insert(package.clone(), Arc::new(Mutex::new(state)));
            for wheel in pending {
                tasks.push(WheelTask {
                    package: package.clone(),
                    filename: wheel.filename,
                });
            }
        }

        if options.dry_run {
            for task in tasks {
                outcomes[&task.package].converted.push(task.filename);
            }
            return Ok(outcomes);
        }

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut in_flight: JoinSet<(
            NormalizedPackageName,
            String,
            Result<ConversionResult, String>,
        )> = JoinSet::new();

        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let pypi = self.pypi.clone();
            let store = self.store.clone();
            let state = Arc::clone(&states[&task.package]);
            let channel_dir = self.channel_dir.clone();

            in_flight.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("the semaphore is never closed");

                let result =
                    convert_one(&pypi, &task.package, &task.filename, &channel_dir).await;

                // Single writer per package: the state mutex serializes the
                // read-modify-write against concurrent wheels of the same
                // package.
                let mut state = state.lock().await;
                match &result {
                    Ok(conversion) => {
                        let sha256 = state
                            .get(&task.filename)
                            .and_then(|s| s.sha256.clone());
                        let upload_time =
                            state.get(&task.filename).and_then(|s| s.upload_time);
                        state.insert(
                            task.filename.clone(),
                            WheelState {
                                status: WheelStatus::Converted,
                                sha256,
                                upload_time,
                                converted_at: Some(Utc::now()),
                                conda_file: conversion
                                    .path
                                    .file_name()
                                    .map(|n| n.to_string_lossy().into_owned()),
                                subdir: Some(conversion.subdir.clone()),
                                dependencies: Some(summarize_dependencies(conversion)),
                                original_requirements: Some(
                                    conversion.original_requirements.clone(),
                                ),
                                error: None,
                                retry_count: 0,
                            },
                        );
                    }
                    Err(error) => record_failure(&mut state, &task.filename, error.clone()),
                }
                if let Err(err) = store.save_state(&task.package, &state) {
                    tracing::error!("failed to persist state for {}: {err}", task.package);
                }
                drop(state);

                (task.package, task.filename, result)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            let (package, filename, result) = joined.expect("sync tasks do not panic");
            let outcome = &mut outcomes[&package];
            match result {
                Ok(conversion) => {
                    tracing::info!(
                        "converted {filename} -> {}",
                        conversion.path.display()
                    );
                    outcome.converted.push(filename);
                }
                Err(error) => {
                    tracing::warn!("failed to convert {filename}: {error}");
                    let now_skipped = states
                        .get(&package)
                        .expect("state exists for every task")
                        .lock()
                        .await
                        .get(&filename)
                        .is_some_and(|s| s.status == WheelStatus::Skipped);
                    if now_skipped {
                        outcome.skipped.push(filename.clone());
                    }
                    outcome.failed.push((filename, error));
                }
            }
        }

        Ok(outcomes)
    }

    /// Reports versions available upstream that are not yet declared, per
    /// package. Reporting only; nothing is written.
    pub async fn check_for_updates(
        &self,
    ) -> Result<IndexMap<NormalizedPackageName, Vec<String>>, SyncError> {
        let mut updates: IndexMap<NormalizedPackageName, Vec<String>> = IndexMap::new();

        for package in self.store.list_packages()? {
            let declaration = match self.store.load_declaration(&package) {
                Ok(declaration) => declaration,
                Err(_) => continue,
            };
            if declaration.conda_forge.is_some() && declaration.wheels.is_empty() {
                continue;
            }
            let known: std::collections::HashSet<&str> = declaration
                .wheels
                .iter()
                .map(|w| w.filename.as_str())
                .collect();

            let releases = match self
                .pypi
                .get_matching_releases(&package, declaration.constraint().as_ref(), None, false)
                .await
            {
                Ok(releases) => releases,
                // Unreachable packages are skipped; check never fails.
                Err(_) => continue,
            };

            for release in releases {
                let version = release.version.to_string();
                if declaration.skip_versions.contains(&version) {
                    continue;
                }
                let Some(wheel) = release.best_wheel() else {
                    continue;
                };
                if !known.contains(wheel.filename.as_str()) {
                    updates.entry(package.clone()).or_default().push(version);
                }
            }
        }

        Ok(updates)
    }
}

/// Downloads one wheel and converts it into the channel. The HTTP body is
/// forwarded chunk by chunk into the blocking conversion worker; the bounded
/// channel applies backpressure when compression falls behind the download.
async fn convert_one(
    pypi: &PyPiClient,
    package: &NormalizedPackageName,
    filename: &str,
    channel_dir: &std::path::Path,
) -> Result<ConversionResult, String> {
    let wheel_url = find_wheel_url(pypi, package, filename)
        .await
        .map_err(|err| err.to_string())?;

    let body = pypi
        .stream_wheel(wheel_url)
        .await
        .map_err(|err| err.to_string())?;
    let mut body = Box::pin(body);

    let (sender, receiver) = mpsc::channel(16);
    let source = WheelSource::Stream {
        reader: Box::new(ChannelReader::new(receiver)),
        filename: filename.to_owned(),
    };
    let output = OutputLocation::Channel(channel_dir.to_path_buf());
    let conversion = tokio::task::spawn_blocking(move || convert_wheel(source, &output));

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| {
            std::io::Error::new(std::io::ErrorKind::ConnectionAborted, err.to_string())
        });
        let failed = chunk.is_err();
        if sender.send(chunk).await.is_err() || failed {
            // The converter hung up (it failed on its own) or the download
            // died; either way the join below reports the real error.
            break;
        }
    }
    drop(sender);

    conversion
        .await
        .map_err(|err| format!("conversion worker died: {err}"))?
        .map_err(|err| err.to_string())
}

/// Locates the download URL of a declared wheel by matching its filename
/// within the release carrying its version.
async fn find_wheel_url(
    pypi: &PyPiClient,
    package: &NormalizedPackageName,
    filename: &str,
) -> Result<url::Url, PyPiError> {
    let parsed: WheelFilename = filename
        .parse()
        .map_err(|_| PyPiError::NotFound(format!("{filename} is not a wheel filename")))?;
    let constraint = VersionSpecifiers::from_str(&format!("=={}", parsed.version))
        .expect("an exact version pin always parses");

    let releases = pypi
        .get_matching_releases(package, Some(&constraint), None, true)
        .await?;
    for release in releases {
        for wheel in &release.wheels {
            if wheel.filename == filename {
                return Ok(wheel.url.clone());
            }
        }
    }
    Err(PyPiError::NotFound(format!(
        "wheel not found on the index: {filename}"
    )))
}

/// Reduces translated conda dependency strings to the bare-name summary the
/// validator consumes. The leading `python` entry is not a package of the
/// channel and is left out.
fn summarize_dependencies(conversion: &ConversionResult) -> DependencySummary {
    let name_of = |dep: &String| -> Option<String> {
        let name = dep.split_whitespace().next()?.trim_end_matches(';');
        let name = name.split('[').next().unwrap_or(name);
        (name != "python").then(|| name.to_owned())
    };

    let required = conversion.dependencies.iter().filter_map(name_of).collect();
    let mut optional: IndexMap<String, Vec<String>> = IndexMap::new();
    for (extra, deps) in &conversion.extra_depends {
        let names: Vec<String> = deps.iter().filter_map(name_of).collect();
        if !names.is_empty() {
            optional.insert(extra.clone(), names);
        }
    }

    DependencySummary { required, optional }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn conversion(dependencies: Vec<&str>, extras: &[(&str, Vec<&str>)]) -> ConversionResult {
        ConversionResult {
            path: PathBuf::from("out/pkg-1.0-py_0.conda"),
            name: "pkg".parse().unwrap(),
            version: "1.0".into(),
            dependencies: dependencies.into_iter().map(String::from).collect(),
            extra_depends: extras
                .iter()
                .map(|(extra, deps)| {
                    (
                        extra.to_string(),
                        deps.iter().map(|d| d.to_string()).collect(),
                    )
                })
                .collect(),
            entry_points: Vec::new(),
            subdir: "noarch".into(),
            original_requirements: Vec::new(),
        }
    }

    #[test]
    fn test_summary_strips_python_and_specifiers() {
        let summary = summarize_dependencies(&conversion(
            vec!["python >=3.10", "requests >=2.0", "click"],
            &[],
        ));
        assert_eq!(summary.required, vec!["requests", "click"]);
    }

    #[test]
    fn test_summary_strips_extras_brackets_and_conditions() {
        let summary = summarize_dependencies(&conversion(
            vec![
                "python",
                "httpx[extras=[http2]] >=0.24",
                "pywin32; if __win",
            ],
            &[("test", vec!["pytest >=7"])],
        ));
        assert_eq!(summary.required, vec!["httpx", "pywin32"]);
        assert_eq!(summary.optional["test"], vec!["pytest"]);
    }
}
