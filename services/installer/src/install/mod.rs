//! Install orchestration.
//!
//! One install request becomes one batch: every package in the resolved
//! [`InstallOrder`](crate::resolver::InstallOrder) goes through the same
//! phases, and no phase starts before the previous one finished for the
//! whole batch.
//!
//! ```text
//! resolve ─► lock ─► download (concurrent) ─► configure ─► run (in order)
//!                                                 │            │
//!                                                 └── rollback ◄┘ (reverse order)
//! ```
//!
//! Locks are released when the batch ends, whatever the outcome.

mod files;
mod lock;
mod task;
mod template;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use semver::Version;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub use files::{backup_path, FileWriter, FsFileWriter, BACKUP_SUFFIX};
pub use lock::{BatchLock, InstallationLockTable};
pub use task::{InstallPaths, InstallTask, TargetPaths, TaskStatus, DEFAULT_ROOT_DIR};
pub use template::render_compose;

use crate::fetcher::{ContentFetcher, FetchError, FetchOutcome};
use crate::progress::ProgressSink;
use crate::resolver::{InstallOrder, PackageRequest, ResolveError, Resolver, VersionSpec};
use crate::runtime::ContainerRuntime;

/// Install errors.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("download failed for {name}: {source}")]
    Download {
        name: String,
        #[source]
        source: FetchError,
    },

    #[error("already installing: {}", names.join(", "))]
    AlreadyInstalling { names: Vec<String> },

    #[error("core package {name} cannot be installed by content hash")]
    CoreRestricted { name: String },

    #[error("runtime error for {name}: {source}")]
    Runtime {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("file error at {}: {source}", path.display())]
    Files {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Install only the requested package, ignoring its dependencies.
    pub bypass_resolver: bool,
    /// Allow core packages to be installed by content hash.
    pub bypass_core_restriction: bool,
}

/// An install request.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub name: String,
    pub version: VersionSpec,
    /// Compose template settings, per package name.
    pub user_settings: BTreeMap<String, BTreeMap<String, String>>,
    pub options: InstallOptions,
}

impl InstallRequest {
    pub fn new(name: impl Into<String>, version: VersionSpec) -> Self {
        Self {
            name: name.into(),
            version,
            user_settings: BTreeMap::new(),
            options: InstallOptions::default(),
        }
    }

    pub fn with_setting(
        mut self,
        package: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.user_settings
            .entry(package.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }
}

/// One package of a completed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Version,
    pub status: TaskStatus,
}

/// Result of a successful install, in install order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub packages: Vec<InstalledPackage>,
}

impl InstallReport {
    pub fn names(&self) -> Vec<String> {
        self.packages.iter().map(|p| p.name.clone()).collect()
    }
}

/// Install orchestrator.
#[derive(Clone)]
pub struct Installer {
    resolver: Resolver,
    fetcher: ContentFetcher,
    files: Arc<dyn FileWriter>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: Arc<InstallationLockTable>,
    paths: InstallPaths,
}

impl Installer {
    pub fn new(
        resolver: Resolver,
        fetcher: ContentFetcher,
        files: Arc<dyn FileWriter>,
        runtime: Arc<dyn ContainerRuntime>,
        paths: InstallPaths,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            files,
            runtime,
            locks: Arc::new(InstallationLockTable::new()),
            paths,
        }
    }

    /// Share a lock table with other installers.
    pub fn with_lock_table(mut self, locks: Arc<InstallationLockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn lock_table(&self) -> &Arc<InstallationLockTable> {
        &self.locks
    }

    pub fn paths(&self) -> &InstallPaths {
        &self.paths
    }

    /// Resolve and install `request` with all of its dependencies.
    pub async fn install(
        &self,
        request: &InstallRequest,
        progress: &ProgressSink,
    ) -> Result<InstallReport, InstallError> {
        let package = PackageRequest::new(request.name.clone(), request.version.clone());
        let resolution = if request.options.bypass_resolver {
            self.resolver.resolve_root_only(&package).await?
        } else {
            self.resolver.resolve(&package).await?
        };

        if !request.options.bypass_core_restriction {
            check_core_restriction(&resolution.order)?;
        }

        let names = resolution.order.names();
        let _lock = self
            .locks
            .try_acquire(&names)
            .map_err(|names| InstallError::AlreadyInstalling { names })?;

        info!(package = %request.name, batch = ?names, "Starting install");

        let mut tasks: Vec<InstallTask> = resolution
            .order
            .iter()
            .map(|node| InstallTask::new(node, self.paths.targets(node)))
            .collect();

        self.download(&mut tasks, progress).await?;

        if let Err(e) = self.configure(&mut tasks, &request.user_settings, progress).await {
            error!(package = %request.name, error = %e, phase = "configure", "Install failed");
            self.rollback(&mut tasks, progress).await;
            return Err(e);
        }

        if let Err(e) = self.run(&mut tasks, progress).await {
            error!(package = %request.name, error = %e, phase = "run", "Install failed");
            self.rollback(&mut tasks, progress).await;
            return Err(e);
        }

        self.discard_backups(&tasks).await;

        info!(package = %request.name, packages = tasks.len(), "Install complete");
        Ok(InstallReport {
            packages: tasks
                .into_iter()
                .map(|t| InstalledPackage {
                    name: t.name,
                    version: t.version,
                    status: t.status,
                })
                .collect(),
        })
    }

    /// Fetch every image concurrently; the first failure fails the batch.
    async fn download(
        &self,
        tasks: &mut [InstallTask],
        progress: &ProgressSink,
    ) -> Result<(), InstallError> {
        for task in tasks.iter_mut() {
            task.status = TaskStatus::Downloading;
            progress.send(&task.name, "Downloading image");
        }

        let results = join_all(tasks.iter().map(|task| {
            self.fetcher.fetch(
                &task.release.image_hash,
                &task.paths.image,
                task.release.image_size,
            )
        }))
        .await;

        let mut failure = None;
        for (task, result) in tasks.iter_mut().zip(results) {
            match result {
                Ok(outcome) => {
                    task.status = TaskStatus::Loaded;
                    let message = match outcome {
                        FetchOutcome::Skipped => "Image already downloaded".to_string(),
                        FetchOutcome::Downloaded { bytes, .. } => {
                            format!("Downloaded image ({bytes} bytes)")
                        }
                    };
                    progress.send(&task.name, message);
                }
                Err(e) => {
                    task.fail(&e);
                    progress.send(&task.name, format!("Download failed: {e}"));
                    if failure.is_none() {
                        failure = Some(InstallError::Download {
                            name: task.name.clone(),
                            source: e,
                        });
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Back up and write manifest and compose files.
    async fn configure(
        &self,
        tasks: &mut [InstallTask],
        user_settings: &BTreeMap<String, BTreeMap<String, String>>,
        progress: &ProgressSink,
    ) -> Result<(), InstallError> {
        let no_settings = BTreeMap::new();

        for task in tasks.iter_mut() {
            let settings = user_settings.get(&task.name).unwrap_or(&no_settings);
            if let Err(e) = self.configure_task(task, settings).await {
                task.fail(&e);
                return Err(e);
            }
            task.status = TaskStatus::Configured;
            progress.send(&task.name, "Configured");
        }
        Ok(())
    }

    async fn configure_task(
        &self,
        task: &mut InstallTask,
        settings: &BTreeMap<String, String>,
    ) -> Result<(), InstallError> {
        let manifest = &task.paths.manifest;
        let compose = &task.paths.compose;

        task.manifest_backup = self
            .files
            .backup_if_exists(manifest)
            .await
            .map_err(|e| files_error(manifest, e))?;
        task.compose_backup = self
            .files
            .backup_if_exists(compose)
            .await
            .map_err(|e| files_error(compose, e))?;

        let manifest_json = serde_json::to_vec_pretty(&task.release.manifest)
            .map_err(|e| files_error(manifest, io::Error::other(e)))?;
        let rendered = render_compose(&task.release.compose_template, settings);

        task.files_touched = true;
        self.files
            .write(manifest, &manifest_json)
            .await
            .map_err(|e| files_error(manifest, e))?;
        self.files
            .write(compose, rendered.as_bytes())
            .await
            .map_err(|e| files_error(compose, e))?;
        Ok(())
    }

    /// Load and start every package, dependencies first.
    async fn run(
        &self,
        tasks: &mut [InstallTask],
        progress: &ProgressSink,
    ) -> Result<(), InstallError> {
        for task in tasks.iter_mut() {
            if let Err(e) = self.runtime.load_image(&task.paths.image).await {
                return Err(runtime_failure(task, e, progress));
            }

            task.started = true;
            if let Err(e) = self.runtime.start(&task.paths.compose).await {
                return Err(runtime_failure(task, e, progress));
            }

            task.status = TaskStatus::Running;
            info!(package = %task.name, version = %task.version, "Package running");
            progress.send(&task.name, "Running");
        }
        Ok(())
    }

    /// Undo the batch in reverse order. Best effort: step failures are
    /// reported and skipped.
    async fn rollback(&self, tasks: &mut [InstallTask], progress: &ProgressSink) {
        for task in tasks.iter_mut().rev() {
            if task.started {
                let stopped = self.runtime.stop(&task.paths.compose).await;
                self.rollback_step(task, progress, "stop", stopped);
                let removed = self.runtime.remove(&task.paths.compose).await;
                self.rollback_step(task, progress, "remove", removed);
            }

            let manifest = self
                .restore_or_delete(
                    &task.paths.manifest,
                    task.manifest_backup.as_deref(),
                    task.files_touched,
                )
                .await;
            self.rollback_step(task, progress, "restore manifest", manifest);
            let compose = self
                .restore_or_delete(
                    &task.paths.compose,
                    task.compose_backup.as_deref(),
                    task.files_touched,
                )
                .await;
            self.rollback_step(task, progress, "restore compose", compose);

            if task.started && task.compose_backup.is_some() {
                let restart = self.runtime.start(&task.paths.compose).await;
                self.rollback_step(task, progress, "restart previous version", restart);
            }

            task.status = TaskStatus::RolledBack;
            progress.send(&task.name, "Rolled back");
        }
    }

    /// Put back a backed-up file, or delete a freshly written one. A file that
    /// was neither backed up nor written is left alone.
    async fn restore_or_delete(
        &self,
        path: &Path,
        backup: Option<&Path>,
        written: bool,
    ) -> anyhow::Result<()> {
        match (backup, written) {
            (Some(backup), _) => self.files.restore(backup, path).await?,
            (None, true) => self.files.delete(path).await?,
            (None, false) => {}
        }
        Ok(())
    }

    fn rollback_step(
        &self,
        task: &InstallTask,
        progress: &ProgressSink,
        step: &str,
        result: anyhow::Result<()>,
    ) {
        if let Err(e) = result {
            warn!(package = %task.name, step, error = %e, "Rollback step failed");
            progress.send(&task.name, format!("Rollback step '{step}' failed: {e}"));
        }
    }

    async fn discard_backups(&self, tasks: &[InstallTask]) {
        for task in tasks {
            for backup in [&task.manifest_backup, &task.compose_backup].into_iter().flatten() {
                if let Err(e) = self.files.delete(backup).await {
                    warn!(
                        package = %task.name,
                        backup = %backup.display(),
                        error = %e,
                        "Failed to remove backup"
                    );
                }
            }
        }
    }
}

/// Refuse core packages pinned by content hash.
fn check_core_restriction(order: &InstallOrder) -> Result<(), InstallError> {
    match order
        .iter()
        .find(|node| node.release.is_core && matches!(node.spec, VersionSpec::ContentHash(_)))
    {
        Some(node) => Err(InstallError::CoreRestricted {
            name: node.name.clone(),
        }),
        None => Ok(()),
    }
}

fn runtime_failure(
    task: &mut InstallTask,
    source: anyhow::Error,
    progress: &ProgressSink,
) -> InstallError {
    task.fail(&source);
    progress.send(&task.name, format!("Failed: {source}"));
    InstallError::Runtime {
        name: task.name.clone(),
        source,
    }
}

fn files_error(path: &Path, source: io::Error) -> InstallError {
    InstallError::Files {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ReleaseMetadata;
    use crate::resolver::{ResolvedNode, ResolvedSet};

    fn order_with(name: &str, spec: VersionSpec, is_core: bool) -> InstallOrder {
        let version = Version::new(1, 0, 0);
        let mut set = ResolvedSet::new();
        set.offer(ResolvedNode {
            name: name.to_string(),
            version: version.clone(),
            spec,
            release: Arc::new(ReleaseMetadata {
                name: name.to_string(),
                version,
                dependencies: serde_json::Value::Null,
                image_hash: String::new(),
                image_size: None,
                compose_template: String::new(),
                manifest: serde_json::Value::Null,
                release_hash: None,
                is_core,
            }),
            dependencies: BTreeMap::new(),
        });
        InstallOrder::compute(&set).unwrap()
    }

    #[test]
    fn test_core_by_hash_is_restricted() {
        let spec = VersionSpec::ContentHash("/ipfs/Qm1".into());
        let order = order_with("core.dnp.dappnode.eth", spec, true);
        assert!(matches!(
            check_core_restriction(&order),
            Err(InstallError::CoreRestricted { .. })
        ));
    }

    #[test]
    fn test_core_by_version_is_allowed() {
        let order = order_with("core.dnp.dappnode.eth", VersionSpec::Latest, true);
        assert!(check_core_restriction(&order).is_ok());
    }

    #[test]
    fn test_regular_by_hash_is_allowed() {
        let spec = VersionSpec::ContentHash("/ipfs/Qm1".into());
        let order = order_with("a.dnp.dappnode.eth", spec, false);
        assert!(check_core_restriction(&order).is_ok());
    }

    #[test]
    fn test_request_builder() {
        let request = InstallRequest::new("a", VersionSpec::Latest)
            .with_setting("a", "PORT", "80")
            .with_options(InstallOptions {
                bypass_resolver: true,
                ..Default::default()
            });
        assert_eq!(request.user_settings["a"]["PORT"], "80");
        assert!(request.options.bypass_resolver);
    }
}
