//! Per-package install tasks and the on-disk layout they write to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use serde::Serialize;

use super::files::backup_path;
use crate::metadata::ReleaseMetadata;
use crate::resolver::ResolvedNode;

/// Default install root.
pub const DEFAULT_ROOT_DIR: &str = "/usr/src/dappnode";

/// Task state within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Loaded,
    Configured,
    Running,
    Failed,
    RolledBack,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Loaded => "loaded",
            TaskStatus::Configured => "configured",
            TaskStatus::Running => "running",
            TaskStatus::Failed => "failed",
            TaskStatus::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// Files one package owns on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    pub manifest: PathBuf,
    pub manifest_backup: PathBuf,
    pub compose: PathBuf,
    pub compose_backup: PathBuf,
    pub image: PathBuf,
}

/// Install layout under a root directory.
///
/// ```text
/// <root>/dnp_repo/<name>/dappnode_package-<short>.json
/// <root>/dnp_repo/<name>/docker-compose-<short>.yml
/// <root>/dnp_repo/<name>/<name>_<version>.tar.xz
/// <root>/DNCORE/...                                  (core packages)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    root: PathBuf,
}

impl Default for InstallPaths {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_DIR)
    }
}

impl InstallPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a package's files.
    pub fn package_dir(&self, name: &str, is_core: bool) -> PathBuf {
        if is_core {
            self.root.join("DNCORE")
        } else {
            self.root.join("dnp_repo").join(name)
        }
    }

    pub fn manifest_path(&self, name: &str, is_core: bool) -> PathBuf {
        self.package_dir(name, is_core)
            .join(format!("dappnode_package-{}.json", short_name(name)))
    }

    pub fn compose_path(&self, name: &str, is_core: bool) -> PathBuf {
        self.package_dir(name, is_core)
            .join(format!("docker-compose-{}.yml", short_name(name)))
    }

    pub fn image_path(&self, name: &str, version: &Version, is_core: bool) -> PathBuf {
        self.package_dir(name, is_core)
            .join(format!("{name}_{version}.tar.xz"))
    }

    /// Every path a resolved package is installed to.
    pub fn targets(&self, node: &ResolvedNode) -> TargetPaths {
        let is_core = node.release.is_core;
        let manifest = self.manifest_path(&node.name, is_core);
        let compose = self.compose_path(&node.name, is_core);
        TargetPaths {
            manifest_backup: backup_path(&manifest),
            compose_backup: backup_path(&compose),
            image: self.image_path(&node.name, &node.version, is_core),
            manifest,
            compose,
        }
    }
}

/// Name up to the first `.`: `bitcoin.dnp.dappnode.eth` -> `bitcoin`.
fn short_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// Install state of one package in a batch.
#[derive(Debug, Clone)]
pub struct InstallTask {
    pub name: String,
    pub version: Version,
    pub release: Arc<ReleaseMetadata>,
    pub paths: TargetPaths,
    pub status: TaskStatus,
    pub error: Option<String>,

    /// Backups taken during configure, if a previous file existed.
    pub manifest_backup: Option<PathBuf>,
    pub compose_backup: Option<PathBuf>,

    /// Configure began writing new content over this task's files. Backups
    /// are tracked separately, so a failed backup still gets restored.
    pub files_touched: bool,

    /// A start was attempted in this batch.
    pub started: bool,
}

impl InstallTask {
    pub fn new(node: &ResolvedNode, paths: TargetPaths) -> Self {
        Self {
            name: node.name.clone(),
            version: node.version.clone(),
            release: node.release.clone(),
            paths,
            status: TaskStatus::Pending,
            error: None,
            manifest_backup: None,
            compose_backup: None,
            files_touched: false,
            started: false,
        }
    }

    pub(crate) fn fail(&mut self, error: &impl std::fmt::Display) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
    }
}
