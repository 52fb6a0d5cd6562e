//! Release metadata providers.
//!
//! The resolver asks a [`ReleaseMetadataProvider`] to turn a package name and
//! a [`VersionSpec`] into concrete release metadata. The registry client that
//! backs this in production lives outside this crate; the providers here are
//! an in-memory index and a directory-backed repository built on top of it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::resolver::{ResolveError, VersionSpec};

/// Published metadata for one release of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    /// Package name (domain-like, e.g. `bitcoin.dnp.dappnode.eth`).
    pub name: String,

    /// Concrete version of this release.
    pub version: Version,

    /// Raw dependency block. Validated by the resolver.
    #[serde(default)]
    pub dependencies: serde_json::Value,

    /// Content hash of the container image archive.
    pub image_hash: String,

    /// Size of the image archive in bytes, when published.
    #[serde(default)]
    pub image_size: Option<u64>,

    /// Compose definition with `${KEY}` placeholders for user settings.
    pub compose_template: String,

    /// Manifest document written next to the compose file.
    #[serde(default)]
    pub manifest: serde_json::Value,

    /// Content hash identifying the release itself.
    #[serde(default)]
    pub release_hash: Option<String>,

    /// Whether this is a core system package.
    #[serde(default)]
    pub is_core: bool,
}

/// Resolves package names and version specs to release metadata.
#[async_trait]
pub trait ReleaseMetadataProvider: Send + Sync {
    /// Fetch the release matching `version`.
    ///
    /// Fails with [`ResolveError::UnknownPackage`] when nothing matches.
    async fn get_manifest(
        &self,
        name: &str,
        version: &VersionSpec,
    ) -> Result<ReleaseMetadata, ResolveError>;
}

/// In-memory release index.
#[derive(Debug, Default)]
pub struct InMemoryReleaseProvider {
    releases: HashMap<String, Vec<ReleaseMetadata>>,
    lookups: AtomicUsize,
}

impl InMemoryReleaseProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a release, replacing any release with the same name and version.
    pub fn insert(&mut self, release: ReleaseMetadata) {
        let entry = self.releases.entry(release.name.clone()).or_default();
        entry.retain(|r| r.version != release.version);
        entry.push(release);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_release(mut self, release: ReleaseMetadata) -> Self {
        self.insert(release);
        self
    }

    /// Number of releases indexed.
    pub fn release_count(&self) -> usize {
        self.releases.values().map(Vec::len).sum()
    }

    /// Number of lookups served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    fn select(&self, name: &str, version: &VersionSpec) -> Option<&ReleaseMetadata> {
        let candidates = self.releases.get(name)?;
        match version {
            VersionSpec::Latest => candidates.iter().max_by(|a, b| a.version.cmp(&b.version)),
            VersionSpec::Exact(v) => candidates.iter().find(|r| &r.version == v),
            VersionSpec::Range(req) => candidates
                .iter()
                .filter(|r| req.matches(&r.version))
                .max_by(|a, b| a.version.cmp(&b.version)),
            VersionSpec::ContentHash(hash) => candidates
                .iter()
                .find(|r| r.release_hash.as_deref() == Some(hash.as_str())),
        }
    }
}

#[async_trait]
impl ReleaseMetadataProvider for InMemoryReleaseProvider {
    async fn get_manifest(
        &self,
        name: &str,
        version: &VersionSpec,
    ) -> Result<ReleaseMetadata, ResolveError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        debug!(package = %name, version = %version, "Looking up release");

        self.select(name, version)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownPackage {
                name: name.to_string(),
                version: version.to_string(),
            })
    }
}

/// Errors loading a release repository from disk.
#[derive(Debug, Error)]
pub enum MetadataLoadError {
    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid release document {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Release repository stored as `<dir>/<package>/<version>.json`.
#[derive(Debug)]
pub struct DirectoryReleaseProvider {
    dir: PathBuf,
    index: InMemoryReleaseProvider,
}

impl DirectoryReleaseProvider {
    /// Load every release document under `dir`.
    ///
    /// A missing directory yields an empty repository.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, MetadataLoadError> {
        let dir = dir.into();
        let mut index = InMemoryReleaseProvider::new();

        if dir.exists() {
            for package_dir in read_dir(&dir)? {
                if !package_dir.is_dir() {
                    continue;
                }
                for doc in read_dir(&package_dir)? {
                    if doc.extension().map(|e| e == "json").unwrap_or(false) {
                        index.insert(read_release(&doc)?);
                    }
                }
            }
        }

        info!(
            dir = %dir.display(),
            releases = index.release_count(),
            "Loaded release repository"
        );

        Ok(Self { dir, index })
    }

    /// Repository root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ReleaseMetadataProvider for DirectoryReleaseProvider {
    async fn get_manifest(
        &self,
        name: &str,
        version: &VersionSpec,
    ) -> Result<ReleaseMetadata, ResolveError> {
        self.index.get_manifest(name, version).await
    }
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, MetadataLoadError> {
    let io_err = |source| MetadataLoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        paths.push(entry.map_err(io_err)?.path());
    }
    paths.sort();
    Ok(paths)
}

fn read_release(path: &Path) -> Result<ReleaseMetadata, MetadataLoadError> {
    let bytes = fs::read(path).map_err(|source| MetadataLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| MetadataLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn release(name: &str, version: &str) -> ReleaseMetadata {
        ReleaseMetadata {
            name: name.to_string(),
            version: Version::parse(version).unwrap(),
            dependencies: serde_json::json!({}),
            image_hash: format!("sha256:{}", "0".repeat(64)),
            image_size: None,
            compose_template: "services: {}".to_string(),
            manifest: serde_json::json!({ "name": name, "version": version }),
            release_hash: None,
            is_core: false,
        }
    }

    fn provider() -> InMemoryReleaseProvider {
        let mut hashed = release("app.dnp.dappnode.eth", "0.9.0");
        hashed.release_hash = Some("/ipfs/QmPinned".to_string());

        InMemoryReleaseProvider::new()
            .with_release(release("app.dnp.dappnode.eth", "1.0.0"))
            .with_release(release("app.dnp.dappnode.eth", "1.2.0"))
            .with_release(release("app.dnp.dappnode.eth", "2.0.0"))
            .with_release(hashed)
    }

    #[tokio::test]
    async fn test_latest_picks_highest() {
        let p = provider();
        let r = p
            .get_manifest("app.dnp.dappnode.eth", &VersionSpec::Latest)
            .await
            .unwrap();
        assert_eq!(r.version, Version::new(2, 0, 0));
    }

    #[tokio::test]
    async fn test_range_picks_highest_match() {
        let p = provider();
        let spec: VersionSpec = "^1.0".parse().unwrap();
        let r = p.get_manifest("app.dnp.dappnode.eth", &spec).await.unwrap();
        assert_eq!(r.version, Version::new(1, 2, 0));
    }

    #[tokio::test]
    async fn test_content_hash_lookup() {
        let p = provider();
        let spec = VersionSpec::ContentHash("/ipfs/QmPinned".to_string());
        let r = p.get_manifest("app.dnp.dappnode.eth", &spec).await.unwrap();
        assert_eq!(r.version, Version::new(0, 9, 0));
    }

    #[tokio::test]
    async fn test_unknown_package() {
        let p = provider();
        let err = p
            .get_manifest("missing.dnp.dappnode.eth", &VersionSpec::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownPackage { .. }));

        let err = p
            .get_manifest("app.dnp.dappnode.eth", &"3.0.0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownPackage { .. }));
        assert_eq!(p.lookup_count(), 2);
    }

    #[test]
    fn test_insert_replaces_same_version() {
        let mut p = InMemoryReleaseProvider::new();
        p.insert(release("a", "1.0.0"));
        p.insert(release("a", "1.0.0"));
        assert_eq!(p.release_count(), 1);
    }

    #[tokio::test]
    async fn test_directory_provider_loads_documents() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("app.dnp.dappnode.eth");
        fs::create_dir_all(&pkg_dir).unwrap();
        for v in ["1.0.0", "1.1.0"] {
            let doc = serde_json::to_vec(&release("app.dnp.dappnode.eth", v)).unwrap();
            fs::write(pkg_dir.join(format!("{v}.json")), doc).unwrap();
        }
        fs::write(pkg_dir.join("README.md"), "ignored").unwrap();

        let p = DirectoryReleaseProvider::load(temp.path()).unwrap();
        let r = p
            .get_manifest("app.dnp.dappnode.eth", &VersionSpec::Latest)
            .await
            .unwrap();
        assert_eq!(r.version, Version::new(1, 1, 0));
    }

    #[test]
    fn test_directory_provider_rejects_bad_document() {
        let temp = TempDir::new().unwrap();
        let pkg_dir = temp.path().join("broken");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(pkg_dir.join("1.0.0.json"), "{ not json").unwrap();

        let err = DirectoryReleaseProvider::load(temp.path()).unwrap_err();
        assert!(matches!(err, MetadataLoadError::Parse { .. }));
    }

    #[test]
    fn test_directory_provider_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let p = DirectoryReleaseProvider::load(temp.path().join("nope")).unwrap();
        assert_eq!(p.index.release_count(), 0);
    }
}
