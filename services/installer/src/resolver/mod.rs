//! Dependency resolution.
//!
//! Turns one [`PackageRequest`] into a conflict-free [`ResolvedSet`] and a
//! dependency-first [`InstallOrder`]:
//!
//! 1. Walk declared dependencies depth first with an explicit stack. Each
//!    `(name, spec)` is walked once; a dependency on a name on the active
//!    path, or on a finished subtree that reaches one, is a loop.
//! 2. Collapse the flat candidate list, keeping the highest-ranked candidate
//!    per name (see [`version::supersedes`]).
//! 3. Prune names only the discarded candidates needed.
//! 4. Order by readiness passes. A cycle among the winners is still a loop.
//!
//! Nothing here touches files or containers.

mod graph;
pub mod version;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info};

pub use graph::{DependencyEdge, InstallOrder, ResolvedNode, ResolvedSet};
pub use version::{VersionSpec, VersionSpecError};

use crate::metadata::{ReleaseMetadata, ReleaseMetadataProvider};

/// Resolution errors. None of these leave any state behind.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown package {name}@{version}")]
    UnknownPackage { name: String, version: String },

    #[error("malformed dependency declaration in {package}: {reason}")]
    MalformedDependencyDeclaration { package: String, reason: String },

    #[error("dependency loop: {}", path.join(" -> "))]
    DependencyLoop { path: Vec<String> },

    #[error("resolver stuck after {passes} passes, pending: {}", pending.join(", "))]
    ResolverStuck { passes: usize, pending: Vec<String> },
}

/// A single install or resolve request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub name: String,
    pub version: VersionSpec,
}

impl PackageRequest {
    pub fn new(name: impl Into<String>, version: VersionSpec) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Build a request from a raw version string.
    pub fn parse(name: impl Into<String>, version: &str) -> Result<Self, ResolveError> {
        let name = name.into();
        let version = version
            .parse()
            .map_err(|e: VersionSpecError| ResolveError::MalformedDependencyDeclaration {
                package: name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { name, version })
    }
}

/// Output of a successful resolve.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub order: InstallOrder,
    pub resolved: ResolvedSet,
}

/// `(name, spec)` as requested by a dependency declaration.
type WalkKey = (String, String);

fn walk_key(name: &str, spec: &VersionSpec) -> WalkKey {
    (name.to_string(), spec.to_string())
}

/// Node whose dependencies are being walked.
struct Frame {
    key: WalkKey,
    children: Vec<WalkKey>,
    pending: std::vec::IntoIter<(WalkKey, ResolvedNode)>,
}

/// Node whose whole subtree has been walked.
struct Finished {
    name: String,
    children: Vec<WalkKey>,
    /// Every package name reachable from this node, itself included.
    reach: HashSet<String>,
}

/// Dependency resolver over a release metadata provider.
#[derive(Clone)]
pub struct Resolver {
    provider: Arc<dyn ReleaseMetadataProvider>,
}

impl Resolver {
    pub fn new(provider: Arc<dyn ReleaseMetadataProvider>) -> Self {
        Self { provider }
    }

    /// Resolve `request` and all of its transitive dependencies.
    pub async fn resolve(&self, request: &PackageRequest) -> Result<Resolution, ResolveError> {
        let root = Arc::new(
            self.provider
                .get_manifest(&request.name, &request.version)
                .await?,
        );
        let root_key = walk_key(&request.name, &request.version);
        let mut cache = HashMap::new();
        cache.insert(root_key.clone(), root.clone());
        let root = to_node(root, request.version.clone())?;

        let mut candidates = Vec::new();
        let mut finished: HashMap<WalkKey, Finished> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut stack = vec![
            self.enter(&mut cache, root_key, root, &mut path, &mut candidates)
                .await?,
        ];

        loop {
            let next = match stack.last_mut() {
                Some(frame) => frame.pending.next(),
                None => break,
            };

            match next {
                Some((key, child)) => {
                    if let Some(tail) = loop_below(&finished, &key, &path) {
                        path.extend(tail);
                        return Err(ResolveError::DependencyLoop { path });
                    }
                    if finished.contains_key(&key) {
                        continue;
                    }
                    let frame = self
                        .enter(&mut cache, key, child, &mut path, &mut candidates)
                        .await?;
                    stack.push(frame);
                }
                None => {
                    let Some(frame) = stack.pop() else { break };
                    let name = path.pop().unwrap_or_default();
                    let mut reach = HashSet::from([name.clone()]);
                    for child in &frame.children {
                        if let Some(done) = finished.get(child) {
                            reach.extend(done.reach.iter().cloned());
                        }
                    }
                    finished.insert(
                        frame.key,
                        Finished {
                            name,
                            children: frame.children,
                            reach,
                        },
                    );
                }
            }
        }

        debug!(
            package = %request.name,
            candidates = candidates.len(),
            "Dependency walk complete"
        );

        let mut resolved = ResolvedSet::new();
        for candidate in candidates {
            resolved.offer(candidate);
        }
        resolved.prune_unreachable(&request.name);

        let order = InstallOrder::compute(&resolved)?;

        info!(
            package = %request.name,
            version = %request.version,
            order = ?order.names(),
            "Resolved dependencies"
        );

        Ok(Resolution { order, resolved })
    }

    /// Resolve only the requested package, ignoring its dependencies.
    pub async fn resolve_root_only(
        &self,
        request: &PackageRequest,
    ) -> Result<Resolution, ResolveError> {
        let release = self
            .provider
            .get_manifest(&request.name, &request.version)
            .await?;
        let mut node = to_node(Arc::new(release), request.version.clone())?;
        node.dependencies.clear();

        let mut resolved = ResolvedSet::new();
        resolved.offer(node);
        let order = InstallOrder::compute(&resolved)?;

        info!(package = %request.name, "Resolved without dependencies");
        Ok(Resolution { order, resolved })
    }

    /// Put `node` on the active path and look up its dependencies.
    async fn enter(
        &self,
        cache: &mut HashMap<WalkKey, Arc<ReleaseMetadata>>,
        key: WalkKey,
        node: ResolvedNode,
        path: &mut Vec<String>,
        candidates: &mut Vec<ResolvedNode>,
    ) -> Result<Frame, ResolveError> {
        path.push(node.name.clone());
        for child in node.dependencies.keys() {
            if path.contains(child) {
                let mut loop_path = path.clone();
                loop_path.push(child.clone());
                return Err(ResolveError::DependencyLoop { path: loop_path });
            }
        }

        let wanted: Vec<(String, VersionSpec)> = node
            .dependencies
            .iter()
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();
        let releases = self.lookup_many(cache, &wanted).await?;

        let mut pending = Vec::with_capacity(wanted.len());
        for ((name, spec), release) in wanted.into_iter().zip(releases) {
            pending.push((walk_key(&name, &spec), to_node(release, spec)?));
        }

        candidates.push(node);
        Ok(Frame {
            key,
            children: pending.iter().map(|(key, _)| key.clone()).collect(),
            pending: pending.into_iter(),
        })
    }

    /// Fetch metadata for several `(name, spec)` pairs concurrently.
    async fn lookup_many(
        &self,
        cache: &mut HashMap<WalkKey, Arc<ReleaseMetadata>>,
        wanted: &[(String, VersionSpec)],
    ) -> Result<Vec<Arc<ReleaseMetadata>>, ResolveError> {
        let missing: Vec<&(String, VersionSpec)> = wanted
            .iter()
            .filter(|(name, spec)| !cache.contains_key(&walk_key(name, spec)))
            .collect();

        let fetched = join_all(
            missing
                .iter()
                .map(|(name, spec)| self.provider.get_manifest(name, spec)),
        )
        .await;

        for ((name, spec), release) in missing.into_iter().zip(fetched) {
            cache.insert(walk_key(name, spec), Arc::new(release?));
        }

        Ok(wanted
            .iter()
            .filter_map(|(name, spec)| cache.get(&walk_key(name, spec)).cloned())
            .collect())
    }
}

/// If the finished subtree under `key` reaches a name on `path`, the names
/// from `key` down to that repeat.
fn loop_below(
    finished: &HashMap<WalkKey, Finished>,
    key: &WalkKey,
    path: &[String],
) -> Option<Vec<String>> {
    let hits_path = |done: &Finished| path.iter().any(|name| done.reach.contains(name));

    let mut current = finished.get(key).filter(|done| hits_path(done))?;
    let mut tail = Vec::new();
    loop {
        tail.push(current.name.clone());
        if path.contains(&current.name) {
            return Some(tail);
        }
        current = current
            .children
            .iter()
            .filter_map(|child| finished.get(child))
            .find(|done| hits_path(done))?;
    }
}

fn to_node(release: Arc<ReleaseMetadata>, spec: VersionSpec) -> Result<ResolvedNode, ResolveError> {
    let dependencies = parse_dependencies(&release.name, &release.dependencies)?;
    Ok(ResolvedNode {
        name: release.name.clone(),
        version: release.version.clone(),
        spec,
        release,
        dependencies,
    })
}

/// Validate a raw dependency block as a flat `name -> spec` mapping.
pub fn parse_dependencies(
    package: &str,
    block: &serde_json::Value,
) -> Result<BTreeMap<String, VersionSpec>, ResolveError> {
    let malformed = |reason: String| ResolveError::MalformedDependencyDeclaration {
        package: package.to_string(),
        reason,
    };

    let map = match block {
        serde_json::Value::Null => return Ok(BTreeMap::new()),
        serde_json::Value::Object(map) => map,
        other => {
            return Err(malformed(format!(
                "expected a mapping of name to version, found {}",
                json_kind(other)
            )))
        }
    };

    let mut deps = BTreeMap::new();
    for (name, value) in map {
        if name.trim().is_empty() {
            return Err(malformed("empty dependency name".to_string()));
        }
        let raw = value.as_str().ok_or_else(|| {
            malformed(format!(
                "version of {name} must be a string, found {}",
                json_kind(value)
            ))
        })?;
        let spec = raw.parse().map_err(|e: VersionSpecError| malformed(e.to_string()))?;
        deps.insert(name.clone(), spec);
    }
    Ok(deps)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
