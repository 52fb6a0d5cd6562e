//! Resolved package graph and install ordering.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use semver::Version;
use tracing::debug;

use super::version::{supersedes, VersionSpec};
use super::ResolveError;
use crate::metadata::ReleaseMetadata;

/// `(parent, child, spec)` edge found while walking declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub parent: String,
    pub child: String,
    pub version: VersionSpec,
}

/// One package chosen for installation.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub name: String,

    /// Version the provider resolved `spec` to.
    pub version: Version,

    /// Spec the winning requester asked for.
    pub spec: VersionSpec,

    /// Full release metadata, including the manifest.
    pub release: Arc<ReleaseMetadata>,

    /// Validated dependency declarations.
    pub dependencies: BTreeMap<String, VersionSpec>,
}

impl ResolvedNode {
    /// Edges from this node to its declared dependencies.
    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        self.dependencies.iter().map(|(child, spec)| DependencyEdge {
            parent: self.name.clone(),
            child: child.clone(),
            version: spec.clone(),
        })
    }
}

/// At most one node per package name.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSet {
    nodes: BTreeMap<String, ResolvedNode>,
}

impl ResolvedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a candidate; keeps it only if it outranks the current holder.
    ///
    /// Returns true if the candidate was kept.
    pub fn offer(&mut self, node: ResolvedNode) -> bool {
        match self.nodes.get(&node.name) {
            Some(current)
                if !supersedes(&node.spec, &node.version, &current.spec, &current.version) =>
            {
                debug!(
                    package = %node.name,
                    kept = %current.version,
                    discarded = %node.version,
                    "Discarding lower-ranked candidate"
                );
                false
            }
            _ => {
                self.nodes.insert(node.name.clone(), node);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ResolvedNode> {
        self.nodes.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Drop nodes not reachable from `root` through kept nodes' dependencies.
    pub(crate) fn prune_unreachable(&mut self, root: &str) {
        let mut reachable = HashSet::new();
        let mut stack = vec![root.to_string()];

        while let Some(name) = stack.pop() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&name) {
                stack.extend(node.dependencies.keys().cloned());
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|name, _| reachable.contains(name));
        if self.nodes.len() != before {
            debug!(
                pruned = before - self.nodes.len(),
                "Pruned packages only required by discarded candidates"
            );
        }
    }
}

/// Dependency-first install sequence.
#[derive(Debug, Clone, Default)]
pub struct InstallOrder {
    nodes: Vec<ResolvedNode>,
}

impl InstallOrder {
    /// Compute the order by repeated readiness passes over `set`.
    ///
    /// A node becomes ready once every dependency name is ready. At most
    /// `set.len() + 1` passes are made. A pass that readies nothing means
    /// the set can never complete: a cycle among the pending nodes is a
    /// [`ResolveError::DependencyLoop`], anything else (a dependency name
    /// missing from the set) is [`ResolveError::ResolverStuck`].
    pub fn compute(set: &ResolvedSet) -> Result<Self, ResolveError> {
        let max_passes = set.len() + 1;
        let mut ready: HashSet<&str> = HashSet::with_capacity(set.len());
        let mut nodes = Vec::with_capacity(set.len());
        let mut passes = 0;

        while nodes.len() < set.len() {
            passes += 1;
            if passes > max_passes {
                return Err(stuck(set, &ready, passes - 1));
            }

            let mut progressed = false;
            for node in set.iter() {
                if ready.contains(node.name.as_str()) {
                    continue;
                }
                if node.dependencies.keys().all(|d| ready.contains(d.as_str())) {
                    ready.insert(node.name.as_str());
                    nodes.push(node.clone());
                    progressed = true;
                }
            }

            if !progressed {
                if let Some(path) = pending_cycle(set, &ready) {
                    return Err(ResolveError::DependencyLoop { path });
                }
                return Err(stuck(set, &ready, passes));
            }
        }

        debug!(packages = nodes.len(), passes, "Computed install order");
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResolvedNode> {
        self.nodes.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Position of `name` in the order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }
}

impl<'a> IntoIterator for &'a InstallOrder {
    type Item = &'a ResolvedNode;
    type IntoIter = std::slice::Iter<'a, ResolvedNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

/// Follow not-yet-ready dependencies from each pending node until a name
/// repeats.
fn pending_cycle(set: &ResolvedSet, ready: &HashSet<&str>) -> Option<Vec<String>> {
    let pending = |name: &str| set.contains(name) && !ready.contains(name);

    for start in set.iter().filter(|n| pending(&n.name)) {
        let mut trail: Vec<&str> = vec![start.name.as_str()];
        while let Some(node) = trail.last().and_then(|name| set.get(name)) {
            let Some(next) = node.dependencies.keys().find(|d| pending(d)) else {
                break;
            };
            if let Some(at) = trail.iter().position(|name| *name == next.as_str()) {
                let mut cycle: Vec<String> = trail[at..].iter().map(|n| n.to_string()).collect();
                cycle.push(next.clone());
                return Some(cycle);
            }
            trail.push(next.as_str());
        }
    }
    None
}

fn stuck(set: &ResolvedSet, ready: &HashSet<&str>, passes: usize) -> ResolveError {
    let pending: BTreeSet<String> = set
        .iter()
        .filter(|n| !ready.contains(n.name.as_str()))
        .map(|n| n.name.clone())
        .collect();
    ResolveError::ResolverStuck {
        passes,
        pending: pending.into_iter().collect(),
    }
}
