//! Version specifications and conflict ranking.

use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use thiserror::Error;

/// Prefix of locally verifiable content hashes.
pub const SHA256_PREFIX: &str = "sha256:";

/// Prefix of content-store paths used as release identities.
pub const IPFS_PREFIX: &str = "/ipfs/";

/// Error parsing a version specification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid version spec {input:?}: {reason}")]
pub struct VersionSpecError {
    pub input: String,
    pub reason: String,
}

/// What a requester asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSpec {
    /// Newest published release.
    Latest,
    /// One exact semantic version.
    Exact(Version),
    /// Any version matching a semver range.
    Range(VersionReq),
    /// A release pinned by content hash.
    ContentHash(String),
}

impl VersionSpec {
    /// Returns true for specs ranked above every semantic version.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::Latest | Self::ContentHash(_))
    }
}

impl FromStr for VersionSpec {
    type Err = VersionSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = |reason: &str| VersionSpecError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() || trimmed == "*" || trimmed == "latest" {
            return Ok(Self::Latest);
        }

        if let Some(hex_part) = trimmed.strip_prefix(SHA256_PREFIX) {
            if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(err("sha256 hash must be 64 hex characters"));
            }
            return Ok(Self::ContentHash(format!(
                "{SHA256_PREFIX}{}",
                hex_part.to_ascii_lowercase()
            )));
        }

        if let Some(cid) = trimmed.strip_prefix(IPFS_PREFIX) {
            if cid.is_empty() || !cid.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(err("ipfs path must be followed by an alphanumeric CID"));
            }
            return Ok(Self::ContentHash(trimmed.to_string()));
        }

        // A bare version would also parse as a caret requirement, so try exact first.
        if let Ok(version) = Version::parse(trimmed) {
            return Ok(Self::Exact(version));
        }

        VersionReq::parse(trimmed)
            .map(Self::Range)
            .map_err(|e| err(&e.to_string()))
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Exact(v) => write!(f, "{v}"),
            Self::Range(req) => write!(f, "{req}"),
            Self::ContentHash(hash) => write!(f, "{hash}"),
        }
    }
}

/// Decide whether a newly arrived candidate replaces the current one.
///
/// Sentinels outrank semantic versions. Equal ranks keep the earlier arrival.
pub fn supersedes(
    candidate_spec: &VersionSpec,
    candidate_version: &Version,
    current_spec: &VersionSpec,
    current_version: &Version,
) -> bool {
    match (candidate_spec.is_sentinel(), current_spec.is_sentinel()) {
        (true, false) => true,
        (false, true) => false,
        (true, true) => false,
        (false, false) => candidate_version > current_version,
    }
}
