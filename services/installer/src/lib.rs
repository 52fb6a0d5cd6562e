//! DNP installer library
//!
//! Installs containerized DNP packages together with their dependencies.
//!
//! ## Architecture
//!
//! ```text
//! Installer
//! ├── Resolver         (release metadata -> ResolvedSet + InstallOrder)
//! ├── ContentFetcher   (bounded, retrying, hash-verified downloads)
//! ├── FileWriter       (manifest/compose files with backups)
//! └── ContainerRuntime (load images, start/stop compose projects)
//! ```
//!
//! ## Modules
//!
//! - `resolver`: dependency walk, conflict resolution and install ordering
//! - `metadata`: release metadata providers
//! - `fetcher`: content store transports and the download queue
//! - `install`: batch orchestration, locks and rollback
//! - `runtime`: container runtime implementations

pub mod config;
pub mod fetcher;
pub mod install;
pub mod metadata;
pub mod progress;
pub mod resolver;
pub mod runtime;

// Re-export commonly used types
pub use fetcher::{ContentFetcher, FetchError, FetchOutcome, FetcherConfig};
pub use install::{
    InstallError, InstallOptions, InstallPaths, InstallReport, InstallRequest, Installer,
    TaskStatus,
};
pub use metadata::{ReleaseMetadata, ReleaseMetadataProvider};
pub use progress::{ProgressEvent, ProgressSink};
pub use resolver::{PackageRequest, ResolveError, Resolver, VersionSpec};
pub use runtime::{ContainerRuntime, MockRuntime};
