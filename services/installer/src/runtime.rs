//! Container runtime interface.
//!
//! The runtime abstracts the container side of an install:
//! - Loading a downloaded image archive
//! - Starting and stopping a package's compose project
//!
//! A docker-backed implementation drives the `docker` CLI. A mock
//! implementation is provided for testing.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Load an image archive into the local image store.
    async fn load_image(&self, image: &Path) -> Result<()>;

    /// Start (or recreate) the compose project at `compose`.
    async fn start(&self, compose: &Path) -> Result<()>;

    /// Stop the compose project at `compose`.
    async fn stop(&self, compose: &Path) -> Result<()>;

    /// Remove the containers of the compose project at `compose`.
    async fn remove(&self, compose: &Path) -> Result<()>;
}

// =============================================================================
// Docker compose
// =============================================================================

/// Runtime backed by the docker CLI.
pub struct ComposeRuntime {
    docker_bin: PathBuf,
}

impl ComposeRuntime {
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    async fn docker(&self, args: &[&OsStr]) -> Result<()> {
        debug!(bin = %self.docker_bin.display(), ?args, "Running docker");

        let output = Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.docker_bin.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "docker {:?} exited with {}: {}",
                args,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }

    async fn compose(&self, compose: &Path, action: &[&str]) -> Result<()> {
        let mut args = vec![OsStr::new("compose"), OsStr::new("-f"), compose.as_os_str()];
        args.extend(action.iter().map(OsStr::new));
        self.docker(&args).await
    }
}

impl Default for ComposeRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn load_image(&self, image: &Path) -> Result<()> {
        info!(image = %image.display(), "Loading image");
        self.docker(&[OsStr::new("load"), OsStr::new("--input"), image.as_os_str()])
            .await
    }

    async fn start(&self, compose: &Path) -> Result<()> {
        info!(compose = %compose.display(), "Starting package");
        self.compose(compose, &["up", "-d", "--force-recreate"]).await
    }

    async fn stop(&self, compose: &Path) -> Result<()> {
        info!(compose = %compose.display(), "Stopping package");
        self.compose(compose, &["stop"]).await
    }

    async fn remove(&self, compose: &Path) -> Result<()> {
        self.compose(compose, &["down", "--remove-orphans"]).await
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Call recorded by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    LoadImage(PathBuf),
    Start(PathBuf),
    Stop(PathBuf),
    Remove(PathBuf),
}

#[derive(Default)]
struct MockState {
    calls: Vec<RuntimeCall>,
    running: BTreeSet<PathBuf>,
    fail_start: HashSet<PathBuf>,
}

/// Mock runtime for testing.
///
/// Records every call and tracks which compose projects are running. A gated
/// mock holds every `start` until [`MockRuntime::open_gate`] is called.
pub struct MockRuntime {
    state: Mutex<MockState>,
    gate: Option<watch::Sender<bool>>,
    start_entered: Notify,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            gate: None,
            start_entered: Notify::new(),
        }
    }

    /// Create a mock whose starts block until the gate opens.
    pub fn gated() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            gate: Some(tx),
            ..Self::new()
        }
    }

    /// Make starts of `compose` fail.
    pub fn fail_start_for(&self, compose: impl Into<PathBuf>) {
        self.lock().fail_start.insert(compose.into());
    }

    /// Release every start held by the gate.
    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.send_replace(true);
        }
    }

    /// Wait until a start is blocked on the gate.
    pub async fn wait_for_gated_start(&self) {
        self.start_entered.notified().await;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Compose projects currently running.
    pub fn running(&self) -> Vec<PathBuf> {
        self.lock().running.iter().cloned().collect()
    }

    pub fn is_running(&self, compose: &Path) -> bool {
        self.lock().running.contains(compose)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: RuntimeCall) {
        self.lock().calls.push(call);
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn load_image(&self, image: &Path) -> Result<()> {
        debug!(image = %image.display(), "[MOCK] Loading image");
        self.record(RuntimeCall::LoadImage(image.to_path_buf()));
        Ok(())
    }

    async fn start(&self, compose: &Path) -> Result<()> {
        self.record(RuntimeCall::Start(compose.to_path_buf()));

        if let Some(gate) = &self.gate {
            let mut rx = gate.subscribe();
            self.start_entered.notify_one();
            rx.wait_for(|open| *open)
                .await
                .context("mock runtime gate dropped")?;
        }

        let mut state = self.lock();
        if state.fail_start.contains(compose) {
            bail!("Mock runtime configured to fail start of {}", compose.display());
        }
        state.running.insert(compose.to_path_buf());
        debug!(compose = %compose.display(), "[MOCK] Started");
        Ok(())
    }

    async fn stop(&self, compose: &Path) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Stop(compose.to_path_buf()));
        state.running.remove(compose);
        debug!(compose = %compose.display(), "[MOCK] Stopped");
        Ok(())
    }

    async fn remove(&self, compose: &Path) -> Result<()> {
        self.record(RuntimeCall::Remove(compose.to_path_buf()));
        Ok(())
    }
}
