//! Content fetcher: bounded, retrying, hash-verifying downloads.
//!
//! Every [`ContentFetcher::fetch`] call:
//! - returns [`FetchOutcome::Skipped`] if the destination already holds the
//!   requested content
//! - waits for any other fetch of the same destination to finish
//! - waits for one of `concurrency` worker slots
//! - streams into `<destination>.part` with a stall watchdog that is reset on
//!   every chunk
//! - recomputes the hash and renames into place only on a match
//! - retries failed attempts under the configured [`RetryPolicy`]

mod hash;
mod inflight;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dnp_retry::RetryPolicy;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub use hash::{content_hash, hash_file, is_verifiable, ContentHasher};
pub use store::{ByteStream, ContentStore, Fault, HttpContentStore, MemoryContentStore};

use inflight::InFlight;

/// Default number of concurrent downloads.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Default stall watchdog.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("could not open content stream: {0}")]
    Open(#[source] anyhow::Error),

    #[error("content stream failed: {0}")]
    Stream(#[source] anyhow::Error),

    #[error("no data received for {0:?}")]
    Stalled(Duration),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fetch errors.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(
        "download of {hash} to {} failed after {attempts} attempts: {last}",
        destination.display()
    )]
    DownloadFailed {
        hash: String,
        destination: PathBuf,
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    #[error("cannot verify content hash {0}: only sha256 hashes are fetchable")]
    UnsupportedHash(String),

    #[error("download queue closed")]
    QueueClosed,
}

/// Result of a successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Destination already held the content; nothing was transferred.
    Skipped,
    /// Content was downloaded and verified.
    Downloaded { bytes: u64, attempts: u32 },
}

/// Configuration for the fetcher.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Maximum concurrent downloads.
    pub concurrency: usize,
    /// Retry policy applied to every job.
    pub retry: RetryPolicy,
    /// Maximum gap between two chunks of one stream.
    pub stall_timeout: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// One queued download attempt.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub hash: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Backoff waited before this attempt.
    pub backoff_ms: u64,
}

impl DownloadJob {
    fn partial_path(&self) -> PathBuf {
        let mut name = self.destination.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }
}

/// Shared, cloneable download queue.
#[derive(Clone)]
pub struct ContentFetcher {
    store: Arc<dyn ContentStore>,
    slots: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    config: FetcherConfig,
}

impl ContentFetcher {
    pub fn new(store: Arc<dyn ContentStore>, config: FetcherConfig) -> Self {
        Self {
            store,
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            in_flight: Arc::new(InFlight::default()),
            config,
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// True if `path` holds content hashing to `hash`.
    pub async fn verify(&self, hash: &str, path: &Path) -> bool {
        hash::verify(hash, path).await
    }

    /// Ensure `destination` holds the content addressed by `hash`.
    pub async fn fetch(
        &self,
        hash: &str,
        destination: &Path,
        expected_size: Option<u64>,
    ) -> Result<FetchOutcome, FetchError> {
        if !is_verifiable(hash) {
            return Err(FetchError::UnsupportedHash(hash.to_string()));
        }

        if self.verify(hash, destination).await {
            debug!(hash = %hash, dest = %destination.display(), "Content already present");
            return Ok(FetchOutcome::Skipped);
        }

        let _held = self.in_flight.hold(destination).await;
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| FetchError::QueueClosed)?;

        // Another caller may have finished the same download while we waited.
        if self.verify(hash, destination).await {
            debug!(hash = %hash, dest = %destination.display(), "Content arrived while queued");
            return Ok(FetchOutcome::Skipped);
        }

        if tokio::fs::metadata(destination).await.is_ok() {
            warn!(
                hash = %hash,
                dest = %destination.display(),
                "Discarding destination with mismatching content"
            );
            tokio::fs::remove_file(destination)
                .await
                .map_err(|e| self.failed(hash, destination, 0, e.into()))?;
        }

        let result = self
            .config
            .retry
            .run_with_delay(|attempt, waited| {
                let job = DownloadJob {
                    hash: hash.to_string(),
                    destination: destination.to_path_buf(),
                    expected_size,
                    attempt,
                    backoff_ms: waited.as_millis() as u64,
                };
                async move {
                    let outcome = self.attempt(&job).await;
                    if let Err(e) = &outcome {
                        warn!(
                            hash = %job.hash,
                            attempt = job.attempt,
                            backoff_ms = job.backoff_ms,
                            error = %e,
                            "Download attempt failed"
                        );
                    }
                    outcome.map(|bytes| (bytes, job.attempt))
                }
            })
            .await;

        match result {
            Ok((bytes, attempts)) => {
                info!(
                    hash = %hash,
                    dest = %destination.display(),
                    bytes,
                    attempts,
                    source = self.store.name(),
                    "Content downloaded"
                );
                Ok(FetchOutcome::Downloaded { bytes, attempts })
            }
            Err(e) => Err(self.failed(hash, destination, e.attempts, e.last)),
        }
    }

    /// Run one attempt, leaving no partial file behind on failure.
    async fn attempt(&self, job: &DownloadJob) -> Result<u64, AttemptError> {
        let partial = job.partial_path();
        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.stream_to(job, &partial).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &job.destination).await?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, job: &DownloadJob, partial: &Path) -> Result<u64, AttemptError> {
        let mut stream = self.store.open(&job.hash).await.map_err(AttemptError::Open)?;
        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = ContentHasher::new();
        let mut written: u64 = 0;

        loop {
            let next = tokio::time::timeout(self.config.stall_timeout, stream.next())
                .await
                .map_err(|_| AttemptError::Stalled(self.config.stall_timeout))?;

            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(AttemptError::Stream)?;

            written += chunk.len() as u64;
            if let Some(expected) = job.expected_size {
                if written > expected {
                    return Err(AttemptError::SizeMismatch {
                        expected,
                        actual: written,
                    });
                }
            }

            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = job.expected_size {
            if written != expected {
                return Err(AttemptError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
        }

        let actual = hasher.finalize();
        if !actual.eq_ignore_ascii_case(&job.hash) {
            return Err(AttemptError::HashMismatch {
                expected: job.hash.clone(),
                actual,
            });
        }

        Ok(written)
    }

    fn failed(
        &self,
        hash: &str,
        destination: &Path,
        attempts: u32,
        last: AttemptError,
    ) -> FetchError {
        FetchError::DownloadFailed {
            hash: hash.to_string(),
            destination: destination.to_path_buf(),
            attempts,
            last,
        }
    }
}
