//! Content store transports.
//!
//! A [`ContentStore`] only hands out byte streams for a hash. Integrity is
//! checked by the fetcher against the hash itself, never by trusting the
//! transport.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::hash::content_hash;
use crate::resolver::version::IPFS_PREFIX;

/// Stream of content chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Source of content-addressed bytes.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Open a byte stream for `hash`.
    async fn open(&self, hash: &str) -> Result<ByteStream>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// =============================================================================
// HTTP gateway
// =============================================================================

/// Content store reached over an HTTP gateway.
///
/// `sha256:` hashes are served from `{base}/blobs/{hash}`, `/ipfs/` paths
/// from `{base}{path}`.
pub struct HttpContentStore {
    client: Client,
    base_url: String,
}

impl HttpContentStore {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, hash: &str) -> String {
        if hash.starts_with(IPFS_PREFIX) {
            format!("{}{}", self.base_url, hash)
        } else {
            format!("{}/blobs/{}", self.base_url, hash)
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn open(&self, hash: &str) -> Result<ByteStream> {
        let url = self.url_for(hash);
        debug!(url = %url, "Opening content stream");

        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(anyhow::Error::from)),
            )),
            StatusCode::NOT_FOUND => bail!("content {hash} not found at {url}"),
            status => bail!("content store returned HTTP {status} for {hash}"),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Fault injected into the next open of a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The open call itself fails.
    Unavailable,
    /// The stream delivers bytes with the first byte flipped.
    Corrupt,
    /// The stream delivers the first chunk, then never another.
    Stall,
}

#[derive(Default)]
struct Blobs {
    data: HashMap<String, Bytes>,
    faults: HashMap<String, VecDeque<Fault>>,
    opens: HashMap<String, usize>,
}

/// In-process content store with fault injection.
pub struct MemoryContentStore {
    blobs: Mutex<Blobs>,
    chunk_size: usize,
    chunk_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(Blobs::default()),
            chunk_size: 16 * 1024,
            chunk_delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Split streams into chunks of `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Sleep before every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Store `bytes`, returning their content hash.
    pub fn insert(&self, bytes: impl Into<Bytes>) -> String {
        let bytes = bytes.into();
        let hash = content_hash(&bytes);
        self.lock().data.insert(hash.clone(), bytes);
        hash
    }

    /// Queue a fault for the next open of `hash`.
    pub fn inject(&self, hash: &str, fault: Fault) {
        self.lock()
            .faults
            .entry(hash.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Number of times `hash` was opened.
    pub fn opens(&self, hash: &str) -> usize {
        self.lock().opens.get(hash).copied().unwrap_or(0)
    }

    /// Highest number of streams that were alive at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Blobs> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a live stream until dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ChunkState {
    chunks: VecDeque<Bytes>,
    stall: bool,
    delay: Duration,
    _in_flight: InFlight,
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn open(&self, hash: &str) -> Result<ByteStream> {
        let (data, fault) = {
            let mut blobs = self.lock();
            *blobs.opens.entry(hash.to_string()).or_default() += 1;
            let fault = blobs.faults.get_mut(hash).and_then(VecDeque::pop_front);
            (blobs.data.get(hash).cloned(), fault)
        };

        let Some(data) = data else {
            bail!("content {hash} not found");
        };

        if fault == Some(Fault::Unavailable) {
            bail!("content store unavailable for {hash}");
        }

        let data = if fault == Some(Fault::Corrupt) {
            let mut corrupted = data.to_vec();
            match corrupted.first_mut() {
                Some(first) => *first ^= 0xff,
                None => corrupted.push(0),
            }
            Bytes::from(corrupted)
        } else {
            data
        };

        let mut chunks: VecDeque<Bytes> = data
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        let stall = fault == Some(Fault::Stall);
        if stall {
            chunks.truncate(1);
        }

        let state = ChunkState {
            chunks,
            stall,
            delay: self.chunk_delay,
            _in_flight: InFlight::enter(&self.in_flight, &self.max_in_flight),
        };

        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            if !state.delay.is_zero() {
                tokio::time::sleep(state.delay).await;
            }
            match state.chunks.pop_front() {
                Some(chunk) => Some((Ok::<_, anyhow::Error>(chunk), state)),
                None if state.stall => {
                    futures_util::future::pending::<()>().await;
                    None
                }
                None => None,
            }
        })))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        chunks.concat()
    }

    #[tokio::test]
    async fn test_memory_store_streams_in_chunks() {
        let store = MemoryContentStore::new().with_chunk_size(3);
        let hash = store.insert(&b"abcdefgh"[..]);

        let stream = store.open(&hash).await.unwrap();
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"abcdefgh");
        assert_eq!(store.opens(&hash), 1);
    }

    #[tokio::test]
    async fn test_memory_store_faults_apply_once() {
        let store = MemoryContentStore::new();
        let hash = store.insert(&b"payload"[..]);
        store.inject(&hash, Fault::Unavailable);
        store.inject(&hash, Fault::Corrupt);

        assert!(store.open(&hash).await.is_err());
        let corrupted = collect(store.open(&hash).await.unwrap()).await;
        assert_ne!(corrupted, b"payload");
        let clean = collect(store.open(&hash).await.unwrap()).await;
        assert_eq!(clean, b"payload");
        assert_eq!(store.opens(&hash), 3);
    }

    #[tokio::test]
    async fn test_memory_store_unknown_hash() {
        let store = MemoryContentStore::new();
        assert!(store.open(&content_hash(b"nothing")).await.is_err());
    }

    #[test]
    fn test_http_url_for() {
        let store = HttpContentStore::new("http://gateway:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(store.url_for("/ipfs/QmAbc"), "http://gateway:8080/ipfs/QmAbc");
        assert_eq!(
            store.url_for("sha256:00"),
            "http://gateway:8080/blobs/sha256:00"
        );
    }
}
