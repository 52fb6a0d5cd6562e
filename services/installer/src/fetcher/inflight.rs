//! Per-destination exclusion for downloads.
//!
//! Two fetches of the same destination must not stream into the same
//! partial file. The first caller holds the destination; later callers wait
//! for it and then re-check the destination, usually finding it complete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Destinations with a download in progress.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    entries: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl InFlight {
    /// Wait until no other fetch holds `destination`, then hold it.
    pub(crate) async fn hold(self: &Arc<Self>, destination: &Path) -> InFlightGuard {
        let entry = self
            .lock()
            .entry(destination.to_path_buf())
            .or_default()
            .clone();
        let held = entry.lock_owned().await;

        InFlightGuard {
            table: self.clone(),
            destination: destination.to_path_buf(),
            held: Some(held),
        }
    }

    /// Number of destinations currently held or awaited.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<AsyncMutex<()>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds one destination; dropping it lets the next waiter in.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    table: Arc<InFlight>,
    destination: PathBuf,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        drop(self.held.take());

        // Only the table's own reference left means nobody is waiting.
        let mut entries = self.table.lock();
        if entries
            .get(&self.destination)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            entries.remove(&self.destination);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_holder_waits_for_first() {
        let table = Arc::new(InFlight::default());
        let dest = Path::new("/tmp/pkg/image.tar.xz");

        let first = table.hold(dest).await;
        let waiter = tokio::spawn({
            let table = table.clone();
            async move {
                let _guard = table.hold(Path::new("/tmp/pkg/image.tar.xz")).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_destinations_do_not_wait() {
        let table = Arc::new(InFlight::default());
        let _a = table.hold(Path::new("/tmp/a")).await;
        let _b = table.hold(Path::new("/tmp/b")).await;
        assert_eq!(table.len(), 2);
    }
}
