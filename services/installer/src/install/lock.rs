//! Process-wide table of packages currently being installed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Names currently locked by an install batch.
///
/// Acquisition is all-or-none under one mutex, so two batches with
/// overlapping package sets can never both hold part of their set.
#[derive(Debug, Default)]
pub struct InstallationLockTable {
    names: Mutex<BTreeSet<String>>,
}

impl InstallationLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every name in `names`, or none of them.
    ///
    /// On conflict, returns the names that are already locked.
    pub fn try_acquire(self: &Arc<Self>, names: &[String]) -> Result<BatchLock, Vec<String>> {
        let mut locked = self.lock();

        let busy: Vec<String> = names
            .iter()
            .filter(|n| locked.contains(n.as_str()))
            .cloned()
            .collect();
        if !busy.is_empty() {
            return Err(busy);
        }

        locked.extend(names.iter().cloned());
        debug!(packages = ?names, "Acquired install locks");

        Ok(BatchLock {
            table: self.clone(),
            names: names.to_vec(),
        })
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Currently locked names.
    pub fn locked(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn release(&self, names: &[String]) {
        let mut locked = self.lock();
        for name in names {
            locked.remove(name);
        }
        debug!(packages = ?names, "Released install locks");
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Locks held by one batch; released on drop.
#[derive(Debug)]
pub struct BatchLock {
    table: Arc<InstallationLockTable>,
    names: Vec<String>,
}

impl BatchLock {
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        self.table.release(&self.names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_acquire_and_release() {
        let table = Arc::new(InstallationLockTable::new());
        {
            let guard = table.try_acquire(&names(&["a", "b"])).unwrap();
            assert_eq!(guard.names(), names(&["a", "b"]).as_slice());
            assert!(table.is_locked("a"));
            assert!(table.is_locked("b"));
        }
        assert!(table.locked().is_empty());
    }

    #[test]
    fn test_overlap_acquires_nothing() {
        let table = Arc::new(InstallationLockTable::new());
        let _held = table.try_acquire(&names(&["b", "c"])).unwrap();

        let busy = table.try_acquire(&names(&["a", "b"])).unwrap_err();
        assert_eq!(busy, names(&["b"]));
        assert!(!table.is_locked("a"));
        assert_eq!(table.locked(), names(&["b", "c"]));
    }

    #[test]
    fn test_disjoint_batches_coexist() {
        let table = Arc::new(InstallationLockTable::new());
        let _first = table.try_acquire(&names(&["a"])).unwrap();
        let _second = table.try_acquire(&names(&["b"])).unwrap();
        assert_eq!(table.locked(), names(&["a", "b"]));
    }
}
