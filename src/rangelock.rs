//! Byte-Range Locks
//!
//! Two mutually exclusive lock sets over the device address space: `Regular`
//! covers in-flight external writes, `Sync` covers resynchronization copies.
//! A span may never be held in both sets at once; acquiring against an
//! overlap in the other set (or a conflicting span in the same set) waits
//! until the holder releases.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Which lock set a span belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSet {
    /// In-flight external writes
    Regular,
    /// Resynchronization copies
    Sync,
}

impl LockSet {
    /// The set this one must not overlap with
    pub fn other(&self) -> LockSet {
        match self {
            LockSet::Regular => LockSet::Sync,
            LockSet::Sync => LockSet::Regular,
        }
    }
}

#[derive(Default)]
struct Inner {
    regular: Vec<(u64, u64)>,
    sync: Vec<(u64, u64)>,
}

impl Inner {
    fn set(&self, set: LockSet) -> &Vec<(u64, u64)> {
        match set {
            LockSet::Regular => &self.regular,
            LockSet::Sync => &self.sync,
        }
    }

    fn set_mut(&mut self, set: LockSet) -> &mut Vec<(u64, u64)> {
        match set {
            LockSet::Regular => &mut self.regular,
            LockSet::Sync => &mut self.sync,
        }
    }
}

fn overlaps(ranges: &[(u64, u64)], offset: u64, length: u64) -> bool {
    let end = offset + length;
    ranges.iter().any(|&(o, l)| offset < o + l && o < end)
}

/// The two byte-range lock sets and their shared wait channel
pub struct RangeLocks {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RangeLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Insert a span into a set unless it conflicts within that set
    pub fn try_lock(&self, set: LockSet, offset: u64, length: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if overlaps(inner.set(set), offset, length) {
            return false;
        }
        inner.set_mut(set).push((offset, length));
        true
    }

    /// Check a set for an overlapping span
    pub fn is_locked(&self, set: LockSet, offset: u64, length: u64) -> bool {
        overlaps(self.inner.lock().unwrap().set(set), offset, length)
    }

    /// Release a span and wake every waiter to re-evaluate
    pub fn unlock(&self, set: LockSet, offset: u64, length: u64) {
        let mut inner = self.inner.lock().unwrap();
        let ranges = inner.set_mut(set);
        if let Some(pos) = ranges.iter().position(|&r| r == (offset, length)) {
            ranges.swap_remove(pos);
        } else {
            tracing::warn!(?set, offset, length, "unlock of span that was not held");
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Acquire a span in `set`, waiting out overlaps in either set
    pub async fn lock(&self, set: LockSet, offset: u64, length: u64) {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if !overlaps(inner.set(set.other()), offset, length)
                    && !overlaps(inner.set(set), offset, length)
                {
                    inner.set_mut(set).push((offset, length));
                    return;
                }
            }
            tracing::debug!(?set, offset, length, "span locked, waiting");
            notified.await;
        }
    }
}

impl Default for RangeLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_same_set_conflict() {
        let locks = RangeLocks::new();
        assert!(locks.try_lock(LockSet::Regular, 0, 100));
        assert!(!locks.try_lock(LockSet::Regular, 50, 100));
        // Adjacent spans do not conflict.
        assert!(locks.try_lock(LockSet::Regular, 100, 100));
    }

    #[test]
    fn test_cross_set_visibility() {
        let locks = RangeLocks::new();
        assert!(locks.try_lock(LockSet::Sync, 1000, 500));
        assert!(locks.is_locked(LockSet::Sync, 1200, 10));
        assert!(!locks.is_locked(LockSet::Regular, 1200, 10));
        locks.unlock(LockSet::Sync, 1000, 500);
        assert!(!locks.is_locked(LockSet::Sync, 1200, 10));
    }

    #[tokio::test]
    async fn test_lock_waits_for_other_set() {
        let locks = Arc::new(RangeLocks::new());
        assert!(locks.try_lock(LockSet::Sync, 0, 4096));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.lock(LockSet::Regular, 1024, 512).await;
            })
        };

        // The regular lock must not go through while the sync span is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        locks.unlock(LockSet::Sync, 0, 4096);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_locked(LockSet::Regular, 1024, 512));
    }

    #[tokio::test]
    async fn test_overlapping_writers_serialize() {
        let locks = Arc::new(RangeLocks::new());
        locks.lock(LockSet::Regular, 0, 100).await;

        let second = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.lock(LockSet::Regular, 50, 100).await;
                locks.unlock(LockSet::Regular, 50, 100);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        locks.unlock(LockSet::Regular, 0, 100);
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
    }
}
