//! Dirty Extent Map
//!
//! Tracks which fixed-size extents of the device are out of sync between the
//! two components. One bit per extent is persisted; in-flight write counts
//! and the needs-resynchronization overlay are in-memory only, since after a
//! crash every persisted dirty bit is resynchronized anyway.
//!
//! Write-ahead discipline: an extent is marked dirty and committed to stable
//! storage *before* the write is dispatched to any component, and cleared
//! only when no writes are in flight on it and it does not await
//! resynchronization.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// One candidate extent for resynchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyExtent {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

/// In-memory dirty extent state
pub struct ExtentMap {
    media_size: u64,
    extent_size: u64,
    nextents: usize,
    /// Persisted bit: extent is (possibly) out of sync
    dirty: Vec<bool>,
    /// In-flight writes per extent
    pending: Vec<u32>,
    /// Extent missed a write on one component and must be recopied
    needs_resync: Vec<bool>,
    /// Resynchronization scan position
    cursor: usize,
    /// Packed image differs from the last committed one
    modified: bool,
}

impl ExtentMap {
    pub fn new(media_size: u64, extent_size: u64) -> Self {
        let nextents = media_size.div_ceil(extent_size) as usize;
        Self {
            media_size,
            extent_size,
            nextents,
            dirty: vec![false; nextents],
            pending: vec![0; nextents],
            needs_resync: vec![false; nextents],
            cursor: 0,
            modified: false,
        }
    }

    pub fn nextents(&self) -> usize {
        self.nextents
    }

    /// Size of the packed on-disk image in bytes
    pub fn image_size(&self) -> usize {
        self.nextents.div_ceil(8)
    }

    fn extent_span(&self, offset: u64, length: u64) -> std::ops::RangeInclusive<usize> {
        debug_assert!(length > 0);
        let first = (offset / self.extent_size) as usize;
        let last = ((offset + length - 1) / self.extent_size) as usize;
        first..=last.min(self.nextents - 1)
    }

    /// Mark the extents covering a write as dirty and count the write as in
    /// flight. Returns true on a clean-to-dirty transition, in which case the
    /// caller must commit before dispatching the write.
    pub fn write_start(&mut self, offset: u64, length: u64) -> bool {
        let mut transition = false;
        for ext in self.extent_span(offset, length) {
            self.pending[ext] += 1;
            if !self.dirty[ext] {
                self.dirty[ext] = true;
                self.modified = true;
                transition = true;
            }
        }
        transition
    }

    /// Count a write as completed. Extents with no remaining in-flight writes
    /// and no pending resynchronization become clean in memory; the cleared
    /// bits reach disk with the next commit.
    pub fn write_complete(&mut self, offset: u64, length: u64) {
        for ext in self.extent_span(offset, length) {
            if self.pending[ext] > 0 {
                self.pending[ext] -= 1;
            }
            if self.pending[ext] == 0 && !self.needs_resync[ext] && self.dirty[ext] {
                self.dirty[ext] = false;
                self.modified = true;
            }
        }
    }

    /// Record that a component missed this write: the extents stay dirty
    /// until resynchronized. Returns true when the persisted image changed.
    pub fn mark_needs_resync(&mut self, offset: u64, length: u64) -> bool {
        let mut transition = false;
        for ext in self.extent_span(offset, length) {
            self.needs_resync[ext] = true;
            if !self.dirty[ext] {
                self.dirty[ext] = true;
                self.modified = true;
                transition = true;
            }
        }
        transition
    }

    /// One extent was fully copied to the out-of-sync component
    pub fn extent_complete(&mut self, index: usize) {
        if index >= self.nextents {
            return;
        }
        self.needs_resync[index] = false;
        if self.pending[index] == 0 && self.dirty[index] {
            self.dirty[index] = false;
            self.modified = true;
        }
    }

    /// Restart the resynchronization scan
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Next dirty extent at or after the scan position, advancing past it.
    /// The last extent of an unaligned media size is short.
    pub fn next_dirty(&mut self) -> Option<DirtyExtent> {
        while self.cursor < self.nextents {
            let index = self.cursor;
            self.cursor += 1;
            if self.dirty[index] {
                let offset = index as u64 * self.extent_size;
                let length = self.extent_size.min(self.media_size - offset);
                return Some(DirtyExtent { index, offset, length });
            }
        }
        None
    }

    /// Number of dirty extents
    pub fn ndirty(&self) -> usize {
        self.dirty.iter().filter(|d| **d).count()
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.dirty.get(index).copied().unwrap_or(false)
    }

    /// Merge a peer's packed image: its dirty extents become dirty here too
    pub fn merge(&mut self, image: &[u8]) {
        for index in 0..self.nextents.min(image.len() * 8) {
            if image[index / 8] & (1 << (index % 8)) != 0 && !self.dirty[index] {
                self.dirty[index] = true;
                self.needs_resync[index] = true;
                self.modified = true;
            }
        }
    }

    /// Pack the dirty bits into the on-disk image
    pub fn to_image(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.image_size()];
        for (index, dirty) in self.dirty.iter().enumerate() {
            if *dirty {
                image[index / 8] |= 1 << (index % 8);
            }
        }
        image
    }

    fn load_image(&mut self, image: &[u8]) {
        for index in 0..self.nextents {
            self.dirty[index] = image[index / 8] & (1 << (index % 8)) != 0;
        }
        self.modified = false;
    }

    /// Take the modified flag, resetting it
    fn take_modified(&mut self) -> bool {
        std::mem::replace(&mut self.modified, false)
    }
}

/// File-backed extent map with a single synchronous commit operation
pub struct ExtentMapStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    map: ExtentMap,
    file: File,
}

impl ExtentMapStore {
    /// Create a fresh, all-clean map file
    pub fn create(path: &Path, media_size: u64, extent_size: u64) -> Result<Self> {
        if path.exists() {
            return Err(Error::ExtentMap(format!(
                "extent map already exists at {}",
                path.display()
            )));
        }
        let map = ExtentMap::new(media_size, extent_size);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.write_all(&map.to_image())?;
        file.sync_all()?;
        Ok(Self {
            inner: Mutex::new(StoreInner { map, file }),
        })
    }

    /// Load an existing map file, validating its size against the geometry
    pub fn load(path: &Path, media_size: u64, extent_size: u64) -> Result<Self> {
        let mut map = ExtentMap::new(media_size, extent_size);
        let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|e| {
            Error::ExtentMap(format!("unable to open {}: {}", path.display(), e))
        })?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        if image.len() != map.image_size() {
            return Err(Error::ExtentMap(format!(
                "extent map size mismatch: found {} bytes, expected {}",
                image.len(),
                map.image_size()
            )));
        }
        map.load_image(&image);
        Ok(Self {
            inner: Mutex::new(StoreInner { map, file }),
        })
    }

    /// Mark a write's extents dirty; commits synchronously on a clean-to-dirty
    /// transition so the on-disk image is a superset of reality before the
    /// write is dispatched.
    pub fn write_start(&self, offset: u64, length: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.write_start(offset, length) {
            Self::commit_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Release a completed write's in-flight counts (in-memory; cleared bits
    /// are persisted with the next commit)
    pub fn write_complete(&self, offset: u64, length: u64) {
        self.inner.lock().unwrap().map.write_complete(offset, length);
    }

    /// A component missed this write; keep the extents dirty on disk
    pub fn mark_needs_resync(&self, offset: u64, length: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.mark_needs_resync(offset, length) {
            Self::commit_locked(&mut inner)?;
        }
        Ok(())
    }

    /// An extent was fully recopied; persist the cleared bit
    pub fn extent_complete(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.extent_complete(index);
        if inner.map.modified {
            Self::commit_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Merge the peer's dirty image and persist the union
    pub fn merge(&self, image: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.map.merge(image);
        if inner.map.modified {
            Self::commit_locked(&mut inner)?;
        }
        Ok(())
    }

    pub fn rewind(&self) {
        self.inner.lock().unwrap().map.rewind();
    }

    pub fn next_dirty(&self) -> Option<DirtyExtent> {
        self.inner.lock().unwrap().map.next_dirty()
    }

    pub fn ndirty(&self) -> usize {
        self.inner.lock().unwrap().map.ndirty()
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.inner.lock().unwrap().map.is_dirty(index)
    }

    /// Flush any deferred image changes to stable storage
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.modified {
            Self::commit_locked(&mut inner)?;
        }
        Ok(())
    }

    fn commit_locked(inner: &mut StoreInner) -> Result<()> {
        let image = inner.map.to_image();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&image)?;
        inner.file.sync_all()?;
        inner.map.take_modified();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: u64 = 1024;

    #[test]
    fn test_write_start_transition_once() {
        let mut map = ExtentMap::new(16 * EXTENT, EXTENT);
        assert!(map.write_start(0, 512));
        // Same extent again: already dirty, no transition.
        assert!(!map.write_start(100, 100));
        assert_eq!(map.ndirty(), 1);
    }

    #[test]
    fn test_write_complete_clears_when_done() {
        let mut map = ExtentMap::new(16 * EXTENT, EXTENT);
        map.write_start(0, 512);
        map.write_start(0, 512);
        map.write_complete(0, 512);
        assert!(map.is_dirty(0), "still one write in flight");
        map.write_complete(0, 512);
        assert!(!map.is_dirty(0));
    }

    #[test]
    fn test_needs_resync_keeps_extent_dirty() {
        let mut map = ExtentMap::new(16 * EXTENT, EXTENT);
        map.write_start(0, 512);
        map.mark_needs_resync(0, 512);
        map.write_complete(0, 512);
        assert!(map.is_dirty(0), "missed remote write must stay dirty");

        map.extent_complete(0);
        assert!(!map.is_dirty(0));
    }

    #[test]
    fn test_extent_complete_on_clean_is_noop() {
        let mut map = ExtentMap::new(16 * EXTENT, EXTENT);
        map.extent_complete(3);
        assert_eq!(map.ndirty(), 0);
        assert!(!map.take_modified());
    }

    #[test]
    fn test_scan_order_and_rewind() {
        let mut map = ExtentMap::new(16 * EXTENT, EXTENT);
        map.write_start(2 * EXTENT, 1);
        map.mark_needs_resync(2 * EXTENT, 1);
        map.write_start(5 * EXTENT, 1);
        map.mark_needs_resync(5 * EXTENT, 1);
        map.write_complete(2 * EXTENT, 1);
        map.write_complete(5 * EXTENT, 1);

        assert_eq!(map.next_dirty().unwrap().index, 2);
        assert_eq!(map.next_dirty().unwrap().index, 5);
        assert!(map.next_dirty().is_none());

        map.rewind();
        assert_eq!(map.next_dirty().unwrap().index, 2);
    }

    #[test]
    fn test_short_last_extent() {
        let mut map = ExtentMap::new(2 * EXTENT + 100, EXTENT);
        assert_eq!(map.nextents(), 3);
        map.write_start(2 * EXTENT + 50, 10);
        map.mark_needs_resync(2 * EXTENT + 50, 10);
        map.write_complete(2 * EXTENT + 50, 10);

        map.next_dirty();
        map.rewind();
        let ext = map.next_dirty().unwrap();
        assert_eq!(ext.index, 2);
        assert_eq!(ext.length, 100);
    }

    #[test]
    fn test_merge_unions_dirty_bits() {
        let mut ours = ExtentMap::new(16 * EXTENT, EXTENT);
        ours.write_start(0, 1);

        let mut theirs = ExtentMap::new(16 * EXTENT, EXTENT);
        theirs.write_start(9 * EXTENT, 1);

        ours.merge(&theirs.to_image());
        assert!(ours.is_dirty(0));
        assert!(ours.is_dirty(9));
        assert_eq!(ours.ndirty(), 2);
    }

    #[test]
    fn test_store_reload_preserves_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol0.extents");

        let store = ExtentMapStore::create(&path, 16 * EXTENT, EXTENT).unwrap();
        store.write_start(3 * EXTENT, 10).unwrap();
        // Simulate a crash before the write completed: the persisted image
        // must still show the extent dirty.
        drop(store);

        let reloaded = ExtentMapStore::load(&path, 16 * EXTENT, EXTENT).unwrap();
        assert!(reloaded.is_dirty(3));
        assert_eq!(reloaded.ndirty(), 1);
    }

    #[test]
    fn test_store_geometry_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol0.extents");
        ExtentMapStore::create(&path, 16 * EXTENT, EXTENT).unwrap();
        assert!(ExtentMapStore::load(&path, 64 * EXTENT, EXTENT).is_err());
    }
}
