//! Replication Metadata
//!
//! The persisted per-resource replication state: resource identity, the two
//! generation counters and the sync-source flag that together decide which
//! node holds authoritative data after a disconnect. Counters are written to
//! stable storage before the in-memory copy is considered authoritative.
//!
//! Counter model: `local_gen` is the generation of this node's own data;
//! `peer_gen` is the peer's `local_gen` as of the last proven full sync.
//! The pair is fully in sync exactly when the counters match crosswise:
//! `a.local_gen == b.peer_gen && b.local_gen == a.peer_gen`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Which component holds authoritative data for regions not proven in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSource {
    /// Both components hold the same data
    Undefined,
    /// The local component is ahead
    Primary,
    /// The remote component is ahead
    Secondary,
}

/// Generation counters as exchanged during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenCounters {
    pub local_gen: u64,
    pub peer_gen: u64,
}

/// Persisted metadata document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Resource unique id, shared by both nodes; generated on first primary
    /// start and adopted by the secondary on first contact
    pub resource_id: Option<Uuid>,

    /// Generation of this node's data
    pub local_gen: u64,

    /// Peer generation at the last proven full sync
    pub peer_gen: u64,

    /// Current sync source
    pub sync_source: SyncSource,

    /// Timestamp of the last persisted mutation
    pub updated_at: DateTime<Utc>,
}

impl Metadata {
    /// Fresh metadata for a newly created resource
    pub fn new() -> Self {
        Self {
            resource_id: None,
            local_gen: 1,
            peer_gen: 1,
            sync_source: SyncSource::Undefined,
            updated_at: Utc::now(),
        }
    }

    pub fn counters(&self) -> GenCounters {
        GenCounters {
            local_gen: self.local_gen,
            peer_gen: self.peer_gen,
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Decide the sync source from our counters and the peer's, as seen from the
/// primary. Crosswise equality means in sync; exactly one side ahead picks a
/// direction; both sides ahead is a split brain and refuses the connection.
pub fn resolve_sync_source(ours: GenCounters, theirs: GenCounters) -> Result<SyncSource> {
    if ours.local_gen == theirs.peer_gen && ours.peer_gen == theirs.local_gen {
        Ok(SyncSource::Undefined)
    } else if ours.local_gen > theirs.peer_gen && ours.peer_gen == theirs.local_gen {
        Ok(SyncSource::Primary)
    } else if ours.local_gen == theirs.peer_gen && ours.peer_gen < theirs.local_gen {
        Ok(SyncSource::Secondary)
    } else {
        Err(Error::SplitBrain {
            local_gen: ours.local_gen,
            peer_gen: ours.peer_gen,
            remote_local_gen: theirs.local_gen,
            remote_peer_gen: theirs.peer_gen,
        })
    }
}

/// Metadata store: in-memory state plus synchronous write-ahead persistence.
/// The peer's last-seen counters live here too; they are handshake state, not
/// part of the persisted document.
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<Metadata>,
    seen_peer: Mutex<Option<GenCounters>>,
}

impl MetadataStore {
    /// Load an existing metadata document
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Metadata(format!("unable to read {}: {}", path.display(), e))
        })?;
        let state: Metadata = serde_json::from_str(&contents)?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            seen_peer: Mutex::new(None),
        })
    }

    /// Create and persist a fresh document, failing if one already exists
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(Error::Metadata(format!(
                "metadata already exists at {}",
                path.display()
            )));
        }
        let store = Self {
            path: path.to_path_buf(),
            state: Mutex::new(Metadata::new()),
            seen_peer: Mutex::new(None),
        };
        store.persist(&store.snapshot())?;
        Ok(store)
    }

    /// Current state copy
    pub fn snapshot(&self) -> Metadata {
        self.state.lock().unwrap().clone()
    }

    pub fn sync_source(&self) -> SyncSource {
        self.state.lock().unwrap().sync_source
    }

    pub fn counters(&self) -> GenCounters {
        self.state.lock().unwrap().counters()
    }

    /// Peer counters recorded at the last handshake
    pub fn seen_peer(&self) -> Option<GenCounters> {
        *self.seen_peer.lock().unwrap()
    }

    /// Record the peer's counters after a handshake
    pub fn record_peer(&self, counters: GenCounters) {
        *self.seen_peer.lock().unwrap() = Some(counters);
    }

    /// Return the resource id, generating and persisting one on first use
    pub fn ensure_resource_id(&self) -> Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.resource_id {
            return Ok(id);
        }
        let id = Uuid::new_v4();
        state.resource_id = Some(id);
        state.updated_at = Utc::now();
        self.persist(&state)?;
        Ok(id)
    }

    pub fn resource_id(&self) -> Option<Uuid> {
        self.state.lock().unwrap().resource_id
    }

    /// Adopt the primary's resource id on first contact (secondary side)
    pub fn adopt_resource_id(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.resource_id {
            Some(existing) if existing != id => Err(Error::Metadata(format!(
                "resource id mismatch: ours {}, peer {}",
                existing, id
            ))),
            Some(_) => Ok(()),
            None => {
                state.resource_id = Some(id);
                state.updated_at = Utc::now();
                self.persist(&state)
            }
        }
    }

    /// Set and persist the sync source
    pub fn set_sync_source(&self, source: SyncSource) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.sync_source == source {
            return Ok(());
        }
        state.sync_source = source;
        state.updated_at = Utc::now();
        self.persist(&state)
    }

    /// Bump the local generation on the first write after the remote became
    /// unreachable: only when the peer last believed it held all our data.
    /// Returns true when the counter actually moved.
    pub fn bump_local_gen_if_synced(&self) -> Result<bool> {
        let seen = match self.seen_peer() {
            Some(seen) => seen,
            None => return Ok(false),
        };
        let mut state = self.state.lock().unwrap();
        if state.local_gen != seen.peer_gen {
            return Ok(false);
        }
        state.local_gen += 1;
        state.updated_at = Utc::now();
        self.persist(&state)?;
        tracing::debug!(local_gen = state.local_gen, "increased local generation");
        Ok(true)
    }

    /// Equalize counters after a completed resynchronization: the peer's data
    /// generation is now fully replicated here, and sync source clears. The
    /// recorded peer counters advance too, since the peer records our
    /// generation from the completion announcement; the bump guard must see
    /// the post-sync state, not the handshake-time one.
    pub fn equalize(&self, peer: GenCounters) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.peer_gen = peer.local_gen;
        state.sync_source = SyncSource::Undefined;
        state.updated_at = Utc::now();
        *self.seen_peer.lock().unwrap() = Some(GenCounters {
            local_gen: peer.local_gen,
            peer_gen: state.local_gen,
        });
        self.persist(&state)
    }

    /// Record a peer-announced sync completion (secondary side): our copy of
    /// the peer's generation is now current.
    pub fn record_sync_done(&self, peer_local_gen: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.peer_gen = peer_local_gen;
        state.sync_source = SyncSource::Undefined;
        state.updated_at = Utc::now();
        self.persist(&state)
    }

    /// Write-ahead persistence: serialize to a temporary file, sync it, then
    /// rename over the document.
    fn persist(&self, state: &Metadata) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let contents = serde_json::to_vec_pretty(state)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent() {
            // Make the rename durable as well.
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(local_gen: u64, peer_gen: u64) -> GenCounters {
        GenCounters { local_gen, peer_gen }
    }

    #[test]
    fn test_resolve_in_sync() {
        let source = resolve_sync_source(counters(2, 1), counters(1, 2)).unwrap();
        assert_eq!(source, SyncSource::Undefined);
    }

    #[test]
    fn test_resolve_primary_ahead() {
        // We wrote while the peer was away: our local_gen moved past what the
        // peer has replicated.
        let source = resolve_sync_source(counters(2, 1), counters(1, 1)).unwrap();
        assert_eq!(source, SyncSource::Primary);
    }

    #[test]
    fn test_resolve_secondary_ahead() {
        let source = resolve_sync_source(counters(1, 1), counters(2, 1)).unwrap();
        assert_eq!(source, SyncSource::Secondary);
    }

    #[test]
    fn test_resolve_split_brain() {
        let err = resolve_sync_source(counters(2, 1), counters(2, 1)).unwrap_err();
        assert!(matches!(err, Error::SplitBrain { .. }));
    }

    #[test]
    fn test_fresh_pair_in_sync() {
        let a = Metadata::new().counters();
        let b = Metadata::new().counters();
        assert_eq!(resolve_sync_source(a, b).unwrap(), SyncSource::Undefined);
    }

    #[test]
    fn test_bump_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::create(&dir.path().join("meta.json")).unwrap();
        store.record_peer(counters(1, 1));

        assert!(store.bump_local_gen_if_synced().unwrap());
        // Further writes while still disconnected must not bump again.
        assert!(!store.bump_local_gen_if_synced().unwrap());
        assert!(!store.bump_local_gen_if_synced().unwrap());
        assert_eq!(store.counters().local_gen, 2);
    }

    #[test]
    fn test_no_bump_without_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::create(&dir.path().join("meta.json")).unwrap();
        assert!(!store.bump_local_gen_if_synced().unwrap());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let store = MetadataStore::create(&path).unwrap();
        let id = store.ensure_resource_id().unwrap();
        store.record_peer(counters(1, 1));
        store.bump_local_gen_if_synced().unwrap();
        store.set_sync_source(SyncSource::Primary).unwrap();

        let reloaded = MetadataStore::load(&path).unwrap();
        assert_eq!(reloaded.resource_id(), Some(id));
        assert_eq!(reloaded.counters(), counters(2, 1));
        assert_eq!(reloaded.sync_source(), SyncSource::Primary);
    }

    #[test]
    fn test_equalize_restores_in_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::create(&dir.path().join("meta.json")).unwrap();
        store.record_peer(counters(1, 1));
        store.bump_local_gen_if_synced().unwrap();

        // After resync the peer holds generation 2 of our data; the peer
        // records it via SyncDone, we record theirs here.
        store.equalize(counters(1, 2)).unwrap();
        assert_eq!(store.sync_source(), SyncSource::Undefined);
        assert_eq!(
            resolve_sync_source(store.counters(), counters(1, 2)).unwrap(),
            SyncSource::Undefined
        );

        // A second outage must bump again off the post-sync peer view.
        assert!(store.bump_local_gen_if_synced().unwrap());
        assert_eq!(store.counters().local_gen, 3);
    }
}
