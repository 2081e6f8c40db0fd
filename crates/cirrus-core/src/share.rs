//! Shares and the storage collaborator behind them.
//!
//! The session layer never looks inside a share's directory. Everything it
//! needs (current revision, listing, key check, where to deliver peer
//! notifications) goes through [`ShareStore`]. [`MemoryStore`] keeps the
//! listing in memory and is what [`Server::attach_share`] uses by default.
//!
//! [`Server::attach_share`]: crate::server::Server::attach_share

use crate::message::{FileData, FileEntry, KeyMaterial, Keys, Move, Update};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of the share set, taken when a connection is accepted
pub type ShareSnapshot = Arc<BTreeMap<String, Share>>;

/// Size of a share identifier in bytes (hex encoded on the wire)
pub const SHARE_ID_SIZE: usize = 32;

/// File data headers a [`MemoryStore`] remembers
pub const RECEIVED_HISTORY: usize = 64;

/// Generate a fresh random share identifier
#[must_use]
pub fn generate_share_id() -> String {
    hex::encode(rand::random::<[u8; SHARE_ID_SIZE]>())
}

/// Storage collaborator of a share
///
/// Implementations must be safe to call from several sessions at once.
pub trait ShareStore: Send + Sync + fmt::Debug {
    /// Current manifest revision
    fn revision(&self) -> u64;

    /// Full listing, tombstones included
    fn manifest(&self) -> Vec<FileEntry>;

    /// Listing entry for one path
    fn entry(&self, path: &str) -> Option<FileEntry>;

    /// Whether the key material grants access to this share
    fn accepts_keys(&self, keys: &Keys) -> bool;

    /// Peer announced a changed file
    fn apply_update(&self, update: &Update);

    /// Peer announced a moved file
    fn apply_move(&self, mv: &Move);

    /// Header of file contents requested from the peer; the bytes follow
    /// through the transport
    fn receive_file(&self, data: &FileData);
}

/// One synchronized directory
#[derive(Debug, Clone)]
pub struct Share {
    id: String,
    path: PathBuf,
    dbpath: Option<PathBuf>,
    store: Arc<dyn ShareStore>,
}

impl Share {
    /// Create a share with a fresh identifier
    pub fn new(
        path: impl Into<PathBuf>,
        dbpath: Option<PathBuf>,
        store: Arc<dyn ShareStore>,
    ) -> Self {
        Self::with_id(generate_share_id(), path, dbpath, store)
    }

    /// Create a share with a known identifier
    pub fn with_id(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        dbpath: Option<PathBuf>,
        store: Arc<dyn ShareStore>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            dbpath,
            store,
        }
    }

    /// Share identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Root directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Database location, if kept apart from the share
    #[must_use]
    pub fn dbpath(&self) -> Option<&Path> {
        self.dbpath.as_deref()
    }

    /// Storage collaborator
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ShareStore> {
        &self.store
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    revision: u64,
    files: BTreeMap<String, FileEntry>,
    received: VecDeque<FileData>,
}

/// In-memory [`ShareStore`]
///
/// Every applied update or move bumps the revision by one.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    psk: Option<String>,
}

impl MemoryStore {
    /// Empty store accepting any well-formed key material
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store accepting only this pre-shared key
    #[must_use]
    pub fn with_psk(psk: impl Into<String>) -> Self {
        Self {
            psk: Some(psk.into()),
            ..Self::default()
        }
    }

    /// Store pre-populated with a listing at a given revision
    #[must_use]
    pub fn with_files(revision: u64, files: impl IntoIterator<Item = FileEntry>) -> Self {
        let store = Self::default();
        {
            let mut state = store.write();
            state.revision = revision;
            state.files = files.into_iter().map(|f| (f.path.clone(), f)).collect();
        }
        store
    }

    /// Most recent file data headers, oldest first, at most
    /// [`RECEIVED_HISTORY`]
    #[must_use]
    pub fn received(&self) -> Vec<FileData> {
        self.read().received.iter().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_matches(&self, material: &KeyMaterial) -> bool {
        match &self.psk {
            Some(psk) => material.psk.as_deref() == Some(psk.as_str()),
            None => material.valid(),
        }
    }
}

impl ShareStore for MemoryStore {
    fn revision(&self) -> u64 {
        self.read().revision
    }

    fn manifest(&self) -> Vec<FileEntry> {
        self.read().files.values().cloned().collect()
    }

    fn entry(&self, path: &str) -> Option<FileEntry> {
        self.read().files.get(path).cloned()
    }

    fn accepts_keys(&self, keys: &Keys) -> bool {
        keys.material(keys.access)
            .is_some_and(|material| self.key_matches(material))
    }

    fn apply_update(&self, update: &Update) {
        let mut state = self.write();
        state
            .files
            .insert(update.file.path.clone(), update.file.clone());
        state.revision += 1;
        tracing::debug!(path = %update.file.path, revision = state.revision, "applied update");
    }

    fn apply_move(&self, mv: &Move) {
        let mut state = self.write();
        state.files.remove(&mv.source);
        state
            .files
            .insert(mv.destination.path.clone(), mv.destination.clone());
        state.revision += 1;
        tracing::debug!(
            from = %mv.source,
            to = %mv.destination.path,
            revision = state.revision,
            "applied move"
        );
    }

    fn receive_file(&self, data: &FileData) {
        let mut state = self.write();
        if state.received.len() == RECEIVED_HISTORY {
            state.received.pop_front();
        }
        state.received.push_back(data.clone());
    }
}
