//! Persistent set of blocked application uids, consulted on the hot path.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Storage for the blocked set. Failures never affect the in-memory view.
pub trait BlocklistStore: Send + Sync {
    fn load(&self) -> io::Result<Vec<i32>>;
    fn store(&self, uids: &[i32]) -> io::Result<()>;
}

pub struct Blocklist {
    blocked: RwLock<HashSet<i32>>,
    store: Box<dyn BlocklistStore>,
}

impl Blocklist {
    pub fn new(store: Box<dyn BlocklistStore>) -> Arc<Self> {
        Arc::new(Self {
            blocked: RwLock::new(HashSet::new()),
            store,
        })
    }

    /// Populate from storage, replacing the in-memory set.
    pub fn load(&self) {
        match self.store.load() {
            Ok(uids) => {
                *self.blocked.write() = uids.into_iter().collect();
            }
            Err(error) => warn!(%error, "blocklist load failed, starting empty"),
        }
    }

    pub fn is_blocked(&self, uid: i32) -> bool {
        self.blocked.read().contains(&uid)
    }

    /// Flip membership and write through. Returns the new membership state.
    /// The in-memory set stays authoritative when the write fails; the next
    /// successful write reconciles.
    pub fn toggle(&self, uid: i32) -> bool {
        let (now_blocked, snapshot) = {
            let mut guard = self.blocked.write();
            let now_blocked = if !guard.remove(&uid) {
                guard.insert(uid);
                true
            } else {
                false
            };
            let mut snapshot: Vec<i32> = guard.iter().copied().collect();
            snapshot.sort_unstable();
            (now_blocked, snapshot)
        };
        if let Err(error) = self.store.store(&snapshot) {
            warn!(uid, %error, "blocklist persist failed, in-memory set kept");
        }
        now_blocked
    }

    pub fn len(&self) -> usize {
        self.blocked.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.read().is_empty()
    }
}

/// Flat-file store: one string-encoded uid per line.
pub struct FileBlocklistStore {
    path: PathBuf,
}

impl FileBlocklistStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl BlocklistStore for FileBlocklistStore {
    fn load(&self) -> io::Result<Vec<i32>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    fn store(&self, uids: &[i32]) -> io::Result<()> {
        let body = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(&self.path, body)
    }
}

/// Store that keeps nothing; for hosts that manage persistence elsewhere.
#[derive(Default)]
pub struct NullBlocklistStore;

impl BlocklistStore for NullBlocklistStore {
    fn load(&self) -> io::Result<Vec<i32>> {
        Ok(Vec::new())
    }

    fn store(&self, _uids: &[i32]) -> io::Result<()> {
        Ok(())
    }
}
