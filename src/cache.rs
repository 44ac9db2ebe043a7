//
// Cache façade over the inode store.
//

use std::path::Path;

use log::info;

use crate::errors::Result;
use crate::store::{InodeStore, RoTxn, RwTxn};

/// Owner of the persistent metadata cache. Holds the store (and thereby
/// the database file and its lock; a second process opening the same
/// cache directory is refused by the engine) and hands out transaction
/// scopes to the coordinator.
///
/// Flag protocol: a directory carries SYNCED once a connected `opendir`
/// has streamed a complete backend listing into the store and reconciled
/// the entry set against it. Only then may `readdir` claim the cached
/// listing while the backend is unreachable. SYNCED speaks for one
/// directory's own entries, never for its children.
///
/// Transactions are short-lived and never span backend I/O: callers talk
/// to the backend first, then open a write scope to apply the result.
pub struct MetaCache {
    store: InodeStore,
}

impl MetaCache {
    /// Open or create the cache under `dir`. The root inode exists when
    /// this returns.
    pub fn open(dir: &Path) -> Result<MetaCache> {
        let store = InodeStore::initialize(dir)?;
        info!("metadata cache ready at {}", dir.display());
        Ok(MetaCache { store })
    }

    pub fn begin_ro(&self) -> Result<RoTxn> {
        self.store.begin_ro()
    }

    pub fn begin_rw(&self) -> Result<RwTxn> {
        self.store.begin_rw()
    }
}
