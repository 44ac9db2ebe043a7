//
// Persistent inode store: a transactional mapping ino -> record plus a
// (parent, name) -> child directory index, backed by redb.
//


use std::collections::HashSet;
use std::fs;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::errors::{Error, Result};
use crate::nodes::{
    validate_name, InodeRecord, Kind, NodeAttrs, NodeFlags, INVALID_INO, ROOT_INO,
};

const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const INODE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("inode");
const DIRENT_TABLE: TableDefinition<(u64, &[u8]), u64> = TableDefinition::new("dirent");

const SCHEMA_VERSION: u64 = 1;
const STORE_FILE: &str = "inodes.redb";

pub struct InodeStore {
    db: Database,
}

impl InodeStore {
    /// Open or create the store rooted at `dir`. The root inode exists
    /// afterwards; structurally invalid pre-existing data is refused.
    pub fn initialize(dir: &Path) -> Result<InodeStore> {
        fs::create_dir_all(dir)?;
        let db = Database::create(dir.join(STORE_FILE))?;
        let store = InodeStore { db };
        store.bootstrap()?;
        Ok(store)
    }

    fn bootstrap(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut meta = txn.open_table(META_TABLE)?;
            let mut inodes = txn.open_table(INODE_TABLE)?;
            txn.open_table(DIRENT_TABLE)?;

            let version = meta.get("schema_version")?.map(|v| v.value());
            match version {
                None => {
                    meta.insert("schema_version", SCHEMA_VERSION)?;
                }
                Some(v) if v != SCHEMA_VERSION => {
                    return Err(Error::CorruptStore(format!(
                        "unsupported schema version {}",
                        v
                    )));
                }
                Some(_) => {}
            }

            if meta.get("next_ino")?.is_none() {
                meta.insert("next_ino", ROOT_INO + 1)?;
            }

            let root = inodes.get(ROOT_INO)?.map(|raw| raw.value().to_vec());
            match root {
                Some(raw) => {
                    let rec = InodeRecord::decode(&raw)?;
                    if !rec.is_dir() {
                        return Err(Error::CorruptStore(
                            "root inode is not a directory".to_string(),
                        ));
                    }
                }
                None => {
                    let rec = InodeRecord::new(ROOT_INO, ROOT_INO, &NodeAttrs::new_root_dir());
                    inodes.insert(ROOT_INO, rec.encode().as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn begin_ro(&self) -> Result<RoTxn> {
        Ok(RoTxn {
            txn: self.db.begin_read()?,
        })
    }

    pub fn begin_rw(&self) -> Result<RwTxn> {
        Ok(RwTxn {
            txn: self.db.begin_write()?,
        })
    }
}

/// Snapshot-isolated read scope. Any number may be open concurrently.
pub struct RoTxn {
    txn: redb::ReadTransaction,
}

impl RoTxn {
    pub fn getattr(&self, ino: u64) -> Result<InodeRecord> {
        read_record(&self.txn.open_table(INODE_TABLE)?, ino)
    }

    pub fn lookup(&self, parent: u64, name: &[u8]) -> Result<u64> {
        read_child(&self.txn.open_table(DIRENT_TABLE)?, parent, name)
    }

    pub fn readdir(&self, parent: u64, after: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        read_entries(&self.txn.open_table(DIRENT_TABLE)?, parent, after)
    }

    pub fn entry_name(&self, parent: u64, child: u64) -> Result<Vec<u8>> {
        find_entry_name(&self.txn.open_table(DIRENT_TABLE)?, parent, child)
    }

    pub fn test_flag(&self, ino: u64, flag: NodeFlags) -> Result<bool> {
        Ok(self.getattr(ino)?.flags.contains(flag))
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let rec = self.getattr(ino)?;
        if rec.kind != Kind::Link {
            return Err(Error::NotALink);
        }
        Ok(rec.link_target)
    }
}

/// Exclusive write scope. Commits atomically through `commit`; dropping
/// the scope without committing (including on panic) aborts it.
pub struct RwTxn {
    txn: redb::WriteTransaction,
}

impl RwTxn {
    pub fn getattr(&self, ino: u64) -> Result<InodeRecord> {
        read_record(&self.txn.open_table(INODE_TABLE)?, ino)
    }

    pub fn lookup(&self, parent: u64, name: &[u8]) -> Result<u64> {
        read_child(&self.txn.open_table(DIRENT_TABLE)?, parent, name)
    }

    pub fn readdir(&self, parent: u64, after: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        read_entries(&self.txn.open_table(DIRENT_TABLE)?, parent, after)
    }

    pub fn entry_name(&self, parent: u64, child: u64) -> Result<Vec<u8>> {
        find_entry_name(&self.txn.open_table(DIRENT_TABLE)?, parent, child)
    }

    pub fn test_flag(&self, ino: u64, flag: NodeFlags) -> Result<bool> {
        Ok(self.getattr(ino)?.flags.contains(flag))
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>> {
        let rec = self.getattr(ino)?;
        if rec.kind != Kind::Link {
            return Err(Error::NotALink);
        }
        Ok(rec.link_target)
    }

    /// Create or refresh the binding (parent, name). An existing binding
    /// of the same kind keeps its inode and gets its attributes updated;
    /// a kind change discards the old inode and its subtree and allocates
    /// a fresh number. Numbers are never reused.
    pub fn emplace(&mut self, parent: u64, name: &[u8], attrs: &NodeAttrs) -> Result<u64> {
        validate_name(name)?;
        let parent_rec = self.getattr(parent)?;
        if !parent_rec.is_dir() {
            return Err(Error::NotADirectory);
        }

        let existing = {
            let dirents = self.txn.open_table(DIRENT_TABLE)?;
            let value = dirents.get((parent, name))?.map(|child| child.value());
            value
        };

        if let Some(child) = existing {
            let mut rec = self.getattr(child)?;
            if rec.kind == attrs.kind {
                rec.apply(attrs);
                self.put_record(&rec)?;
                return Ok(child);
            }
            self.remove_subtree(child)?;
            self.delete_record(child)?;
            let mut dirents = self.txn.open_table(DIRENT_TABLE)?;
            dirents.remove((parent, name))?;
        }

        let ino = self.allocate_ino()?;
        self.put_record(&InodeRecord::new(ino, parent, attrs))?;
        let mut dirents = self.txn.open_table(DIRENT_TABLE)?;
        dirents.insert((parent, name), ino)?;
        Ok(ino)
    }

    /// Refresh attributes in place. A kind change is not applied here;
    /// the caller re-emplaces under (parent, name) instead.
    pub fn set_attr(&mut self, ino: u64, attrs: &NodeAttrs) -> Result<()> {
        let mut rec = self.getattr(ino)?;
        if rec.kind != attrs.kind {
            return Err(Error::KindMismatch);
        }
        rec.apply(attrs);
        self.put_record(&rec)
    }

    pub fn set_link(&mut self, ino: u64, target: &[u8]) -> Result<()> {
        let mut rec = self.getattr(ino)?;
        if rec.kind != Kind::Link {
            return Err(Error::NotALink);
        }
        rec.link_target = target.to_vec();
        self.put_record(&rec)
    }

    pub fn set_flag(&mut self, ino: u64, flag: NodeFlags, on: bool) -> Result<()> {
        let mut rec = self.getattr(ino)?;
        rec.flags.set(flag, on);
        self.put_record(&rec)
    }

    /// Drop a binding. The child record stays; inode numbers are stable
    /// and never reused. Removing an absent binding is a no-op.
    pub fn remove_entry(&mut self, parent: u64, name: &[u8]) -> Result<()> {
        let mut dirents = self.txn.open_table(DIRENT_TABLE)?;
        dirents.remove((parent, name))?;
        Ok(())
    }

    /// Reconcile a directory against a complete backend listing: keep the
    /// bindings whose names were observed, drop the rest.
    pub fn retain_entries(&mut self, parent: u64, observed: &HashSet<Vec<u8>>) -> Result<()> {
        let stale: Vec<Vec<u8>> = self
            .readdir(parent, INVALID_INO)?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !observed.contains(name))
            .collect();
        let mut dirents = self.txn.open_table(DIRENT_TABLE)?;
        for name in stale {
            dirents.remove((parent, name.as_slice()))?;
        }
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }

    fn put_record(&mut self, rec: &InodeRecord) -> Result<()> {
        let mut inodes = self.txn.open_table(INODE_TABLE)?;
        inodes.insert(rec.ino, rec.encode().as_slice())?;
        Ok(())
    }

    fn delete_record(&mut self, ino: u64) -> Result<()> {
        let mut inodes = self.txn.open_table(INODE_TABLE)?;
        inodes.remove(ino)?;
        Ok(())
    }

    fn allocate_ino(&mut self) -> Result<u64> {
        let mut meta = self.txn.open_table(META_TABLE)?;
        let next = meta
            .get("next_ino")?
            .map(|v| v.value())
            .ok_or_else(|| Error::CorruptStore("missing next_ino".to_string()))?;
        meta.insert("next_ino", next + 1)?;
        Ok(next)
    }

    fn remove_subtree(&mut self, ino: u64) -> Result<()> {
        let children = self.readdir(ino, INVALID_INO)?;
        for (name, child) in children {
            self.remove_subtree(child)?;
            self.delete_record(child)?;
            let mut dirents = self.txn.open_table(DIRENT_TABLE)?;
            dirents.remove((ino, name.as_slice()))?;
        }
        Ok(())
    }
}

fn read_record<T>(table: &T, ino: u64) -> Result<InodeRecord>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let raw = table.get(ino)?.ok_or(Error::NotFound)?;
    InodeRecord::decode(raw.value())
}

fn read_child<T>(table: &T, parent: u64, name: &[u8]) -> Result<u64>
where
    T: ReadableTable<(u64, &'static [u8]), u64>,
{
    Ok(table.get((parent, name))?.ok_or(Error::NotFound)?.value())
}

/// Entries of `parent` with a child ino strictly greater than `after`,
/// ascending by child ino. Allocation order doubles as the directory
/// cursor, so refreshed entries keep their position and new ones append.
fn read_entries<T>(table: &T, parent: u64, after: u64) -> Result<Vec<(Vec<u8>, u64)>>
where
    T: ReadableTable<(u64, &'static [u8]), u64>,
{
    let mut entries = Vec::new();
    let start: (u64, &[u8]) = (parent, b"");
    for item in table.range(start..)? {
        let (key, child) = item?;
        let (p, name) = key.value();
        if p != parent {
            break;
        }
        let child = child.value();
        if child > after {
            entries.push((name.to_vec(), child));
        }
    }
    entries.sort_by_key(|(_, ino)| *ino);
    Ok(entries)
}

fn find_entry_name<T>(table: &T, parent: u64, child: u64) -> Result<Vec<u8>>
where
    T: ReadableTable<(u64, &'static [u8]), u64>,
{
    let start: (u64, &[u8]) = (parent, b"");
    for item in table.range(start..)? {
        let (key, value) = item?;
        let (p, name) = key.value();
        if p != parent {
            break;
        }
        if value.value() == child {
            return Ok(name.to_vec());
        }
    }
    Err(Error::NotFound)
}
