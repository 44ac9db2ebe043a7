//
// The filesystem coordinator: picks the source of truth per operation
// (cache vs backend), keeps the cache fresh from backend results, and
// talks to the kernel through fuser.
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendResult, DirIter};
    use crate::nodes::{NodeAttrs, Timespec, INVALID_INO};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct MockNode {
        attrs: NodeAttrs,
        target: Vec<u8>,
        children: Vec<Vec<u8>>,
        content: Vec<u8>,
    }

    #[derive(Default)]
    struct MockState {
        nodes: Mutex<HashMap<PathBuf, MockNode>>,
        connected: AtomicBool,
        break_listing_after: Mutex<Option<usize>>,
    }

    struct MockBackend {
        state: Arc<MockState>,
    }

    impl Backend for MockBackend {
        fn is_connected(&self) -> bool {
            self.state.connected.load(Ordering::SeqCst)
        }

        fn lstat(&self, path: &Path) -> BackendResult<NodeAttrs> {
            let nodes = self.state.nodes.lock().unwrap();
            let node = nodes.get(path).ok_or(libc::ENOENT)?;
            Ok(node.attrs.clone())
        }

        fn readdir(&self, path: &Path) -> BackendResult<DirIter<'_>> {
            let nodes = self.state.nodes.lock().unwrap();
            let node = nodes.get(path).ok_or(libc::ENOENT)?;
            if node.attrs.kind != Kind::Directory {
                return Err(libc::ENOTDIR);
            }
            let mut items: Vec<BackendResult<(Vec<u8>, NodeAttrs)>> = node
                .children
                .iter()
                .map(|name| {
                    let child = nodes
                        .get(&path.join(OsStr::from_bytes(name)))
                        .expect("mock tree is consistent");
                    Ok((name.clone(), child.attrs.clone()))
                })
                .collect();
            if let Some(n) = *self.state.break_listing_after.lock().unwrap() {
                items.truncate(n);
                items.push(Err(libc::EIO));
            }
            Ok(Box::new(items.into_iter()))
        }

        fn readlink(&self, path: &Path) -> BackendResult<Vec<u8>> {
            let nodes = self.state.nodes.lock().unwrap();
            let node = nodes.get(path).ok_or(libc::ENOENT)?;
            if node.attrs.kind != Kind::Link {
                return Err(libc::EINVAL);
            }
            Ok(node.target.clone())
        }

        fn open(&self, path: &Path) -> BackendResult<u64> {
            let nodes = self.state.nodes.lock().unwrap();
            let node = nodes.get(path).ok_or(libc::ENOENT)?;
            if node.attrs.kind == Kind::Directory {
                return Err(libc::EISDIR);
            }
            // a handle in the mock is just a token for the path
            Ok(path_token(path))
        }

        fn pread(&self, handle: u64, offset: u64, len: u32) -> BackendResult<Vec<u8>> {
            let nodes = self.state.nodes.lock().unwrap();
            let node = nodes
                .iter()
                .find(|(path, _)| path_token(path) == handle)
                .map(|(_, node)| node)
                .ok_or(libc::EBADF)?;
            let start = (offset as usize).min(node.content.len());
            let end = (start + len as usize).min(node.content.len());
            Ok(node.content[start..end].to_vec())
        }

        fn release(&self, _handle: u64) -> BackendResult<()> {
            Ok(())
        }
    }

    fn path_token(path: &Path) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        path.hash(&mut hasher);
        hasher.finish()
    }

    fn mock_attrs(kind: Kind, perm: u32, size: u64) -> NodeAttrs {
        let fmt = match kind {
            Kind::Regular => libc::S_IFREG,
            Kind::Directory => libc::S_IFDIR,
            Kind::Link => libc::S_IFLNK,
        };
        NodeAttrs {
            kind,
            mode: fmt | perm,
            uid: 1234,
            gid: 4321,
            size,
            atime: Timespec { sec: 1_700_000_001, nsec: 0 },
            mtime: Timespec { sec: 1_700_000_002, nsec: 0 },
            ctime: Timespec { sec: 1_700_000_003, nsec: 0 },
        }
    }

    fn add_node(state: &MockState, path: &str, node: MockNode) {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            let mut nodes = state.nodes.lock().unwrap();
            if let Some(parent_node) = nodes.get_mut(parent) {
                parent_node
                    .children
                    .push(path.file_name().unwrap().as_bytes().to_vec());
            }
            nodes.insert(path, node);
        }
    }

    fn populate(state: &MockState) {
        state.nodes.lock().unwrap().insert(
            PathBuf::new(),
            MockNode {
                attrs: mock_attrs(Kind::Directory, 0o755, 0),
                target: Vec::new(),
                children: Vec::new(),
                content: Vec::new(),
            },
        );
        add_node(state, "README.md", MockNode {
            attrs: mock_attrs(Kind::Regular, 0o640, 11),
            target: Vec::new(),
            children: Vec::new(),
            content: b"hello world".to_vec(),
        });
        add_node(state, "books", MockNode {
            attrs: mock_attrs(Kind::Directory, 0o755, 0),
            target: Vec::new(),
            children: Vec::new(),
            content: Vec::new(),
        });
        add_node(state, "books/b1.txt", MockNode {
            attrs: mock_attrs(Kind::Regular, 0o644, 3),
            target: Vec::new(),
            children: Vec::new(),
            content: b"one".to_vec(),
        });
        add_node(state, "books/b2.txt", MockNode {
            attrs: mock_attrs(Kind::Regular, 0o644, 3),
            target: Vec::new(),
            children: Vec::new(),
            content: b"two".to_vec(),
        });
        add_node(state, "note", MockNode {
            attrs: mock_attrs(Kind::Link, 0o777, 9),
            target: b"README.md".to_vec(),
            children: Vec::new(),
            content: Vec::new(),
        });
    }

    fn fixture() -> (StashFs, Arc<MockState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetaCache::open(dir.path()).unwrap();
        let state = Arc::new(MockState::default());
        populate(&state);
        state.connected.store(true, Ordering::SeqCst);
        let backend = BackendAdapter::new(Box::new(MockBackend { state: state.clone() }));
        (StashFs::new(cache, backend), state, dir)
    }

    fn disconnect(state: &MockState) {
        state.connected.store(false, Ordering::SeqCst);
    }

    fn synced(fs: &StashFs, ino: u64) -> bool {
        fs.cache
            .begin_ro()
            .unwrap()
            .test_flag(ino, NodeFlags::SYNCED)
            .unwrap()
    }

    #[test]
    fn test_lookup_populates_cache() {
        let (fs, _state, _dir) = fixture();
        let rec = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();
        assert_ne!(rec.ino, ROOT_INO);
        assert_ne!(rec.ino, INVALID_INO);
        assert_eq!(rec.mode & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(rec.mode & 0o7777, 0o640);
        assert_eq!(rec.uid, 1234);
        assert_eq!(rec.gid, 4321);
        assert_eq!(rec.mtime, Timespec { sec: 1_700_000_002, nsec: 0 });
    }

    #[test]
    fn test_lookup_ino_is_stable() {
        let (fs, _state, _dir) = fixture();
        let first = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();
        let second = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();
        assert_eq!(first.ino, second.ino);
    }

    #[test]
    fn test_lookup_miss() {
        let (fs, _state, _dir) = fixture();
        let err = fs.do_lookup(ROOT_INO, OsStr::new("nope")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_disconnected_uncached_lookup_fails() {
        let (fs, state, _dir) = fixture();
        disconnect(&state);
        let err = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap_err();
        assert!(matches!(err, Error::Disconnected));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_disconnected_cached_lookup_serves() {
        let (fs, state, _dir) = fixture();
        let online = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();
        disconnect(&state);
        let offline = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();
        assert_eq!(offline, online);
    }

    #[test]
    fn test_opendir_sets_synced_on_that_directory_only() {
        let (fs, _state, _dir) = fixture();
        assert!(!synced(&fs, ROOT_INO));
        fs.do_opendir(ROOT_INO).unwrap();
        assert!(synced(&fs, ROOT_INO));

        let books = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();
        assert!(!synced(&fs, books.ino));
    }

    #[test]
    fn test_degraded_readdir_of_unsynced_directory() {
        let (fs, state, _dir) = fixture();
        let books = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();
        disconnect(&state);

        // the handle itself is still granted
        fs.do_opendir(books.ino).unwrap();

        // synthetic entries are available...
        let dots = fs.do_readdir(books.ino, 0).unwrap();
        let names: Vec<_> = dots.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![OsString::from("."), OsString::from("..")]);

        // ...but the listing proper is not
        let err = fs.do_readdir(books.ino, ROOT_INO as i64).unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_synced_readdir_serves_from_cache() {
        let (fs, state, _dir) = fixture();
        fs.do_opendir(ROOT_INO).unwrap();
        disconnect(&state);

        // opendir still succeeds and the synced listing is served; the
        // root's own ino is "."'s cursor, so ".." comes first
        fs.do_opendir(ROOT_INO).unwrap();
        let entries = fs.do_readdir(ROOT_INO, ROOT_INO as i64).unwrap();
        assert_eq!(entries[0].name, OsString::from(".."));
        let mut names: Vec<_> = entries[1..]
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["README.md", "books", "note"]);
    }

    #[test]
    fn test_root_resume_after_dot_still_yields_dotdot() {
        let (fs, _state, _dir) = fixture();
        fs.do_opendir(ROOT_INO).unwrap();

        let from_top = fs.do_readdir(ROOT_INO, 0).unwrap();
        assert_eq!(from_top[0].name, OsString::from("."));
        assert_eq!(from_top[1].name, OsString::from(".."));

        // a kernel buffer may fill right after "."; resuming at its
        // cursor must not skip ".."
        let resumed = fs.do_readdir(ROOT_INO, from_top[0].offset).unwrap();
        assert_eq!(resumed[0].name, OsString::from(".."));
        assert_ne!(resumed[0].offset, from_top[0].offset);

        // and resuming past ".." reaches the listing from the top
        let reals = fs.do_readdir(ROOT_INO, resumed[0].offset).unwrap();
        let names: Vec<_> = reals.iter().map(|e| e.name.clone()).collect();
        let expect: Vec<_> = from_top[2..].iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, expect);
    }

    #[test]
    fn test_readdir_resumes_strictly_after_offset() {
        let (fs, _state, _dir) = fixture();
        fs.do_opendir(ROOT_INO).unwrap();

        let from_top = fs.do_readdir(ROOT_INO, 0).unwrap();
        assert_eq!(from_top[0].name, OsString::from("."));
        assert_eq!(from_top[1].name, OsString::from(".."));
        let reals: Vec<_> = from_top[2..].to_vec();
        assert_eq!(reals.len(), 3);

        let resumed = fs.do_readdir(ROOT_INO, reals[0].offset).unwrap();
        let resumed_names: Vec<_> = resumed.iter().map(|e| e.name.clone()).collect();
        let expect: Vec<_> = reals[1..].iter().map(|e| e.name.clone()).collect();
        assert_eq!(resumed_names, expect);

        let after_last = fs.do_readdir(ROOT_INO, reals[2].offset).unwrap();
        assert!(after_last.is_empty());
    }

    #[test]
    fn test_partial_listing_leaves_synced_unset() {
        let (fs, state, _dir) = fixture();

        // seed a stale binding the backend does not have
        {
            let mut rw = fs.cache.begin_rw().unwrap();
            rw.emplace(ROOT_INO, b"ghost", &mock_attrs(Kind::Regular, 0o644, 0))
                .unwrap();
            rw.commit().unwrap();
        }

        *state.break_listing_after.lock().unwrap() = Some(1);
        fs.do_opendir(ROOT_INO).unwrap();
        assert!(!synced(&fs, ROOT_INO));
        {
            let ro = fs.cache.begin_ro().unwrap();
            // upserts from the broken listing are kept, nothing was removed
            assert!(ro.lookup(ROOT_INO, b"ghost").is_ok());
        }

        // a complete listing reconciles and syncs
        *state.break_listing_after.lock().unwrap() = None;
        fs.do_opendir(ROOT_INO).unwrap();
        assert!(synced(&fs, ROOT_INO));
        let ro = fs.cache.begin_ro().unwrap();
        assert!(ro.lookup(ROOT_INO, b"ghost").is_err());
        assert!(ro.lookup(ROOT_INO, b"README.md").is_ok());
    }

    #[test]
    fn test_lookup_prunes_stale_entry_only_under_synced_parent() {
        let (fs, _state, _dir) = fixture();
        let books = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();

        // unsynced parent: the stale binding survives an ENOENT
        {
            let mut rw = fs.cache.begin_rw().unwrap();
            rw.emplace(books.ino, b"ghost", &mock_attrs(Kind::Regular, 0o644, 0))
                .unwrap();
            rw.commit().unwrap();
        }
        let err = fs.do_lookup(books.ino, OsStr::new("ghost")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(fs.cache.begin_ro().unwrap().lookup(books.ino, b"ghost").is_ok());

        // synced parent: the stale binding is dropped
        fs.do_opendir(ROOT_INO).unwrap();
        {
            let mut rw = fs.cache.begin_rw().unwrap();
            rw.emplace(ROOT_INO, b"ghost", &mock_attrs(Kind::Regular, 0o644, 0))
                .unwrap();
            rw.commit().unwrap();
        }
        let err = fs.do_lookup(ROOT_INO, OsStr::new("ghost")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(fs.cache.begin_ro().unwrap().lookup(ROOT_INO, b"ghost").is_err());
    }

    #[test]
    fn test_kind_change_reallocates_inode() {
        let (fs, state, _dir) = fixture();
        let old = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();
        assert_eq!(old.kind, Kind::Directory);

        {
            let mut nodes = state.nodes.lock().unwrap();
            let node = nodes.get_mut(Path::new("books")).unwrap();
            node.attrs = mock_attrs(Kind::Regular, 0o600, 7);
            node.children.clear();
            node.content = b"not dir".to_vec();
        }

        let fresh = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();
        assert_ne!(fresh.ino, old.ino);
        assert_eq!(fresh.kind, Kind::Regular);
        assert!(matches!(
            fs.cache.begin_ro().unwrap().getattr(old.ino),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_getattr_refreshes_then_serves_cached() {
        let (fs, state, _dir) = fixture();
        let rec = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();

        {
            let mut nodes = state.nodes.lock().unwrap();
            nodes.get_mut(Path::new("README.md")).unwrap().attrs.size = 999;
        }
        let refreshed = fs.do_getattr(rec.ino).unwrap();
        assert_eq!(refreshed.size, 999);

        disconnect(&state);
        let offline = fs.do_getattr(rec.ino).unwrap();
        assert_eq!(offline.size, 999);

        let err = fs.do_getattr(4242).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_readlink_cached_then_offline() {
        let (fs, state, _dir) = fixture();
        let note = fs.do_lookup(ROOT_INO, OsStr::new("note")).unwrap();
        assert_eq!(fs.do_readlink(note.ino).unwrap(), b"README.md".to_vec());

        disconnect(&state);
        assert_eq!(fs.do_readlink(note.ino).unwrap(), b"README.md".to_vec());
    }

    #[test]
    fn test_readlink_uncached_offline_fails() {
        let (fs, state, _dir) = fixture();
        let note = fs.do_lookup(ROOT_INO, OsStr::new("note")).unwrap();
        disconnect(&state);
        // the target was never fetched while connected
        let err = fs.do_readlink(note.ino).unwrap_err();
        assert_eq!(err.errno(), libc::EIO);

        let rec = fs.cache.begin_ro().unwrap().getattr(note.ino).unwrap();
        assert_eq!(rec.kind, Kind::Link);
    }

    #[test]
    fn test_open_read_release() {
        let (fs, state, _dir) = fixture();
        let rec = fs.do_lookup(ROOT_INO, OsStr::new("README.md")).unwrap();

        let fh = fs.do_open(rec.ino).unwrap();
        assert_eq!(fs.do_read(fh, 0, 5).unwrap(), b"hello");
        assert_eq!(fs.do_read(fh, 6, 64).unwrap(), b"world");
        fs.do_release(fh);
        assert_eq!(fs.do_read(fh, 0, 1).unwrap_err().errno(), libc::EIO);

        let books = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();
        assert_eq!(fs.do_open(books.ino).unwrap_err().errno(), libc::EISDIR);

        disconnect(&state);
        assert_eq!(fs.do_open(rec.ino).unwrap_err().errno(), libc::EIO);
    }

    #[test]
    fn test_nested_lookup_builds_backend_paths() {
        let (fs, state, _dir) = fixture();
        let books = fs.do_lookup(ROOT_INO, OsStr::new("books")).unwrap();
        let b1 = fs.do_lookup(books.ino, OsStr::new("b1.txt")).unwrap();
        assert_eq!(b1.mode & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(b1.parent, books.ino);

        disconnect(&state);
        let again = fs.do_lookup(books.ino, OsStr::new("b1.txt")).unwrap();
        assert_eq!(again.ino, b1.ino);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let (fs, _state, _dir) = fixture();
        let err = fs.do_lookup(ROOT_INO, OsStr::new("..")).unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
    }
}

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use libc::c_int;
use log::{debug, warn};

use crate::backend::{BackendAdapter, DirIter};
use crate::cache::MetaCache;
use crate::errors::Error;
use crate::nodes::{validate_name, InodeRecord, Kind, NodeFlags, ROOT_INO};
use crate::store::RoTxn;

const TTL: Duration = Duration::from_secs(1);

/// Cursor issued for ".." when a directory is its own parent (the root):
/// there the parent ino equals "."'s cursor, so "just past `..`" needs a
/// value of its own. Allocated inode numbers stay far below this.
const PAST_DOTS: i64 = i64::MAX;

/// One directory entry as handed to the kernel. `offset` is the cursor a
/// later readdir passes back to resume strictly after this entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryOut {
    pub ino: u64,
    pub offset: i64,
    pub kind: FileType,
    pub name: OsString,
}

pub struct StashFs {
    cache: MetaCache,
    backend: BackendAdapter,
    next_fh: AtomicU64,
    open_files: Mutex<HashMap<u64, u64>>,
}

impl StashFs {
    pub fn new(cache: MetaCache, backend: BackendAdapter) -> StashFs {
        StashFs {
            cache,
            backend,
            next_fh: AtomicU64::new(1),
            open_files: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the backend-relative path of an inode by walking parent
    /// links. The root maps to the empty path.
    fn path_of(&self, txn: &RoTxn, ino: u64) -> Result<PathBuf, Error> {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut cur = ino;
        while cur != ROOT_INO {
            let rec = txn.getattr(cur)?;
            parts.push(txn.entry_name(rec.parent, cur)?);
            cur = rec.parent;
            if parts.len() > 4096 {
                return Err(Error::CorruptStore("parent chain does not terminate".to_string()));
            }
        }
        let mut path = PathBuf::new();
        for part in parts.iter().rev() {
            path.push(OsStr::from_bytes(part));
        }
        Ok(path)
    }

    pub fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<InodeRecord, Error> {
        let name = name.as_bytes();
        validate_name(name)?;

        if self.backend.connected() {
            let path = {
                let ro = self.cache.begin_ro()?;
                let parent_rec = ro.getattr(parent)?;
                if !parent_rec.is_dir() {
                    return Err(Error::NotADirectory);
                }
                let mut path = self.path_of(&ro, parent)?;
                path.push(OsStr::from_bytes(name));
                path
            };

            match self.backend.lstat(&path) {
                Ok(attrs) => {
                    let mut rw = self.cache.begin_rw()?;
                    let ino = rw.emplace(parent, name, &attrs)?;
                    let rec = rw.getattr(ino)?;
                    rw.commit()?;
                    return Ok(rec);
                }
                Err(Error::Backend(libc::ENOENT)) => {
                    // a stale binding may only be dropped where the parent
                    // listing is authoritative; otherwise "deleted" and
                    // "unreachable" are indistinguishable
                    let mut rw = self.cache.begin_rw()?;
                    if rw.test_flag(parent, NodeFlags::SYNCED)? {
                        rw.remove_entry(parent, name)?;
                        rw.commit()?;
                    }
                    return Err(Error::NotFound);
                }
                Err(Error::Backend(libc::EIO)) | Err(Error::Disconnected) => {}
                Err(e) => return Err(e),
            }
        }

        let ro = self.cache.begin_ro()?;
        match ro.lookup(parent, name) {
            Ok(ino) => ro.getattr(ino),
            Err(Error::NotFound) => Err(Error::Disconnected),
            Err(e) => Err(e),
        }
    }

    pub fn do_getattr(&self, ino: u64) -> Result<InodeRecord, Error> {
        if self.backend.connected() {
            let path = {
                let ro = self.cache.begin_ro()?;
                ro.getattr(ino)?;
                self.path_of(&ro, ino)?
            };

            match self.backend.lstat(&path) {
                Ok(attrs) => {
                    let mut rw = self.cache.begin_rw()?;
                    match rw.set_attr(ino, &attrs) {
                        Ok(()) => {
                            let rec = rw.getattr(ino)?;
                            rw.commit()?;
                            return Ok(rec);
                        }
                        Err(Error::KindMismatch) => {
                            // the path now names an object of another type:
                            // rebind under the parent, retire this number
                            if ino == ROOT_INO {
                                return Err(Error::Backend(libc::EIO));
                            }
                            let rec = rw.getattr(ino)?;
                            let name = rw.entry_name(rec.parent, ino)?;
                            rw.emplace(rec.parent, &name, &attrs)?;
                            rw.commit()?;
                            return Err(Error::NotFound);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::Backend(libc::ENOENT)) => return Err(Error::NotFound),
                Err(Error::Backend(libc::EIO)) | Err(Error::Disconnected) => {}
                Err(e) => return Err(e),
            }
        }

        let ro = self.cache.begin_ro()?;
        ro.getattr(ino)
    }

    pub fn do_readlink(&self, ino: u64) -> Result<Vec<u8>, Error> {
        let path = {
            let ro = self.cache.begin_ro()?;
            let rec = ro.getattr(ino)?;
            if rec.kind != Kind::Link {
                return Err(Error::NotALink);
            }
            if !rec.link_target.is_empty() {
                return Ok(rec.link_target);
            }
            self.path_of(&ro, ino)?
        };

        match self.backend.readlink(&path) {
            Ok(target) => {
                let mut rw = self.cache.begin_rw()?;
                rw.set_link(ino, &target)?;
                rw.commit()?;
                Ok(target)
            }
            Err(Error::Backend(libc::EIO)) | Err(Error::Disconnected) => {
                Err(Error::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    /// Grant a directory handle. While connected this is the sync point:
    /// the backend listing is streamed into the cache and, if it arrives
    /// complete, the entry set is reconciled and the directory marked
    /// SYNCED. Disconnected opendir still succeeds; only readdir is gated.
    pub fn do_opendir(&self, ino: u64) -> Result<u64, Error> {
        let path = {
            let ro = self.cache.begin_ro()?;
            let rec = ro.getattr(ino)?;
            if !rec.is_dir() {
                return Err(Error::NotADirectory);
            }
            self.path_of(&ro, ino)?
        };

        if self.backend.connected() {
            match self.backend.readdir(&path) {
                Ok(listing) => self.refresh_listing(ino, listing)?,
                Err(Error::Backend(libc::EIO)) | Err(Error::Disconnected) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(self.next_fh.fetch_add(1, Ordering::Relaxed))
    }

    /// Apply a backend listing to the cache. Upserts happen for every
    /// yielded entry; reconciliation and the SYNCED mark only when the
    /// listing ran to completion.
    fn refresh_listing(&self, ino: u64, listing: DirIter<'_>) -> Result<(), Error> {
        let mut observed = Vec::new();
        let mut complete = true;
        for item in listing {
            match item {
                Ok(entry) => observed.push(entry),
                Err(errno) => {
                    warn!("listing of inode {} broke off: errno {}", ino, errno);
                    complete = false;
                    break;
                }
            }
        }

        let mut rw = self.cache.begin_rw()?;
        let mut names: HashSet<Vec<u8>> = HashSet::with_capacity(observed.len());
        for (name, attrs) in &observed {
            if validate_name(name).is_err() {
                warn!("skipping uncacheable entry name {:?} in inode {}", name, ino);
                continue;
            }
            rw.emplace(ino, name, attrs)?;
            names.insert(name.clone());
        }
        if complete {
            rw.retain_entries(ino, &names)?;
        }
        rw.set_flag(ino, NodeFlags::SYNCED, complete)?;
        rw.commit()?;
        Ok(())
    }

    /// Serve directory entries after `offset`. Cursors are inode-valued:
    /// `.` carries the directory's own ino, `..` the parent's, and a real
    /// entry its child ino; iteration is ordered by child ino. An offset
    /// equal to the parent's ino means "just past `..`" — except for the
    /// root, which is its own parent, so its `..` hands out the reserved
    /// `PAST_DOTS` cursor and resuming after `.` still yields `..`.
    pub fn do_readdir(&self, ino: u64, offset: i64) -> Result<Vec<DirEntryOut>, Error> {
        let ro = self.cache.begin_ro()?;
        let rec = ro.getattr(ino)?;
        if !rec.is_dir() {
            return Err(Error::NotADirectory);
        }

        let past_dots = if ino == rec.parent {
            PAST_DOTS
        } else {
            rec.parent as i64
        };

        let offset = offset.max(0);
        let mut out = Vec::new();

        if offset == 0 {
            out.push(DirEntryOut {
                ino,
                offset: ino as i64,
                kind: FileType::Directory,
                name: OsString::from("."),
            });
        }
        if offset == 0 || offset == ino as i64 {
            out.push(DirEntryOut {
                ino: rec.parent,
                offset: past_dots,
                kind: FileType::Directory,
                name: OsString::from(".."),
            });
        }

        if !rec.synced() && !self.backend.connected() {
            // without a complete listing the cache cannot answer past the
            // synthetic entries
            if out.is_empty() {
                return Err(Error::Disconnected);
            }
            return Ok(out);
        }

        let after = if offset == 0 || offset == ino as i64 || offset == past_dots {
            0
        } else {
            offset as u64
        };
        for (name, child) in ro.readdir(ino, after)? {
            match ro.getattr(child) {
                Ok(child_rec) => out.push(DirEntryOut {
                    ino: child,
                    offset: child as i64,
                    kind: child_rec.kind.into(),
                    name: OsString::from_vec(name),
                }),
                Err(e) => {
                    warn!("entry {:?} of inode {} has no record: {}", name, ino, e);
                }
            }
        }
        Ok(out)
    }

    /// Content is not cached at this layer, so an open handle always
    /// fronts a backend handle.
    pub fn do_open(&self, ino: u64) -> Result<u64, Error> {
        let path = {
            let ro = self.cache.begin_ro()?;
            let rec = ro.getattr(ino)?;
            if rec.is_dir() {
                return Err(Error::IsADirectory);
            }
            self.path_of(&ro, ino)?
        };

        let handle = self.backend.open(&path)?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().unwrap().insert(fh, handle);
        Ok(fh)
    }

    pub fn do_read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, Error> {
        let handle = *self
            .open_files
            .lock()
            .unwrap()
            .get(&fh)
            .ok_or(Error::Backend(libc::EIO))?;
        self.backend.pread(handle, offset.max(0) as u64, size)
    }

    pub fn do_release(&self, fh: u64) {
        if let Some(handle) = self.open_files.lock().unwrap().remove(&fh) {
            if let Err(e) = self.backend.release(handle) {
                debug!("backend release of handle {} failed: {}", handle, e);
            }
        }
    }
}

impl Filesystem for StashFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup parent={} name={:?}", parent, name);
        match self.do_lookup(parent, name) {
            Ok(rec) => reply.entry(&TTL, &FileAttr::from(&rec), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        match self.do_getattr(ino) {
            Ok(rec) => reply.attr(&TTL, &FileAttr::from(&rec)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink ino={}", ino);
        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("open ino={}", ino);
        match self.do_open(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} fh={} offset={} size={}", ino, fh, offset, size);
        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.do_release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir ino={}", ino);
        match self.do_opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino={} fh={} offset={}", ino, fh, offset);
        match self.do_readdir(ino, offset) {
            Ok(entries) => {
                for entry in entries {
                    if reply.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }
}
