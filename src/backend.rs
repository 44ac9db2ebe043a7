//
// Backend driver interface, the connectivity-gating adapter, and a
// local-directory driver.
//


use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use libc::c_int;
use log::debug;

use crate::errors::{Error, Result};
use crate::nodes::{Kind, NodeAttrs, Timespec};

pub type Errno = c_int;
pub type BackendResult<T> = std::result::Result<T, Errno>;

/// Streamed directory listing. An `Err` item means the listing broke off
/// partway: entries already yielded are valid, but the listing as a whole
/// is not authoritative.
pub type DirIter<'a> = Box<dyn Iterator<Item = BackendResult<(Vec<u8>, NodeAttrs)>> + 'a>;

/// The source filesystem being projected. Paths are relative to the
/// backend root. Implementations are internally thread-safe.
pub trait Backend: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Stat without following a terminal symlink.
    fn lstat(&self, path: &Path) -> BackendResult<NodeAttrs>;

    fn readdir(&self, path: &Path) -> BackendResult<DirIter<'_>>;

    fn readlink(&self, path: &Path) -> BackendResult<Vec<u8>>;

    fn open(&self, path: &Path) -> BackendResult<u64>;

    fn pread(&self, handle: u64, offset: u64, len: u32) -> BackendResult<Vec<u8>>;

    fn release(&self, handle: u64) -> BackendResult<()>;
}

/// Connectivity-aware wrapper around the driver. While disconnected every
/// operation fails locally, without touching the driver, so requests never
/// hang on a dead transport.
pub struct BackendAdapter {
    driver: Box<dyn Backend>,
}

impl BackendAdapter {
    pub fn new(driver: Box<dyn Backend>) -> BackendAdapter {
        BackendAdapter { driver }
    }

    pub fn connected(&self) -> bool {
        self.driver.is_connected()
    }

    fn gate(&self) -> Result<()> {
        if self.connected() {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    pub fn lstat(&self, path: &Path) -> Result<NodeAttrs> {
        self.gate()?;
        self.driver.lstat(path).map_err(Error::Backend)
    }

    pub fn readdir(&self, path: &Path) -> Result<DirIter<'_>> {
        self.gate()?;
        self.driver.readdir(path).map_err(Error::Backend)
    }

    pub fn readlink(&self, path: &Path) -> Result<Vec<u8>> {
        self.gate()?;
        self.driver.readlink(path).map_err(Error::Backend)
    }

    pub fn open(&self, path: &Path) -> Result<u64> {
        self.gate()?;
        self.driver.open(path).map_err(Error::Backend)
    }

    pub fn pread(&self, handle: u64, offset: u64, len: u32) -> Result<Vec<u8>> {
        self.gate()?;
        self.driver.pread(handle, offset, len).map_err(Error::Backend)
    }

    pub fn release(&self, handle: u64) -> Result<()> {
        self.gate()?;
        self.driver.release(handle).map_err(Error::Backend)
    }
}

/// Driver serving a directory on the local machine. Connectivity is the
/// existence of the source directory, so an unmounted share or removed
/// medium flips the overlay into degraded mode.
pub struct LocalBackend {
    root: PathBuf,
    handles: Mutex<HashMap<u64, File>>,
    next_handle: AtomicU64,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> LocalBackend {
        LocalBackend {
            root,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl Backend for LocalBackend {
    fn is_connected(&self) -> bool {
        self.root.is_dir()
    }

    fn lstat(&self, path: &Path) -> BackendResult<NodeAttrs> {
        let md = fs::symlink_metadata(self.resolve(path)).map_err(io_errno)?;
        attrs_from_metadata(&md).ok_or(libc::ENOTSUP)
    }

    fn readdir(&self, path: &Path) -> BackendResult<DirIter<'_>> {
        let rd = fs::read_dir(self.resolve(path)).map_err(io_errno)?;
        let iter = rd.filter_map(|entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(io_errno(e))),
            };
            let name = entry.file_name().into_vec();
            match fs::symlink_metadata(entry.path()) {
                // raced away between listing and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => Some(Err(io_errno(e))),
                // file kinds the overlay does not project are skipped
                Ok(md) => attrs_from_metadata(&md).map(|attrs| Ok((name, attrs))),
            }
        });
        Ok(Box::new(iter))
    }

    fn readlink(&self, path: &Path) -> BackendResult<Vec<u8>> {
        let target = fs::read_link(self.resolve(path)).map_err(io_errno)?;
        Ok(target.into_os_string().into_vec())
    }

    fn open(&self, path: &Path) -> BackendResult<u64> {
        let file = File::open(self.resolve(path)).map_err(io_errno)?;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(handle, file);
        debug!("backend open {:?} -> handle {}", path, handle);
        Ok(handle)
    }

    fn pread(&self, handle: u64, offset: u64, len: u32) -> BackendResult<Vec<u8>> {
        let handles = self.handles.lock().unwrap();
        let file = handles.get(&handle).ok_or(libc::EBADF)?;
        let mut buf = vec![0u8; len as usize];
        let mut read = 0;
        while read < buf.len() {
            let n = file.read_at(&mut buf[read..], offset + read as u64).map_err(io_errno)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        Ok(buf)
    }

    fn release(&self, handle: u64) -> BackendResult<()> {
        self.handles.lock().unwrap().remove(&handle);
        Ok(())
    }
}

fn io_errno(e: std::io::Error) -> Errno {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn attrs_from_metadata(md: &fs::Metadata) -> Option<NodeAttrs> {
    let mode = md.mode();
    let kind = Kind::from_mode(mode)?;
    Some(NodeAttrs {
        kind,
        mode,
        uid: md.uid(),
        gid: md.gid(),
        size: md.size(),
        atime: Timespec {
            sec: md.atime(),
            nsec: md.atime_nsec() as u32,
        },
        mtime: Timespec {
            sec: md.mtime(),
            nsec: md.mtime_nsec() as u32,
        },
        ctime: Timespec {
            sec: md.ctime(),
            nsec: md.ctime_nsec() as u32,
        },
    })
}
