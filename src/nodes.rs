//
// Inode records, flags and the on-disk field codec.
//


use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use fuser::{FileAttr, FileType};

use crate::errors::{Error, Result};

/// The root directory. Always present, always a directory, its own parent.
pub const ROOT_INO: u64 = 1;

/// Reserved sentinel, never allocated.
pub const INVALID_INO: u64 = 0;

pub const MAX_NAME_LEN: usize = 255;

pub const BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Regular = 1,
    Directory = 2,
    Link = 3,
}

impl Kind {
    pub fn from_tag(tag: u8) -> Option<Kind> {
        match tag {
            1 => Some(Kind::Regular),
            2 => Some(Kind::Directory),
            3 => Some(Kind::Link),
            _ => None,
        }
    }

    /// Extract the kind from the S_IFMT bits of a mode, for the file
    /// types the overlay projects.
    pub fn from_mode(mode: u32) -> Option<Kind> {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Some(Kind::Regular),
            libc::S_IFDIR => Some(Kind::Directory),
            libc::S_IFLNK => Some(Kind::Link),
            _ => None,
        }
    }
}

impl From<Kind> for FileType {
    fn from(kind: Kind) -> FileType {
        match kind {
            Kind::Regular => FileType::RegularFile,
            Kind::Directory => FileType::Directory,
            Kind::Link => FileType::Symlink,
        }
    }
}

bitflags! {
    /// Per-inode flag bits, packed into the record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// On a directory: the cached entry set equals the backend's
        /// listing as of the last complete readdir.
        const SYNCED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn now() -> Timespec {
        Timespec::from(SystemTime::now())
    }
}

impl From<SystemTime> for Timespec {
    fn from(time: SystemTime) -> Timespec {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Timespec {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(before) => Timespec {
                sec: -(before.duration().as_secs() as i64),
                nsec: before.duration().subsec_nanos(),
            },
        }
    }
}

impl From<Timespec> for SystemTime {
    fn from(ts: Timespec) -> SystemTime {
        if ts.sec >= 0 {
            UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec)
        } else {
            UNIX_EPOCH - Duration::new((-ts.sec) as u64, ts.nsec)
        }
    }
}

/// Attributes as observed on the backend, used to create or refresh a
/// cached inode. Identity (ino, parent) and flags stay with the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub kind: Kind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl NodeAttrs {
    /// A fresh directory owned by the current process, used for the root.
    pub fn new_root_dir() -> NodeAttrs {
        let now = Timespec::now();
        NodeAttrs {
            kind: Kind::Directory,
            mode: libc::S_IFDIR | 0o755,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub ino: u64,
    pub parent: u64,
    pub kind: Kind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub flags: NodeFlags,
    /// Cached symlink target, empty unless kind == Link.
    pub link_target: Vec<u8>,
}

impl InodeRecord {
    pub fn new(ino: u64, parent: u64, attrs: &NodeAttrs) -> InodeRecord {
        InodeRecord {
            ino,
            parent,
            kind: attrs.kind,
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            size: attrs.size,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            flags: NodeFlags::empty(),
            link_target: Vec::new(),
        }
    }

    /// Refresh the fields a backend stat provides. The caller has already
    /// checked that the kind matches.
    pub fn apply(&mut self, attrs: &NodeAttrs) {
        self.mode = attrs.mode;
        self.uid = attrs.uid;
        self.gid = attrs.gid;
        self.size = attrs.size;
        self.atime = attrs.atime;
        self.mtime = attrs.mtime;
        self.ctime = attrs.ctime;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(81 + self.link_target.len());
        data.extend_from_slice(&self.ino.to_le_bytes());
        data.extend_from_slice(&self.parent.to_le_bytes());
        data.push(self.kind as u8);
        data.extend_from_slice(&self.mode.to_le_bytes());
        data.extend_from_slice(&self.uid.to_le_bytes());
        data.extend_from_slice(&self.gid.to_le_bytes());
        data.extend_from_slice(&self.size.to_le_bytes());
        for ts in [&self.atime, &self.mtime, &self.ctime] {
            data.extend_from_slice(&ts.sec.to_le_bytes());
            data.extend_from_slice(&ts.nsec.to_le_bytes());
        }
        data.extend_from_slice(&self.flags.bits().to_le_bytes());
        data.extend_from_slice(&(self.link_target.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.link_target);
        data
    }

    pub fn decode(mut data: &[u8]) -> Result<InodeRecord> {
        let ino = take_u64(&mut data)?;
        let parent = take_u64(&mut data)?;
        let tag = take(&mut data, 1)?[0];
        let kind = Kind::from_tag(tag)
            .ok_or_else(|| Error::CorruptStore(format!("unknown inode kind tag {}", tag)))?;
        let mode = take_u32(&mut data)?;
        let uid = take_u32(&mut data)?;
        let gid = take_u32(&mut data)?;
        let size = take_u64(&mut data)?;
        let mut times = [Timespec { sec: 0, nsec: 0 }; 3];
        for ts in times.iter_mut() {
            ts.sec = take_u64(&mut data)? as i64;
            ts.nsec = take_u32(&mut data)?;
        }
        let flags = NodeFlags::from_bits_retain(take_u32(&mut data)?);
        let target_len = take_u32(&mut data)? as usize;
        let link_target = take(&mut data, target_len)?.to_vec();

        Ok(InodeRecord {
            ino,
            parent,
            kind,
            mode,
            uid,
            gid,
            size,
            atime: times[0],
            mtime: times[1],
            ctime: times[2],
            flags,
            link_target,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == Kind::Directory
    }

    pub fn synced(&self) -> bool {
        self.flags.contains(NodeFlags::SYNCED)
    }
}

impl From<&InodeRecord> for FileAttr {
    fn from(rec: &InodeRecord) -> FileAttr {
        FileAttr {
            ino: rec.ino,
            size: rec.size,
            blocks: rec.size.div_ceil(BLOCK_SIZE as u64),
            atime: rec.atime.into(),
            mtime: rec.mtime.into(),
            ctime: rec.ctime.into(),
            crtime: rec.ctime.into(),
            kind: rec.kind.into(),
            perm: (rec.mode & 0o7777) as u16,
            nlink: if rec.is_dir() { 2 } else { 1 },
            uid: rec.uid,
            gid: rec.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Entry names are non-empty, at most 255 bytes, free of '/' and NUL,
/// and never "." or "..".
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName);
    }
    if name == b"." || name == b".." {
        return Err(Error::InvalidName);
    }
    if name.iter().any(|b| *b == b'/' || *b == 0) {
        return Err(Error::InvalidName);
    }
    Ok(())
}

fn take<'a>(data: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if data.len() < len {
        return Err(Error::CorruptStore("truncated inode record".to_string()));
    }
    let (head, tail) = data.split_at(len);
    *data = tail;
    Ok(head)
}

fn take_u32(data: &mut &[u8]) -> Result<u32> {
    let b = take(data, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn take_u64(data: &mut &[u8]) -> Result<u64> {
    let b = take(data, 8)?;
    Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}
