//
// Internal error taxonomy, mapped to errno values at the kernel boundary.
//

use libc::c_int;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No such inode or directory entry in the cache.
    #[error("no such inode or entry")]
    NotFound,

    /// The backend is unreachable and the cache cannot answer.
    #[error("backend disconnected and cache insufficient")]
    Disconnected,

    /// The persistent store failed underneath us.
    #[error("store I/O error: {0}")]
    StoreIo(String),

    /// The store contents violate structural invariants. Fatal at mount
    /// time; a request that somehow trips over it gets EIO.
    #[error("corrupt store: {0}")]
    CorruptStore(String),

    /// A refresh observed a type change for an existing entry. Handled
    /// internally by re-allocating the inode, never surfaced.
    #[error("inode kind changed on refresh")]
    KindMismatch,

    /// The backend answered with a specific errno.
    #[error("backend errno {0}")]
    Backend(c_int),

    #[error("invalid entry name")]
    InvalidName,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("not a symlink")]
    NotALink,
}

impl Error {
    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::Disconnected => libc::EIO,
            Error::StoreIo(_) => libc::EIO,
            Error::CorruptStore(_) => libc::EIO,
            Error::KindMismatch => libc::EIO,
            Error::Backend(errno) => *errno,
            Error::InvalidName => libc::EINVAL,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::NotALink => libc::EINVAL,
        }
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StoreIo(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StoreIo(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StoreIo(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StoreIo(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StoreIo(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StoreIo(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::StoreIo(value.to_string())
    }
}
