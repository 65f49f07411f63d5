//! Error classes for the storage core.
//!
//! Mirrors the small error enum called for by the design notes: genuine
//! invariant violations (cache eviction finding no victim, disk I/O failure)
//! still panic: everything else is a `Result`.

/// An error returned by a storage-core operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Kernel heap allocation failed.
    OutOfMemory,
    /// The free-map has no sectors left to satisfy the request.
    DiskFull,
    /// No entry with that name/sector exists.
    NotFound,
    /// Writes are currently denied on this inode (`deny_write_count > 0`).
    Denied,
    /// A supplied argument was invalid (empty path, `.`/`..` as a create
    /// target, non-page-aligned offset, and so on).
    InvalidArgument,
    /// Expected a directory, found a regular file.
    NotDirectory,
    /// Expected a regular file, found a directory.
    IsDirectory,
    /// A path component exceeded the maximum name length.
    NameTooLong,
    /// An entry with this name already exists.
    AlreadyExists,
    /// A directory being removed still has entries besides `.`/`..`.
    NotEmpty,
    /// Underlying block device I/O failed.
    IoError,
}

impl From<keos::KernelError> for StorageError {
    fn from(e: keos::KernelError) -> Self {
        match e {
            keos::KernelError::NoMemory => StorageError::OutOfMemory,
            keos::KernelError::NoSpace => StorageError::DiskFull,
            keos::KernelError::NoSuchEntry => StorageError::NotFound,
            keos::KernelError::InvalidAccess => StorageError::Denied,
            keos::KernelError::InvalidArgument => StorageError::InvalidArgument,
            keos::KernelError::NotDirectory => StorageError::NotDirectory,
            keos::KernelError::IsDirectory => StorageError::IsDirectory,
            keos::KernelError::NameTooLong => StorageError::NameTooLong,
            keos::KernelError::FileExist => StorageError::AlreadyExists,
            keos::KernelError::DirectoryNotEmpty => StorageError::NotEmpty,
            _ => StorageError::IoError,
        }
    }
}

impl From<StorageError> for keos::KernelError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::OutOfMemory => keos::KernelError::NoMemory,
            StorageError::DiskFull => keos::KernelError::NoSpace,
            StorageError::NotFound => keos::KernelError::NoSuchEntry,
            StorageError::Denied => keos::KernelError::InvalidAccess,
            StorageError::InvalidArgument => keos::KernelError::InvalidArgument,
            StorageError::NotDirectory => keos::KernelError::NotDirectory,
            StorageError::IsDirectory => keos::KernelError::IsDirectory,
            StorageError::NameTooLong => keos::KernelError::NameTooLong,
            StorageError::AlreadyExists => keos::KernelError::FileExist,
            StorageError::NotEmpty => keos::KernelError::DirectoryNotEmpty,
            StorageError::IoError => keos::KernelError::IOError,
        }
    }
}

pub type Result<T> = core::result::Result<T, StorageError>;
