//! Error Handling (§7): the non-panicking half of the VM engine's error
//! classes. Swap exhaustion and "no victim found" stay kernel panics, per
//! the explicit instruction to reserve panic for genuine invariant
//! violations; this enum covers the rest (mmap precondition failures, bad
//! arguments, denied access).

/// Non-panicking virtual-memory failure.
#[derive(Debug, Eq, PartialEq)]
pub enum VmError {
    /// Physical or heap allocation failed.
    OutOfMemory,
    /// An mmap/munmap precondition was not met.
    InvalidArgument,
    /// The range is already covered by an SPT entry.
    AlreadyMapped,
    /// The mapping id or address does not name a live mapping.
    NotMapped,
    /// The underlying file denied the operation.
    Denied,
    /// The backing file or swap device faulted.
    IoError,
}

/// Result type for fallible VM operations.
pub type Result<T> = core::result::Result<T, VmError>;

impl From<storage::StorageError> for VmError {
    fn from(e: storage::StorageError) -> Self {
        match e {
            storage::StorageError::OutOfMemory => VmError::OutOfMemory,
            storage::StorageError::InvalidArgument => VmError::InvalidArgument,
            storage::StorageError::Denied => VmError::Denied,
            storage::StorageError::NotFound => VmError::NotMapped,
            _ => VmError::IoError,
        }
    }
}

impl From<VmError> for keos::KernelError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => keos::KernelError::NoMemory,
            VmError::InvalidArgument => keos::KernelError::InvalidArgument,
            VmError::AlreadyMapped => keos::KernelError::FileExist,
            VmError::NotMapped => keos::KernelError::NoSuchEntry,
            VmError::Denied => keos::KernelError::InvalidAccess,
            VmError::IoError => keos::KernelError::IOError,
        }
    }
}
