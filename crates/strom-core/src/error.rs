//! # STROM Error Handling
//!
//! One error type for the whole transfer stack.
//!
//! Every variant maps onto a negative errno through [`Error::errno`], which is
//! what the command layer hands back to its caller.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// STROM Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERRNO VALUES
// =============================================================================

/// Errno constants used by [`Error::errno`]
pub mod errno {
    /// No such entry
    pub const ENOENT: i32 = 2;
    /// Bad file descriptor
    pub const EBADF: i32 = 9;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Permission denied
    pub const EACCES: i32 = 13;
    /// Bad address
    pub const EFAULT: i32 = 14;
    /// Device or resource busy
    pub const EBUSY: i32 = 16;
    /// No such device
    pub const ENODEV: i32 = 19;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Operation not supported (kernel-internal value)
    pub const ENOTSUPP: i32 = 524;
}

// =============================================================================
// ERROR ENUM
// =============================================================================

/// STROM unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A user address could not be pinned or translated
    BadAddress,
    /// File descriptor is missing or does not refer to an open file
    BadDescriptor,
    /// Handle or task id is not registered
    NotFound,
    /// The file cannot take the direct storage path
    Unsupported(UnsupportedReason),
    /// Allocation failed
    OutOfMemory,
    /// Malformed request
    InvalidArgument,
    /// Opaque code surfaced by an external collaborator
    DriverError(i32),
    /// Live mappings or tasks still exist
    Busy,
    /// The process-wide instance has not been created
    NotInitialized,
}

impl Error {
    /// Negative errno for this error
    pub const fn errno(&self) -> i32 {
        match self {
            Self::BadAddress => -errno::EFAULT,
            Self::BadDescriptor => -errno::EBADF,
            Self::NotFound => -errno::ENOENT,
            Self::Unsupported(UnsupportedReason::NoReadPermission) => -errno::EACCES,
            Self::Unsupported(_) => -errno::ENOTSUPP,
            Self::OutOfMemory => -errno::ENOMEM,
            Self::InvalidArgument => -errno::EINVAL,
            Self::DriverError(code) => {
                if *code < 0 {
                    *code
                } else {
                    -*code
                }
            },
            Self::Busy => -errno::EBUSY,
            Self::NotInitialized => -errno::ENODEV,
        }
    }

    /// Whether the error came from an external collaborator
    pub const fn is_driver_error(&self) -> bool {
        matches!(self, Self::DriverError(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress => write!(f, "bad address"),
            Self::BadDescriptor => write!(f, "bad file descriptor"),
            Self::NotFound => write!(f, "no such handle or task"),
            Self::Unsupported(reason) => write!(f, "unsupported: {}", reason),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::DriverError(code) => write!(f, "driver error {}", code),
            Self::Busy => write!(f, "resource busy"),
            Self::NotInitialized => write!(f, "not initialized"),
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// First failing condition of the storage admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// File is not open for reading
    NoReadPermission,
    /// Filesystem is not one of the allowed implementations
    FilesystemNotSupported,
    /// File is smaller than one host page
    FileTooSmall(u64),
    /// Filesystem block size differs from the host page size
    BlockSizeMismatch(u64),
    /// Block device major is not the extended-devt major
    NotExtendedDevice(u32),
    /// Disk name does not look like an NVMe namespace
    DeviceNotNvme,
    /// Block device lacks the identify operation
    NoIdentifyOperation,
    /// Identify operation returned an error
    IdentifyFailed(i32),
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReadPermission => write!(f, "file is not readable"),
            Self::FilesystemNotSupported => write!(f, "filesystem is neither ext4 nor xfs"),
            Self::FileTooSmall(size) => write!(f, "file size too small ({} bytes)", size),
            Self::BlockSizeMismatch(bs) => {
                write!(f, "block size ({}) does not match host page size", bs)
            },
            Self::NotExtendedDevice(major) => {
                write!(f, "block device major {} is not an NVMe namespace", major)
            },
            Self::DeviceNotNvme => write!(f, "block device is not a plain NVMe namespace"),
            Self::NoIdentifyOperation => write!(f, "block device has no identify operation"),
            Self::IdentifyFailed(code) => write!(f, "identify failed ({})", code),
        }
    }
}

impl From<UnsupportedReason> for Error {
    fn from(reason: UnsupportedReason) -> Self {
        Error::Unsupported(reason)
    }
}

// =============================================================================
// TESTS
// =============================================================================
