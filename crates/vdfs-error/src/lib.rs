#![forbid(unsafe_code)]
//! Error types for VDFS.
//!
//! # Error Taxonomy
//!
//! VDFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `vdfs-types` | Record-level violations detected while decoding bytes |
//! | Runtime | `VdfsError` | `vdfs-error` (this crate) | User-facing errors for the engine API and the CLI |
//!
//! ## Mapping Policy: ParseError → VdfsError
//!
//! `vdfs-error` does not depend on `vdfs-types`. The conversion lives in
//! `vdfs-ondisk` (`parse_to_vdfs_error`), which depends on both crates.
//!
//! | ParseError Variant | VdfsError Variant |
//! |--------------------|-------------------|
//! | `InsufficientData` | `Corruption { offset, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Format(detail)` |
//! | `IntegerConversion` | `Corruption { offset, detail }` |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`VdfsError::to_errno`].
//! The mapping has no wildcard arm.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `PermissionDenied` | `EACCES` |
//! | `NotMounted` | `ENODEV` |
//! | `NoActiveSession` | `EPERM` |
//! | `ReadOnly` | `EROFS` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |

use thiserror::Error;

/// Unified error type for all VDFS operations.
#[derive(Debug, Error)]
pub enum VdfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record read from a live image holds impossible values.
    ///
    /// `offset` is the absolute byte offset of the record in the image.
    #[error("corrupt metadata at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// The image is not laid out as expected (bad magic, bad geometry,
    /// out-of-bounds access).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without location context.
    #[error("parse error: {0}")]
    Parse(String),

    /// A caller-supplied argument is malformed or not allowed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free inode, block, partition slot or disk bytes.
    #[error("insufficient space")]
    NoSpace,

    /// Disk, partition, path, user or group not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// The session user lacks the permission for the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No partition is mounted under this id.
    #[error("not mounted: {0}")]
    NotMounted(String),

    /// The operation needs a logged-in user.
    #[error("no active session")]
    NoActiveSession,

    /// The image was opened read-only and a write was attempted.
    #[error("read-only image")]
    ReadOnly,

    /// A path component is not a directory.
    #[error("not a directory: {0}")]
    NotDirectory(String),

    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsDirectory(String),
}

impl VdfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::NotMounted(_) => libc::ENODEV,
            Self::NoActiveSession => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::IsDirectory(_) => libc::EISDIR,
        }
    }

    /// Short machine-friendly name of the variant, used in CLI JSON output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Corruption { .. } => "corruption",
            Self::Format(_) => "invalid_format",
            Self::Parse(_) => "parse",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NoSpace => "insufficient_space",
            Self::NotFound(_) => "not_found",
            Self::Exists(_) => "already_exists",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotMounted(_) => "not_mounted",
            Self::NoActiveSession => "no_active_session",
            Self::ReadOnly => "read_only",
            Self::NotDirectory(_) => "not_directory",
            Self::IsDirectory(_) => "is_directory",
        }
    }
}

/// Result alias using `VdfsError`.
pub type Result<T> = std::result::Result<T, VdfsError>;
