//! The error taxonomy shared by every layer of the crate.
//!
//! Each lower-level module (`allocator`, `vmm::client`, `agent`, ...) defines
//! its own narrow `thiserror` enum for the failures it can actually produce,
//! then converts into [`BandsoxError`] at the module boundary so callers only
//! ever see one type, the way the teacher crate funnels `VmmProcessError` and
//! `VmApiError` into `VmError`.

use std::path::PathBuf;

use crate::allocator::AllocatorError;
use crate::metadata::MetadataError;
use crate::vmm::client::VmmClientError;

/// The stable classification of an error, independent of the message. Used
/// to decide retry policy and to map to the host CLI exit codes of spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    StateConflict,
    AllocatorExhausted,
    BootFailed,
    VmmError,
    AgentDisconnected,
    Timeout,
    ChecksumMismatch,
    IoError,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum BandsoxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no VM or snapshot found with id {0:?}")]
    NotFound(String),

    #[error("operation not permitted in the current state: {0}")]
    StateConflict(String),

    #[error("allocator exhausted: {0}")]
    AllocatorExhausted(#[from] AllocatorError),

    #[error("VM boot failed: {reason}")]
    BootFailed { reason: String },

    #[error("VMM rejected the request: {0}")]
    VmmError(#[from] VmmClientError),

    #[error("no agent (vsock or serial) responded")]
    AgentDisconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("metadata store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl BandsoxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BandsoxError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BandsoxError::NotFound(_) => ErrorKind::NotFound,
            BandsoxError::StateConflict(_) => ErrorKind::StateConflict,
            BandsoxError::AllocatorExhausted(_) => ErrorKind::AllocatorExhausted,
            BandsoxError::BootFailed { .. } => ErrorKind::BootFailed,
            BandsoxError::VmmError(_) => ErrorKind::VmmError,
            BandsoxError::AgentDisconnected => ErrorKind::AgentDisconnected,
            BandsoxError::Timeout => ErrorKind::Timeout,
            BandsoxError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            BandsoxError::IoError(_) => ErrorKind::IoError,
            BandsoxError::Metadata(_) => ErrorKind::IoError,
            BandsoxError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The host CLI exit code this error maps to, per spec §6. The core does
    /// not parse CLI arguments itself (out of scope), but it owns this
    /// mapping since it owns the error taxonomy.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidArgument => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::StateConflict => 4,
            ErrorKind::BootFailed => 5,
            ErrorKind::AgentDisconnected | ErrorKind::Timeout => 6,
            ErrorKind::AllocatorExhausted => 7,
            ErrorKind::VmmError => 8,
            ErrorKind::ChecksumMismatch | ErrorKind::IoError | ErrorKind::Internal => 1,
        }
    }
}
