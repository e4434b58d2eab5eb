// FPGA msgDMA Rust Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for DMA operations.

use thiserror::Error;

/// Errors that can occur during DMA operations.
#[derive(Debug, Error)]
pub enum DmaError {
    /// Malformed argument, or an attribute that does not fit the channel type.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The register region or a required feature could not be mapped.
    #[error("no driver: {0}")]
    NoDriver(String),

    /// Buffer pool, small-buffer quota or pinning exhausted.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Resource already in use, queue full, or drain refused.
    #[error("busy: {0}")]
    Busy(String),

    /// A bounded wait expired.
    #[error("timed out after {timeout_ms} ms waiting for {what}")]
    Timeout { what: &'static str, timeout_ms: u64 },

    /// Channel index out of range.
    #[error("channel {index} not found ({available} channels available)")]
    ChannelNotFound { index: usize, available: usize },

    /// Requested transfer type is reserved or not implemented.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The transfer was queued when its channel or engine was closed.
    #[error("transfer cancelled")]
    Cancelled,

    /// Hardware stopped the dispatcher (error or early termination).
    #[error("hardware stopped: status={status:#06x}, transferred {bytes_transferred} bytes")]
    HardwareStopped { status: u32, bytes_transferred: u64 },

    /// The transfer failed for a reason reported by the completion engine.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Platform not supported.
    #[error("platform not supported: msgdma access requires Linux with UIO")]
    PlatformNotSupported,
}

/// Coarse error classification shared by every operation of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParam,
    NoDriver,
    NoMemory,
    Busy,
    Timeout,
    NotFound,
    NotSupported,
    Exception,
}

impl DmaError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParam(_) => ErrorKind::InvalidParam,
            Self::NoDriver(_) | Self::MmapFailed(_) | Self::PlatformNotSupported => {
                ErrorKind::NoDriver
            }
            Self::NoMemory(_) => ErrorKind::NoMemory,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ChannelNotFound { .. } => ErrorKind::NotFound,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::Cancelled
            | Self::HardwareStopped { .. }
            | Self::TransferFailed(_)
            | Self::Io(_) => ErrorKind::Exception,
        }
    }

    pub(crate) fn timeout(what: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            what,
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Result type alias for DMA operations.
pub type DmaResult<T> = Result<T, DmaError>;
