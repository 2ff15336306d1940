//! # EMBER Error Handling
//!
//! Error types for the dispatch core.
//!
//! Error handling in EMBER follows these principles:
//! - Errors are typed and categorized by subsystem
//! - Argument errors are reported synchronously at the call site
//! - Device errors surface only when the host waits on the device
//! - Errors are `no_std` compatible and `Copy`

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// EMBER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// EMBER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Argument Errors
    // =========================================================================
    /// Invalid argument provided
    InvalidArgument,
    /// A required pointer argument was null
    InvalidNullPointer,
    /// A required handle argument was null or stale
    InvalidNullHandle,
    /// Operation not supported on this engine or family
    NotSupported,
    /// Resource not found
    NotFound,

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    /// Object is in the wrong lifecycle state for this operation
    InvalidState,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of device memory
    OutOfDeviceMemory,
    /// Out of host memory
    OutOfHostMemory,
    /// Pointer is not backed by any device allocation
    UnresolvedAllocation,
    /// Address outside of the accessed allocation
    InvalidGpuAddress,
    /// Address not aligned
    MisalignedAddress,

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Command buffer full
    CommandBufferFull,
    /// Malformed command in a stream
    InvalidCommand,
    /// Submission boundary rejected the batch
    SubmissionFailed,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Device was lost (hang, reset or removal)
    DeviceLost,
    /// Wait did not complete within the timeout
    Timeout,
}

impl Error {
    /// Whether the error was caused by the caller's arguments
    pub const fn is_argument_error(self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::InvalidNullPointer
                | Self::InvalidNullHandle
                | Self::NotSupported
        )
    }

    /// Whether the device is unusable after this error
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Argument
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidNullPointer => write!(f, "null pointer argument"),
            Self::InvalidNullHandle => write!(f, "null or stale handle"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NotFound => write!(f, "resource not found"),

            // State
            Self::InvalidState => write!(f, "object in invalid state for operation"),

            // Memory
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::UnresolvedAllocation => write!(f, "pointer not backed by a device allocation"),
            Self::InvalidGpuAddress => write!(f, "invalid GPU address"),
            Self::MisalignedAddress => write!(f, "misaligned address"),

            // Command
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::SubmissionFailed => write!(f, "submission failed"),

            // Device
            Self::DeviceLost => write!(f, "device lost"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}
