//! # Result Codes
//!
//! The fixed set of codes the public surface reports. Internal errors are
//! richer; anything without a dedicated code is reported as
//! [`ResultCode::ErrorUnknown`].

use core::fmt;

use ember_core::Error;

/// Outcome of a public call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    /// The call succeeded
    Success = 0,
    /// The queried object has not completed yet
    NotReady = 1,
    /// The device hung or was removed
    ErrorDeviceLost = 0x7000_0001,
    /// A device allocation failed
    ErrorOutOfDeviceMemory = 0x7000_0003,
    /// An argument is invalid
    ErrorInvalidArgument = 0x7800_0004,
    /// A handle argument is null or does not name a live object
    ErrorInvalidNullHandle = 0x7800_0005,
    /// A pointer argument is null
    ErrorInvalidNullPointer = 0x7800_0007,
    /// Any other failure
    ErrorUnknown = 0x7fff_fffe,
}

static_assertions::assert_eq_size!(ResultCode, u32);

impl ResultCode {
    /// Code of a unit result
    pub fn from_result(result: ember_core::Result<()>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => e.into(),
        }
    }

    /// Whether the code reports success
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Raw value
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

impl From<Error> for ResultCode {
    fn from(error: Error) -> Self {
        match error {
            Error::InvalidArgument => Self::ErrorInvalidArgument,
            Error::InvalidNullPointer => Self::ErrorInvalidNullPointer,
            Error::InvalidNullHandle => Self::ErrorInvalidNullHandle,
            Error::OutOfDeviceMemory => Self::ErrorOutOfDeviceMemory,
            Error::DeviceLost => Self::ErrorDeviceLost,
            Error::Timeout => Self::NotReady,
            _ => Self::ErrorUnknown,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::NotReady => "not ready",
            Self::ErrorDeviceLost => "device lost",
            Self::ErrorOutOfDeviceMemory => "out of device memory",
            Self::ErrorInvalidArgument => "invalid argument",
            Self::ErrorInvalidNullHandle => "invalid null handle",
            Self::ErrorInvalidNullPointer => "invalid null pointer",
            Self::ErrorUnknown => "unknown error",
        };
        write!(f, "{} (0x{:08x})", name, self.raw())
    }
}

/// Result of a public call producing a value
pub type ApiResult<T> = core::result::Result<T, ResultCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_errors_keep_their_code() {
        assert_eq!(ResultCode::from(Error::InvalidArgument), ResultCode::ErrorInvalidArgument);
        assert_eq!(ResultCode::from(Error::InvalidNullPointer), ResultCode::ErrorInvalidNullPointer);
        assert_eq!(ResultCode::from(Error::InvalidNullHandle), ResultCode::ErrorInvalidNullHandle);
        assert_eq!(ResultCode::from(Error::OutOfDeviceMemory), ResultCode::ErrorOutOfDeviceMemory);
        assert_eq!(ResultCode::from(Error::DeviceLost), ResultCode::ErrorDeviceLost);
        assert_eq!(ResultCode::from(Error::Timeout), ResultCode::NotReady);
    }

    #[test]
    fn test_unmapped_errors_are_unknown() {
        for error in [
            Error::InvalidState,
            Error::NotSupported,
            Error::CommandBufferFull,
            Error::SubmissionFailed,
            Error::MisalignedAddress,
        ] {
            assert_eq!(ResultCode::from(error), ResultCode::ErrorUnknown);
        }
        assert_eq!(ResultCode::from_result(Ok(())), ResultCode::Success);
        assert!(!ResultCode::ErrorUnknown.is_success());
        assert_eq!(ResultCode::ErrorUnknown.raw(), 0x7fff_fffe);
    }
}
