//! Error types for the Level Zero backend
//!
//! Native statuses never leave this crate: every driver failure is wrapped in
//! [`Error::Driver`], and every error maps to exactly one portable
//! [`HipErrorCode`] through [`Error::code`].

use std::fmt;
use std::panic::Location;

use chip_ze::{DeviceHandle, ZeResult};
use tracing::warn;

use crate::config::ConfigError;
use crate::memory::MemoryKind;
use crate::result::lz_convert_result;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, Error>;

/// Portable runtime error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HipErrorCode {
    /// No error
    Success = 0,
    /// An argument is out of range
    InvalidValue = 1,
    /// Allocation failed
    OutOfMemory = 2,
    /// Runtime not initialized
    NotInitialized = 3,
    /// Launch geometry not valid for the device
    InvalidConfiguration = 9,
    /// Pointer not known to the runtime
    InvalidDevicePointer = 17,
    /// Kernel symbol not found
    InvalidDeviceFunction = 98,
    /// No device available
    NoDevice = 100,
    /// Device not valid for the operation
    InvalidDevice = 101,
    /// Module image is invalid
    InvalidImage = 200,
    /// Context invalid or destroyed
    InvalidContext = 201,
    /// Module has no code for the device
    NoBinaryForGpu = 209,
    /// Handle invalid or destroyed
    InvalidHandle = 400,
    /// Named entity not found
    NotFound = 500,
    /// Asynchronous work still pending
    NotReady = 600,
    /// Device faulted during execution
    LaunchFailure = 719,
    /// Feature not supported
    NotSupported = 801,
    /// Unknown failure
    Unknown = 999,
}

impl HipErrorCode {
    /// Portable name of the code
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "hipSuccess",
            Self::InvalidValue => "hipErrorInvalidValue",
            Self::OutOfMemory => "hipErrorOutOfMemory",
            Self::NotInitialized => "hipErrorNotInitialized",
            Self::InvalidConfiguration => "hipErrorInvalidConfiguration",
            Self::InvalidDevicePointer => "hipErrorInvalidDevicePointer",
            Self::InvalidDeviceFunction => "hipErrorInvalidDeviceFunction",
            Self::NoDevice => "hipErrorNoDevice",
            Self::InvalidDevice => "hipErrorInvalidDevice",
            Self::InvalidImage => "hipErrorInvalidImage",
            Self::InvalidContext => "hipErrorInvalidContext",
            Self::NoBinaryForGpu => "hipErrorNoBinaryForGpu",
            Self::InvalidHandle => "hipErrorInvalidHandle",
            Self::NotFound => "hipErrorNotFound",
            Self::NotReady => "hipErrorNotReady",
            Self::LaunchFailure => "hipErrorLaunchFailure",
            Self::NotSupported => "hipErrorNotSupported",
            Self::Unknown => "hipErrorUnknown",
        }
    }

    /// Numeric value
    #[inline]
    pub const fn raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for HipErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A native call failed
    #[error("{message}: {status} ({location})")]
    Driver {
        /// What was being attempted
        message: String,
        /// Native status
        status: ZeResult,
        /// Call site that observed the failure
        location: &'static Location<'static>,
    },

    /// Allocation failed or exceeds the device limit
    #[error("Out of memory: {size} bytes of {kind} memory requested")]
    OutOfMemory {
        /// Requested size
        size: usize,
        /// Requested memory kind
        kind: MemoryKind,
    },

    /// The device cannot serve this kind of allocation
    #[error("Device does not support {0} allocations")]
    UnsupportedMemoryKind(MemoryKind),

    /// The address was already released
    ///
    /// HIP has no double-free code, so [`Error::code`] reports
    /// `hipErrorInvalidValue`; match on the variant to tell them apart.
    #[error("Double free of {0:#x}")]
    DoubleFree(usize),

    /// The address was never allocated by this context
    #[error("Pointer {0:#x} was not allocated by this context")]
    InvalidDevicePointer(usize),

    /// Kernel and queue belong to different devices
    #[error("Kernel '{kernel}' is compiled for {kernel_device}, queue is bound to {queue_device}")]
    IncompatibleDevice {
        /// Kernel name
        kernel: String,
        /// Device the kernel was compiled for
        kernel_device: DeviceHandle,
        /// Device of the queue
        queue_device: DeviceHandle,
    },

    /// Module compilation failed
    #[error("Module compilation failed ({status}): {log}")]
    Compile {
        /// Native status
        status: ZeResult,
        /// Build log
        log: String,
    },

    /// No kernel with this name in the module
    #[error("Kernel '{0}' not found")]
    KernelNotFound(String),

    /// Module has not been compiled for the device
    #[error("Module is not compiled for {0}")]
    NotCompiled(DeviceHandle),

    /// Launch geometry rejected
    #[error("Invalid launch configuration: {0}")]
    InvalidConfiguration(String),

    /// Argument out of range
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Selection filters matched nothing
    #[error("No device matches platform '{platform}', type '{device_type}', device '{device}'")]
    NoMatchingDevice {
        /// Platform selector
        platform: String,
        /// Device type selector
        device_type: String,
        /// Device selector
        device: String,
    },

    /// `initialize` called twice
    #[error("Backend already initialized")]
    AlreadyInitialized,

    /// Backend used before `initialize`
    #[error("Backend not initialized")]
    NotInitialized,

    /// Context destroyed or unreachable
    #[error("Context is no longer valid")]
    InvalidContext,

    /// Object used after it was destroyed
    #[error("{0} has been destroyed")]
    Destroyed(&'static str),

    /// Feature not built
    #[error("Not implemented: {0}")]
    Unimplemented(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Wrap a native failure observed at the caller's location
    #[track_caller]
    #[inline]
    pub fn driver(status: ZeResult, message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
            status,
            location: Location::caller(),
        }
    }

    /// Create an out-of-memory error
    #[inline]
    pub fn out_of_memory(size: usize, kind: MemoryKind) -> Self {
        Self::OutOfMemory { size, kind }
    }

    /// Create an invalid value error
    #[inline]
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }

    /// Create an invalid configuration error
    #[inline]
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Create an unimplemented error, logged under its own target
    pub fn unimplemented(what: impl Into<String>) -> Self {
        let what = what.into();
        warn!(target: "chip_level0::unimplemented", feature = what.as_str(), "Unimplemented feature requested");
        Self::Unimplemented(what)
    }

    /// Portable code of this error
    pub fn code(&self) -> HipErrorCode {
        match self {
            Self::Driver { status, .. } => lz_convert_result(*status),
            Self::OutOfMemory { .. } => HipErrorCode::OutOfMemory,
            Self::UnsupportedMemoryKind(_) => HipErrorCode::NotSupported,
            Self::DoubleFree(_) => HipErrorCode::InvalidValue,
            Self::InvalidDevicePointer(_) => HipErrorCode::InvalidDevicePointer,
            Self::IncompatibleDevice { .. } => HipErrorCode::InvalidDevice,
            Self::Compile { .. } => HipErrorCode::InvalidImage,
            Self::KernelNotFound(_) => HipErrorCode::InvalidDeviceFunction,
            Self::NotCompiled(_) => HipErrorCode::NoBinaryForGpu,
            Self::InvalidConfiguration(_) => HipErrorCode::InvalidConfiguration,
            Self::InvalidValue(_) => HipErrorCode::InvalidValue,
            Self::NoMatchingDevice { .. } => HipErrorCode::NoDevice,
            Self::AlreadyInitialized => HipErrorCode::InvalidValue,
            Self::NotInitialized => HipErrorCode::NotInitialized,
            Self::InvalidContext => HipErrorCode::InvalidContext,
            Self::Destroyed(_) => HipErrorCode::InvalidHandle,
            Self::Unimplemented(_) => HipErrorCode::NotSupported,
            Self::Config(_) => HipErrorCode::InvalidValue,
        }
    }

    /// Native status behind the error, if any
    pub fn native_status(&self) -> Option<ZeResult> {
        match self {
            Self::Driver { status, .. } | Self::Compile { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if the caller can retry, e.g. after freeing memory
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::Driver {
                    status: ZeResult::ErrorOutOfDeviceMemory | ZeResult::ErrorOutOfHostMemory,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::out_of_memory(4096, MemoryKind::Shared);
        assert_eq!(
            err.to_string(),
            "Out of memory: 4096 bytes of shared memory requested"
        );
        assert_eq!(Error::DoubleFree(0x1000).to_string(), "Double free of 0x1000");
    }

    #[test]
    fn test_driver_error_records_call_site() {
        let err = Error::driver(ZeResult::ErrorDeviceLost, "zeCommandQueueSynchronize");
        let Error::Driver { location, .. } = &err else {
            panic!("expected driver error");
        };
        assert!(location.file().ends_with("error.rs"));
        assert!(err.to_string().contains("ZE_RESULT_ERROR_DEVICE_LOST"));
        assert_eq!(err.code(), HipErrorCode::LaunchFailure);
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::DoubleFree(1).code(), HipErrorCode::InvalidValue);
        assert_eq!(
            Error::InvalidDevicePointer(1).code(),
            HipErrorCode::InvalidDevicePointer
        );
        assert_eq!(Error::NotInitialized.code(), HipErrorCode::NotInitialized);
        assert_eq!(
            Error::unimplemented("image arguments").code(),
            HipErrorCode::NotSupported
        );
        assert_eq!(HipErrorCode::NoDevice.raw(), 100);
        assert_eq!(HipErrorCode::NotReady.to_string(), "hipErrorNotReady");
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::out_of_memory(1, MemoryKind::Device).is_recoverable());
        assert!(Error::driver(ZeResult::ErrorOutOfHostMemory, "alloc").is_recoverable());
        assert!(!Error::driver(ZeResult::ErrorDeviceLost, "sync").is_recoverable());
        assert!(!Error::AlreadyInitialized.is_recoverable());
    }
}
