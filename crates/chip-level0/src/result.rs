//! Native status translation
//!
//! Two call styles are provided. [`lz_process`] and [`LzResultExt::lz_context`]
//! propagate a failure as [`Error::Driver`]; [`lz_return`] yields the portable
//! code directly for entry points whose contract is a code return. In both,
//! `NOT_READY` is not a failure.

use std::panic::Location;

use chip_ze::ZeResult;
use tracing::error;

use crate::error::{Error, HipErrorCode, Result};

/// Canonical `ZE_RESULT_*` name of a native status
#[inline]
pub fn lz_result_to_string(status: ZeResult) -> &'static str {
    status.as_str()
}

/// Map a native status to its portable code
pub const fn lz_convert_result(status: ZeResult) -> HipErrorCode {
    use ZeResult::*;
    match status {
        Success => HipErrorCode::Success,
        NotReady => HipErrorCode::NotReady,
        ErrorOutOfHostMemory | ErrorOutOfDeviceMemory => HipErrorCode::OutOfMemory,
        ErrorDeviceLost => HipErrorCode::LaunchFailure,
        ErrorModuleBuildFailure
        | ErrorModuleLinkFailure
        | ErrorInvalidNativeBinary
        | ErrorInvalidModuleUnlinked => HipErrorCode::InvalidImage,
        ErrorUninitialized => HipErrorCode::NotInitialized,
        ErrorUnsupportedVersion
        | ErrorUnsupportedFeature
        | ErrorUnsupportedEnumeration
        | ErrorUnsupportedImageFormat => HipErrorCode::NotSupported,
        ErrorInvalidNullHandle | ErrorHandleObjectInUse | ErrorInvalidSynchronizationObject => {
            HipErrorCode::InvalidHandle
        }
        ErrorInvalidKernelName | ErrorInvalidFunctionName | ErrorInvalidGlobalName => {
            HipErrorCode::InvalidDeviceFunction
        }
        ErrorInvalidArgument
        | ErrorInvalidNullPointer
        | ErrorInvalidSize
        | ErrorUnsupportedSize
        | ErrorUnsupportedAlignment
        | ErrorInvalidEnumeration
        | ErrorInvalidGroupSizeDimension
        | ErrorInvalidGlobalWidthDimension
        | ErrorInvalidKernelArgumentIndex
        | ErrorInvalidKernelArgumentSize
        | ErrorInvalidKernelAttributeValue
        | ErrorInvalidCommandListType
        | ErrorOverlappingRegions => HipErrorCode::InvalidValue,
        ErrorUnknown => HipErrorCode::Unknown,
    }
}

fn log_failure(status: ZeResult, message: &str, location: &Location<'_>) {
    error!(
        status = lz_result_to_string(status),
        code = %lz_convert_result(status),
        file = location.file(),
        line = location.line(),
        "{message}"
    );
}

/// Propagate a native failure as [`Error::Driver`]
///
/// `Success` and `NotReady` pass.
#[track_caller]
pub fn lz_process(status: ZeResult, message: &str) -> Result<()> {
    if !status.is_error() {
        return Ok(());
    }
    let location = Location::caller();
    log_failure(status, message, location);
    Err(Error::Driver {
        message: message.to_string(),
        status,
        location,
    })
}

/// Translate a native failure into its portable code
///
/// Returns `None` when the caller should continue.
#[track_caller]
pub fn lz_return(status: ZeResult, message: &str) -> Option<HipErrorCode> {
    if !status.is_error() {
        return None;
    }
    log_failure(status, message, Location::caller());
    Some(lz_convert_result(status))
}

/// Portable code of a backend result
pub fn status_of<T>(result: &Result<T>) -> HipErrorCode {
    match result {
        Ok(_) => HipErrorCode::Success,
        Err(e) => e.code(),
    }
}

/// Attach context to the result of a value-producing native call
pub trait LzResultExt<T> {
    /// Turn a native error into [`Error::Driver`], logging the call site
    #[track_caller]
    fn lz_context(self, message: &str) -> Result<T>;
}

impl<T> LzResultExt<T> for chip_ze::Result<T> {
    #[track_caller]
    fn lz_context(self, message: &str) -> Result<T> {
        match self {
            Ok(value) => Ok(value),
            Err(status) => {
                let location = Location::caller();
                log_failure(status, message, location);
                Err(Error::Driver {
                    message: message.to_string(),
                    status,
                    location,
                })
            }
        }
    }
}
