//! Native status codes
//!
//! Every driver entry point reports through a single status channel. Besides
//! success and the error family, the channel carries `NOT_READY`, which
//! polling primitives (fences, queue synchronization with a timeout) use to
//! say "still in flight". `NOT_READY` is not a failure.

/// Result type for driver entry points that produce a value
///
/// The error side is never [`ZeResult::Success`] or [`ZeResult::NotReady`].
pub type Result<T> = std::result::Result<T, ZeResult>;

macro_rules! ze_results {
    ($( $(#[$doc:meta])* $variant:ident = $raw:literal => $name:literal, )+) => {
        /// Native driver status
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
        #[repr(u32)]
        pub enum ZeResult {
            $(
                $(#[$doc])*
                #[error($name)]
                $variant = $raw,
            )+
        }

        impl ZeResult {
            /// Canonical `ZE_RESULT_*` name of the status
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $name, )+
                }
            }

            /// Decode a raw status value; unrecognised values become `ErrorUnknown`
            pub const fn from_raw(raw: u32) -> Self {
                match raw {
                    $( $raw => Self::$variant, )+
                    _ => Self::ErrorUnknown,
                }
            }

            /// All known statuses, in declaration order
            pub const ALL: &'static [ZeResult] = &[ $( Self::$variant, )+ ];
        }
    };
}

ze_results! {
    /// Call completed
    Success = 0x0 => "ZE_RESULT_SUCCESS",
    /// Synchronization primitive not yet signaled
    NotReady = 0x1 => "ZE_RESULT_NOT_READY",
    /// Device hung, reset, was removed, or the driver was updated
    ErrorDeviceLost = 0x7000_0001 => "ZE_RESULT_ERROR_DEVICE_LOST",
    /// Insufficient host memory
    ErrorOutOfHostMemory = 0x7000_0002 => "ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY",
    /// Insufficient device memory
    ErrorOutOfDeviceMemory = 0x7000_0003 => "ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY",
    /// Module failed to build
    ErrorModuleBuildFailure = 0x7000_0004 => "ZE_RESULT_ERROR_MODULE_BUILD_FAILURE",
    /// Module failed to link
    ErrorModuleLinkFailure = 0x7000_0005 => "ZE_RESULT_ERROR_MODULE_LINK_FAILURE",
    /// Driver not initialized
    ErrorUninitialized = 0x7800_0001 => "ZE_RESULT_ERROR_UNINITIALIZED",
    /// Unsupported API version
    ErrorUnsupportedVersion = 0x7800_0002 => "ZE_RESULT_ERROR_UNSUPPORTED_VERSION",
    /// Unsupported feature
    ErrorUnsupportedFeature = 0x7800_0003 => "ZE_RESULT_ERROR_UNSUPPORTED_FEATURE",
    /// Invalid argument
    ErrorInvalidArgument = 0x7800_0004 => "ZE_RESULT_ERROR_INVALID_ARGUMENT",
    /// Null or unknown handle
    ErrorInvalidNullHandle = 0x7800_0005 => "ZE_RESULT_ERROR_INVALID_NULL_HANDLE",
    /// Object still in use by the device
    ErrorHandleObjectInUse = 0x7800_0006 => "ZE_RESULT_ERROR_HANDLE_OBJECT_IN_USE",
    /// Null pointer argument
    ErrorInvalidNullPointer = 0x7800_0007 => "ZE_RESULT_ERROR_INVALID_NULL_POINTER",
    /// Size argument out of range
    ErrorInvalidSize = 0x7800_0008 => "ZE_RESULT_ERROR_INVALID_SIZE",
    /// Size not supported by the device
    ErrorUnsupportedSize = 0x7800_0009 => "ZE_RESULT_ERROR_UNSUPPORTED_SIZE",
    /// Alignment not supported by the device
    ErrorUnsupportedAlignment = 0x7800_000a => "ZE_RESULT_ERROR_UNSUPPORTED_ALIGNMENT",
    /// Invalid synchronization object
    ErrorInvalidSynchronizationObject = 0x7800_000b => "ZE_RESULT_ERROR_INVALID_SYNCHRONIZATION_OBJECT",
    /// Enumerator out of range
    ErrorInvalidEnumeration = 0x7800_000c => "ZE_RESULT_ERROR_INVALID_ENUMERATION",
    /// Enumerator not supported by the device
    ErrorUnsupportedEnumeration = 0x7800_000d => "ZE_RESULT_ERROR_UNSUPPORTED_ENUMERATION",
    /// Image format not supported by the device
    ErrorUnsupportedImageFormat = 0x7800_000e => "ZE_RESULT_ERROR_UNSUPPORTED_IMAGE_FORMAT",
    /// Native binary not valid for the device
    ErrorInvalidNativeBinary = 0x7800_000f => "ZE_RESULT_ERROR_INVALID_NATIVE_BINARY",
    /// Global variable not found in module
    ErrorInvalidGlobalName = 0x7800_0010 => "ZE_RESULT_ERROR_INVALID_GLOBAL_NAME",
    /// Kernel not found in module
    ErrorInvalidKernelName = 0x7800_0011 => "ZE_RESULT_ERROR_INVALID_KERNEL_NAME",
    /// Function not found in module
    ErrorInvalidFunctionName = 0x7800_0012 => "ZE_RESULT_ERROR_INVALID_FUNCTION_NAME",
    /// Group size dimension not valid for the kernel or device
    ErrorInvalidGroupSizeDimension = 0x7800_0013 => "ZE_RESULT_ERROR_INVALID_GROUP_SIZE_DIMENSION",
    /// Global width dimension not valid for the kernel or device
    ErrorInvalidGlobalWidthDimension = 0x7800_0014 => "ZE_RESULT_ERROR_INVALID_GLOBAL_WIDTH_DIMENSION",
    /// Kernel argument index out of range
    ErrorInvalidKernelArgumentIndex = 0x7800_0015 => "ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_INDEX",
    /// Kernel argument size does not match the kernel
    ErrorInvalidKernelArgumentSize = 0x7800_0016 => "ZE_RESULT_ERROR_INVALID_KERNEL_ARGUMENT_SIZE",
    /// Kernel attribute value not valid
    ErrorInvalidKernelAttributeValue = 0x7800_0017 => "ZE_RESULT_ERROR_INVALID_KERNEL_ATTRIBUTE_VALUE",
    /// Module has unresolved imports
    ErrorInvalidModuleUnlinked = 0x7800_0018 => "ZE_RESULT_ERROR_INVALID_MODULE_UNLINKED",
    /// Command list type does not match the queue
    ErrorInvalidCommandListType = 0x7800_0019 => "ZE_RESULT_ERROR_INVALID_COMMAND_LIST_TYPE",
    /// Copy regions overlap
    ErrorOverlappingRegions = 0x7800_001a => "ZE_RESULT_ERROR_OVERLAPPING_REGIONS",
    /// Unknown or internal error
    ErrorUnknown = 0x7fff_fffe => "ZE_RESULT_ERROR_UNKNOWN",
}

impl ZeResult {
    /// Raw status value
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// `true` for `Success`
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// `true` for `NotReady`
    #[inline]
    pub const fn is_not_ready(self) -> bool {
        matches!(self, Self::NotReady)
    }

    /// `true` for anything other than `Success` or `NotReady`
    #[inline]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success | Self::NotReady)
    }

    /// Convert a status into a `Result`, treating `NotReady` as an error
    ///
    /// Polling code should match on the status instead.
    #[inline]
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            other => Err(other),
        }
    }
}
