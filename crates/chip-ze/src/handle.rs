//! Opaque native handles
//!
//! Handles are plain non-zero identifiers. They carry no ownership; whoever
//! created an object is responsible for destroying it through the driver.

use std::fmt;
use std::num::NonZeroU64;

macro_rules! define_handle {
    ($($(#[$doc:meta])* $name:ident => $native:literal;)+) => {
        $(
            $(#[$doc])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(NonZeroU64);

            impl $name {
                /// Wrap a raw handle value; zero is the null handle
                #[inline]
                pub const fn from_raw(raw: u64) -> Option<Self> {
                    match NonZeroU64::new(raw) {
                        Some(v) => Some(Self(v)),
                        None => None,
                    }
                }

                /// Wrap a value known to be non-null
                #[inline]
                pub const fn from_nonzero(raw: NonZeroU64) -> Self {
                    Self(raw)
                }

                /// Raw handle value
                #[inline]
                pub const fn raw(self) -> u64 {
                    self.0.get()
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}({:#x})", $native, self.0.get())
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Debug::fmt(self, f)
                }
            }
        )+
    };
}

define_handle! {
    /// A driver instance (platform)
    DriverHandle => "ze_driver_handle_t";
    /// A device exposed by a driver
    DeviceHandle => "ze_device_handle_t";
    /// A context
    ContextHandle => "ze_context_handle_t";
    /// A command queue
    CommandQueueHandle => "ze_command_queue_handle_t";
    /// A command list, regular or immediate
    CommandListHandle => "ze_command_list_handle_t";
    /// A fence attached to a command queue
    FenceHandle => "ze_fence_handle_t";
    /// A module built for one device
    ModuleHandle => "ze_module_handle_t";
    /// A kernel created from a module
    KernelHandle => "ze_kernel_handle_t";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle_rejected() {
        assert!(DeviceHandle::from_raw(0).is_none());
        assert_eq!(DeviceHandle::from_raw(7).map(DeviceHandle::raw), Some(7));
    }

    #[test]
    fn test_debug_names_native_type() {
        let h = FenceHandle::from_raw(0x10).unwrap();
        assert_eq!(format!("{h:?}"), "ze_fence_handle_t(0x10)");
    }
}
