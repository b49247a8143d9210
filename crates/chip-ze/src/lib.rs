//! Level Zero style native driver interface
//!
//! This crate describes the explicit GPU driver API that the portable runtime
//! backend is translated onto:
//!
//! - [`ZeResult`]: the native status channel, including `NOT_READY`
//! - opaque handles for drivers, devices, contexts, command queues, command
//!   lists, fences, modules and kernels
//! - property structures and descriptors
//! - [`ZeDriver`]: the entry points the backend calls
//!
//! [`host::HostDriver`] implements the trait on the CPU so the backend can run
//! without vendor hardware.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod handle;
pub mod host;
pub mod result;
pub mod types;

pub use driver::{WAIT_INFINITE, ZeDriver};
pub use handle::{
    CommandListHandle, CommandQueueHandle, ContextHandle, DeviceHandle, DriverHandle,
    FenceHandle, KernelHandle, ModuleHandle,
};
pub use host::{DriverOp, HostDeviceConfig, HostDriver, HostDriverStats, HostKernel, LiveObjects};
pub use result::{Result, ZeResult};
pub use types::*;
