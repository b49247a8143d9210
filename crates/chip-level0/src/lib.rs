//! Level Zero backend for a portable GPU runtime
//!
//! Translates the runtime's device, context, module, kernel and queue
//! abstractions onto a Level Zero style driver ([`chip_ze::ZeDriver`]):
//!
//! - **Backend**: explicit, owned entry point; selects platforms and devices
//!   and tears everything down in dependency order
//! - **Context**: allocations of device, host and shared memory with
//!   double-free and foreign-pointer detection
//! - **Module**: per-device compilation of a kernel blob
//! - **Queue**: pooled command lists and fences, FIFO submission, blocking
//!   and non-blocking completion
//! - **Result translation**: every native status maps to one portable code
//!
//! # Example
//!
//! ```no_run
//! # fn main() -> chip_level0::Result<()> {
//! use std::sync::Arc;
//!
//! use chip_level0::{Level0Backend, MemoryKind};
//! use chip_ze::HostDriver;
//!
//! let backend = Level0Backend::new(Arc::new(HostDriver::new()));
//! backend.initialize("", "gpu", "")?;
//!
//! let context = backend.context(0)?;
//! let queue = backend.default_queue(0)?;
//! let src = vec![7u8; 4096];
//! let dst = context.allocate(src.len(), 0, MemoryKind::Device)?;
//! // SAFETY: both ranges are 4096 bytes and outlive the blocking copy.
//! unsafe { queue.mem_copy(dst.as_ptr(), src.as_ptr(), src.len())? };
//! context.free(dst)?;
//!
//! backend.uninitialize()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod blob;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod exec;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod module;
pub mod queue;
pub mod result;
pub mod selector;
pub mod traits;

pub use backend::Level0Backend;
pub use blob::KernelBlob;
pub use config::{BackendConfig, ConfigError, ConfigLoader, ConfigSource};
pub use context::Level0Context;
pub use device::{DeviceProperties, Level0Device, populate_device_properties};
pub use error::{Error, HipErrorCode, Result};
pub use exec::{Dim3, ExecItem};
pub use kernel::{FunctionInfo, Level0Kernel, ParamInfo, ParamKind};
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput, init_logging};
pub use memory::{AllocationInfo, DevicePtr, MemoryKind};
pub use module::Level0Module;
pub use queue::{Level0Queue, QueueState};
pub use result::{LzResultExt, lz_convert_result, lz_process, lz_result_to_string, lz_return, status_of};
pub use selector::{DeviceSelector, DeviceTypeSelector, PlatformSelector};
pub use traits::{ChipBackend, ChipContext, ChipDevice, ChipKernel, ChipModule, ChipQueue};
