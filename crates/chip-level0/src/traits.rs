//! Capability traits, one per runtime role
//!
//! The runtime front end programs against these; the Level Zero types in
//! this crate are the implementation.

use std::sync::Arc;

use chip_ze::KernelHandle;

use crate::backend::Level0Backend;
use crate::blob::KernelBlob;
use crate::context::Level0Context;
use crate::device::{DeviceProperties, Level0Device};
use crate::error::Result;
use crate::exec::ExecItem;
use crate::kernel::{FunctionInfo, Level0Kernel};
use crate::memory::{DevicePtr, MemoryKind};
use crate::module::Level0Module;
use crate::queue::Level0Queue;

/// Backend lifecycle and device enumeration
pub trait ChipBackend: Send + Sync {
    /// Device type for this backend
    type Device: ChipDevice;

    /// Discover and set up the devices matching the selectors
    fn initialize(&self, platform: &str, device_type: &str, device: &str) -> Result<()>;

    /// Release every native object
    fn uninitialize(&self) -> Result<()>;

    /// Number of selected devices
    fn device_count(&self) -> usize;

    /// Device at `index`
    fn device(&self, index: usize) -> Result<Arc<Self::Device>>;
}

/// One compute device
pub trait ChipDevice: Send + Sync {
    /// Context type for this backend
    type Context: ChipContext;
    /// Module type for this backend
    type Module: ChipModule<Device = Self>;
    /// Queue type for this backend; launches kernels of `Self::Module`
    type Queue: ChipQueue<Kernel = <Self::Module as ChipModule>::Kernel>;

    fn name(&self) -> &str;

    /// Cached capabilities
    fn properties(&self) -> &DeviceProperties;

    /// Allocator root of the device
    fn context(&self) -> Result<Arc<Self::Context>>;

    /// Register a kernel blob
    fn add_module(&self, blob: Arc<KernelBlob>) -> Arc<Self::Module>;

    /// Create another queue on the device
    fn create_queue(self: &Arc<Self>) -> Result<Arc<Self::Queue>>;

    /// Drain queues, drop modules and free allocations
    fn reset(&self) -> Result<()>;
}

/// Memory allocation
pub trait ChipContext: Send + Sync {
    /// Allocate `size` bytes; `alignment` 0 selects the default
    fn allocate(&self, size: usize, alignment: usize, kind: MemoryKind) -> Result<DevicePtr>;

    /// Release an allocation
    fn free(&self, ptr: DevicePtr) -> Result<()>;
}

/// Ordered execution of launches and copies
pub trait ChipQueue: Send + Sync {
    /// Kernel type accepted by [`launch`](Self::launch)
    type Kernel: ChipKernel;

    /// Enqueue a kernel launch
    fn launch(&self, item: &ExecItem<Self::Kernel>) -> Result<()>;

    /// Copy and wait for completion
    ///
    /// # Safety
    /// `src` must be readable and `dst` writable for `size` bytes.
    unsafe fn mem_copy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()>;

    /// Enqueue a copy
    ///
    /// # Safety
    /// Both ranges must stay valid until the copy has completed.
    unsafe fn mem_copy_async(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()>;

    /// Block until all enqueued work has completed
    fn finish(&self) -> Result<()>;

    /// `true` if all enqueued work has completed
    fn query(&self) -> Result<bool>;
}

/// Per-device compilation of a kernel blob
pub trait ChipModule: Send + Sync {
    /// Device type the module compiles for
    type Device;
    /// Kernel type produced by compilation
    type Kernel: ChipKernel;

    /// Build for `device`; repeated calls do nothing
    fn compile(&self, device: &Self::Device) -> Result<()>;

    /// Kernel `name` compiled for `device`
    fn get_kernel(&self, device: &Self::Device, name: &str) -> Result<Arc<Self::Kernel>>;
}

/// A compiled entry point
pub trait ChipKernel: Send + Sync {
    /// Native handle type
    type Handle: Copy;

    fn name(&self) -> &str;

    fn handle(&self) -> Self::Handle;

    /// Reflected signature
    fn function_info(&self) -> &FunctionInfo;
}

// =============================================================================
// Level Zero implementation
// =============================================================================

impl ChipBackend for Level0Backend {
    type Device = Level0Device;

    fn initialize(&self, platform: &str, device_type: &str, device: &str) -> Result<()> {
        Level0Backend::initialize(self, platform, device_type, device)
    }

    fn uninitialize(&self) -> Result<()> {
        Level0Backend::uninitialize(self)
    }

    fn device_count(&self) -> usize {
        Level0Backend::device_count(self)
    }

    fn device(&self, index: usize) -> Result<Arc<Level0Device>> {
        Level0Backend::device(self, index)
    }
}

impl ChipDevice for Level0Device {
    type Context = Level0Context;
    type Module = Level0Module;
    type Queue = Level0Queue;

    fn name(&self) -> &str {
        Level0Device::name(self)
    }

    fn properties(&self) -> &DeviceProperties {
        Level0Device::properties(self)
    }

    fn context(&self) -> Result<Arc<Level0Context>> {
        Level0Device::context(self)
    }

    fn add_module(&self, blob: Arc<KernelBlob>) -> Arc<Level0Module> {
        Level0Device::add_module(self, blob)
    }

    fn create_queue(self: &Arc<Self>) -> Result<Arc<Level0Queue>> {
        Level0Device::create_queue(self)
    }

    fn reset(&self) -> Result<()> {
        Level0Device::reset(self)
    }
}

impl ChipContext for Level0Context {
    fn allocate(&self, size: usize, alignment: usize, kind: MemoryKind) -> Result<DevicePtr> {
        Level0Context::allocate(self, size, alignment, kind)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        Level0Context::free(self, ptr)
    }
}

impl ChipQueue for Level0Queue {
    type Kernel = Level0Kernel;

    fn launch(&self, item: &ExecItem<Level0Kernel>) -> Result<()> {
        Level0Queue::launch(self, item)
    }

    unsafe fn mem_copy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        // SAFETY: same contract.
        unsafe { Level0Queue::mem_copy(self, dst, src, size) }
    }

    unsafe fn mem_copy_async(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        // SAFETY: same contract.
        unsafe { Level0Queue::mem_copy_async(self, dst, src, size) }
    }

    fn finish(&self) -> Result<()> {
        Level0Queue::finish(self)
    }

    fn query(&self) -> Result<bool> {
        Level0Queue::query(self)
    }
}

impl ChipModule for Level0Module {
    type Device = Level0Device;
    type Kernel = Level0Kernel;

    fn compile(&self, device: &Level0Device) -> Result<()> {
        Level0Module::compile(self, device)
    }

    fn get_kernel(&self, device: &Level0Device, name: &str) -> Result<Arc<Level0Kernel>> {
        Level0Module::get_kernel(self, device, name)
    }
}

impl ChipKernel for Level0Kernel {
    type Handle = KernelHandle;

    fn name(&self) -> &str {
        Level0Kernel::name(self)
    }

    fn handle(&self) -> KernelHandle {
        Level0Kernel::handle(self)
    }

    fn function_info(&self) -> &FunctionInfo {
        Level0Kernel::function_info(self)
    }
}
