//! The native driver seam
//!
//! `ZeDriver` is the subset of the Level Zero entry points the runtime
//! backend calls. Methods that produce a value return [`Result`]; polling
//! primitives return the raw [`ZeResult`] because `NotReady` is a legitimate
//! answer there, not a failure.
//!
//! Memory is addressed with raw pointers, as in the native API. Appending a
//! copy or fill records the pointers for later execution, so those methods
//! are `unsafe`.

use crate::handle::{
    CommandListHandle, CommandQueueHandle, ContextHandle, DeviceHandle, DriverHandle,
    FenceHandle, KernelHandle, ModuleHandle,
};
use crate::result::{Result, ZeResult};
use crate::types::{
    CommandQueueDesc, ComputeProperties, DeviceProperties, DriverProperties, GroupCount,
    GroupSize, KernelProperties, MemoryAccessProperties, MemoryProperties, ModuleDesc,
};

/// Timeout value that waits forever
pub const WAIT_INFINITE: u64 = u64::MAX;

/// Native driver entry points
pub trait ZeDriver: Send + Sync {
    // =========================================================================
    // Discovery
    // =========================================================================

    /// Initialize the driver; must succeed before any other call
    fn init(&self) -> Result<()>;

    /// Enumerate driver instances (platforms)
    fn driver_get(&self) -> Result<Vec<DriverHandle>>;

    /// Query driver instance properties
    fn driver_get_properties(&self, driver: DriverHandle) -> Result<DriverProperties>;

    /// Enumerate the devices of a driver instance
    fn device_get(&self, driver: DriverHandle) -> Result<Vec<DeviceHandle>>;

    /// Query general device properties
    fn device_get_properties(&self, device: DeviceHandle) -> Result<DeviceProperties>;

    /// Query compute properties
    fn device_get_compute_properties(&self, device: DeviceHandle) -> Result<ComputeProperties>;

    /// Query memory regions
    fn device_get_memory_properties(&self, device: DeviceHandle) -> Result<Vec<MemoryProperties>>;

    /// Query which allocation kinds the device supports
    fn device_get_memory_access_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<MemoryAccessProperties>;

    // =========================================================================
    // Contexts and memory
    // =========================================================================

    /// Create a context on a driver instance
    fn context_create(&self, driver: DriverHandle) -> Result<ContextHandle>;

    /// Destroy a context
    fn context_destroy(&self, context: ContextHandle) -> Result<()>;

    /// Allocate device-local memory; `alignment == 0` selects the driver default
    fn mem_alloc_device(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
        device: DeviceHandle,
    ) -> Result<*mut u8>;

    /// Allocate host memory visible to every device of the context
    fn mem_alloc_host(&self, context: ContextHandle, size: usize, alignment: usize)
    -> Result<*mut u8>;

    /// Allocate memory shared between the host and `device`
    fn mem_alloc_shared(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
        device: DeviceHandle,
    ) -> Result<*mut u8>;

    /// Release memory returned by one of the allocation calls
    fn mem_free(&self, context: ContextHandle, ptr: *mut u8) -> Result<()>;

    // =========================================================================
    // Command queues
    // =========================================================================

    /// Create a command queue
    fn command_queue_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> Result<CommandQueueHandle>;

    /// Destroy a command queue after its outstanding work completes
    fn command_queue_destroy(&self, queue: CommandQueueHandle) -> Result<()>;

    /// Submit closed command lists; `fence` is signaled once they complete
    fn command_queue_execute_command_lists(
        &self,
        queue: CommandQueueHandle,
        lists: &[CommandListHandle],
        fence: Option<FenceHandle>,
    ) -> Result<()>;

    /// Wait up to `timeout_ns` for the queue to go idle
    ///
    /// Returns `Success`, `NotReady` on timeout, or an error status.
    fn command_queue_synchronize(&self, queue: CommandQueueHandle, timeout_ns: u64) -> ZeResult;

    // =========================================================================
    // Command lists
    // =========================================================================

    /// Create a regular command list
    fn command_list_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
    ) -> Result<CommandListHandle>;

    /// Create an immediate command list; appended commands execute right away
    fn command_list_create_immediate(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> Result<CommandListHandle>;

    /// Destroy a command list
    fn command_list_destroy(&self, list: CommandListHandle) -> Result<()>;

    /// Close a regular command list for execution
    fn command_list_close(&self, list: CommandListHandle) -> Result<()>;

    /// Reset a command list to the empty, open state
    fn command_list_reset(&self, list: CommandListHandle) -> Result<()>;

    /// Append a memory copy
    ///
    /// # Safety
    /// `src` must be readable and `dst` writable for `size` bytes until the
    /// command has executed.
    unsafe fn command_list_append_memory_copy(
        &self,
        list: CommandListHandle,
        dst: *mut u8,
        src: *const u8,
        size: usize,
    ) -> Result<()>;

    /// Append a fill of `size` bytes at `dst` with a repeated `pattern`
    ///
    /// # Safety
    /// `dst` must be writable for `size` bytes until the command has executed.
    unsafe fn command_list_append_memory_fill(
        &self,
        list: CommandListHandle,
        dst: *mut u8,
        pattern: &[u8],
        size: usize,
    ) -> Result<()>;

    /// Append an execution barrier
    fn command_list_append_barrier(&self, list: CommandListHandle) -> Result<()>;

    /// Append a kernel dispatch; the kernel's current arguments are captured
    fn command_list_append_launch_kernel(
        &self,
        list: CommandListHandle,
        kernel: KernelHandle,
        group_count: GroupCount,
    ) -> Result<()>;

    // =========================================================================
    // Fences
    // =========================================================================

    /// Create a fence for a command queue
    fn fence_create(&self, queue: CommandQueueHandle) -> Result<FenceHandle>;

    /// Destroy a fence
    fn fence_destroy(&self, fence: FenceHandle) -> Result<()>;

    /// Wait up to `timeout_ns` for the fence; `NotReady` on timeout
    fn fence_host_synchronize(&self, fence: FenceHandle, timeout_ns: u64) -> ZeResult;

    /// Poll a fence without blocking
    fn fence_query_status(&self, fence: FenceHandle) -> ZeResult;

    /// Return a fence to the unsignaled state
    fn fence_reset(&self, fence: FenceHandle) -> Result<()>;

    // =========================================================================
    // Modules and kernels
    // =========================================================================

    /// Build a module for a device; diagnostics are appended to `build_log`
    fn module_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ModuleDesc<'_>,
        build_log: &mut String,
    ) -> Result<ModuleHandle>;

    /// Destroy a module; its kernels must be destroyed first
    fn module_destroy(&self, module: ModuleHandle) -> Result<()>;

    /// Names of the kernels defined by a module
    fn module_get_kernel_names(&self, module: ModuleHandle) -> Result<Vec<String>>;

    /// Create a kernel object
    fn kernel_create(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle>;

    /// Destroy a kernel object
    fn kernel_destroy(&self, kernel: KernelHandle) -> Result<()>;

    /// Set the work-group size used by subsequent launches
    fn kernel_set_group_size(&self, kernel: KernelHandle, size: GroupSize) -> Result<()>;

    /// Set one argument; `None` with a size declares local memory
    fn kernel_set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        size: usize,
        value: Option<&[u8]>,
    ) -> Result<()>;

    /// Query kernel properties
    fn kernel_get_properties(&self, kernel: KernelHandle) -> Result<KernelProperties>;
}
