//! Host-emulated driver
//!
//! [`HostDriver`] implements [`ZeDriver`] on the CPU. Memory is real host
//! memory, each command queue drains its submissions on a dedicated worker
//! thread, and kernels are Rust closures registered by name and resolved when
//! a module is built. Kernel work-groups run in parallel on the rayon pool.
//!
//! The driver also keeps an inventory of live objects and counters of the
//! work it performed, and can be told to fail a given entry point, which
//! makes it suitable for exercising error paths of code layered on top.
//!
//! ```ignore
//! let driver = HostDriver::builder()
//!     .platform("Emulated")
//!     .device(HostDeviceConfig::gpu("Emulated GPU 0"))
//!     .kernel(HostKernel::new("noop", 0, |_, _| {}))
//!     .build();
//! driver.init()?;
//! ```

mod engine;
mod kernel;

pub use kernel::{
    ArgScalar, ArgValue, HostKernel, HostKernelFn, KernelArgs, MODULE_MAGIC, WorkGroup,
    module_binary,
};

use std::alloc::Layout;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use self::engine::{Command, EngineStats, HostFence, HostQueue, Launch};
use self::kernel::{ParseError, parse_module};
use crate::driver::{WAIT_INFINITE, ZeDriver};
use crate::handle::{
    CommandListHandle, CommandQueueHandle, ContextHandle, DeviceHandle, DriverHandle,
    FenceHandle, KernelHandle, ModuleHandle,
};
use crate::result::{Result, ZeResult};
use crate::types::{
    CommandQueueDesc, CommandQueueMode, ComputeProperties, DeviceProperties, DeviceType,
    DriverProperties, GroupCount, GroupSize, KernelProperties, MemoryAccessProperties,
    MemoryProperties, ModuleDesc, ModuleFormat,
};

/// Platform name used when the builder names none
pub const DEFAULT_PLATFORM: &str = "Host Level Zero Platform";

/// Alignment applied when an allocation asks for the driver default
pub const DEFAULT_ALIGNMENT: usize = 64;

const DRIVER_VERSION: u32 = 0x0001_0000;
const GIB: u64 = 1 << 30;

/// Shape of one emulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceConfig {
    /// Device name
    pub name: String,
    /// Reported device category
    pub device_type: DeviceType,
    /// PCI vendor id
    pub vendor_id: u32,
    /// Device id
    pub device_id: u32,
    /// Capacity shared by device and shared allocations
    pub memory_size: u64,
    /// Largest single allocation
    pub max_mem_alloc_size: u64,
    /// Maximum work-items per group
    pub max_total_group_size: u32,
    /// Maximum group size per dimension
    pub max_group_size: [u32; 3],
    /// Maximum group count per dimension
    pub max_group_count: [u32; 3],
    /// Local memory per group in bytes
    pub shared_local_memory: u32,
    /// Supported sub-group sizes
    pub sub_group_sizes: Vec<u32>,
    /// Core clock in MHz
    pub core_clock_mhz: u32,
    /// Threads per execution unit
    pub threads_per_eu: u32,
    /// Execution units per subslice
    pub eus_per_subslice: u32,
    /// Subslices per slice
    pub subslices_per_slice: u32,
    /// Slices
    pub slices: u32,
    /// Memory is shared with the host
    pub integrated: bool,
    /// Shared allocations are supported
    pub shared_alloc: bool,
}

impl HostDeviceConfig {
    /// A discrete GPU with 4 GiB of memory
    pub fn gpu(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_type: DeviceType::Gpu,
            vendor_id: 0x8086,
            device_id: 0x56a0,
            memory_size: 4 * GIB,
            max_mem_alloc_size: GIB,
            max_total_group_size: 1024,
            max_group_size: [1024, 1024, 64],
            max_group_count: [u32::MAX, 65535, 65535],
            shared_local_memory: 64 * 1024,
            sub_group_sizes: vec![8, 16, 32],
            core_clock_mhz: 1200,
            threads_per_eu: 8,
            eus_per_subslice: 8,
            subslices_per_slice: 8,
            slices: 1,
            integrated: false,
            shared_alloc: true,
        }
    }

    /// A CPU device
    pub fn cpu(name: impl Into<String>) -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0x0001,
            memory_size: 2 * GIB,
            max_mem_alloc_size: GIB / 2,
            max_total_group_size: 256,
            max_group_size: [256, 256, 256],
            shared_local_memory: 32 * 1024,
            sub_group_sizes: vec![4, 8, 16],
            core_clock_mhz: 2400,
            threads_per_eu: 2,
            eus_per_subslice: 1,
            subslices_per_slice: 1,
            slices: 8,
            integrated: true,
            ..Self::gpu(name)
        }
    }

    /// Set memory capacity and the single allocation limit
    pub fn with_memory(mut self, memory_size: u64, max_mem_alloc_size: u64) -> Self {
        self.memory_size = memory_size;
        self.max_mem_alloc_size = max_mem_alloc_size;
        self
    }

    /// Enable or disable shared allocations
    pub fn with_shared_alloc(mut self, enabled: bool) -> Self {
        self.shared_alloc = enabled;
        self
    }

    /// Set the device type
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }
}

/// Driver entry points that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    /// `init`
    Init,
    /// Platform enumeration
    DriverGet,
    /// Device enumeration
    DeviceGet,
    /// Every device property query
    DeviceGetProperties,
    /// `context_create`
    ContextCreate,
    /// `context_destroy`
    ContextDestroy,
    /// Device, host and shared allocation
    MemAlloc,
    /// `mem_free`
    MemFree,
    /// `command_queue_create`
    CommandQueueCreate,
    /// `command_queue_destroy`
    CommandQueueDestroy,
    /// Command list execution
    CommandQueueExecute,
    /// Queue synchronization, blocking or polling
    CommandQueueSynchronize,
    /// Regular and immediate command lists
    CommandListCreate,
    /// `command_list_destroy`
    CommandListDestroy,
    /// `command_list_close`
    CommandListClose,
    /// `command_list_reset`
    CommandListReset,
    /// Every append
    CommandListAppend,
    /// `fence_create`
    FenceCreate,
    /// `fence_destroy`
    FenceDestroy,
    /// Fence waits and status queries
    FenceSynchronize,
    /// `module_create`
    ModuleCreate,
    /// `module_destroy`
    ModuleDestroy,
    /// `kernel_create`
    KernelCreate,
    /// `kernel_destroy`
    KernelDestroy,
    /// `kernel_set_group_size`
    KernelSetGroupSize,
    /// `kernel_set_argument_value`
    KernelSetArgument,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    skip: u32,
    status: ZeResult,
}

/// Work counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDriverStats {
    /// Command list executions submitted to queues
    pub submissions: u64,
    /// Commands executed inline by immediate lists
    pub immediate_commands: u64,
    /// Kernel dispatches executed
    pub kernel_launches: u64,
    /// Copies executed
    pub copies: u64,
    /// Fills executed
    pub fills: u64,
    /// Bytes moved by copies
    pub bytes_copied: u64,
    /// Successful allocations
    pub allocations: u64,
    /// Successful frees
    pub frees: u64,
    /// Modules built
    pub modules_built: u64,
}

/// Count of live driver objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    /// Contexts
    pub contexts: usize,
    /// Command queues
    pub command_queues: usize,
    /// Regular and immediate command lists
    pub command_lists: usize,
    /// Fences
    pub fences: usize,
    /// Modules
    pub modules: usize,
    /// Kernels
    pub kernels: usize,
    /// Outstanding allocations
    pub allocations: usize,
}

impl LiveObjects {
    /// Sum over every kind
    pub fn total(&self) -> usize {
        self.contexts
            + self.command_queues
            + self.command_lists
            + self.fences
            + self.modules
            + self.kernels
            + self.allocations
    }

    /// `true` when nothing is alive
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Builder for [`HostDriver`]
#[derive(Debug, Default)]
pub struct HostDriverBuilder {
    platforms: Vec<(String, Vec<HostDeviceConfig>)>,
    kernels: Vec<HostKernel>,
}

impl HostDriverBuilder {
    /// Start a new platform; later devices are added to it
    pub fn platform(mut self, name: impl Into<String>) -> Self {
        self.platforms.push((name.into(), Vec::new()));
        self
    }

    /// Add a device to the current platform
    pub fn device(mut self, config: HostDeviceConfig) -> Self {
        match self.platforms.last_mut() {
            Some((_, devices)) => devices.push(config),
            None => self.platforms.push((DEFAULT_PLATFORM.to_string(), vec![config])),
        }
        self
    }

    /// Register a kernel that modules may reference
    pub fn kernel(mut self, kernel: HostKernel) -> Self {
        self.kernels.push(kernel);
        self
    }

    /// Register several kernels
    pub fn kernels(mut self, kernels: impl IntoIterator<Item = HostKernel>) -> Self {
        self.kernels.extend(kernels);
        self
    }

    /// Build the driver; with no platform configured, one GPU is provided
    pub fn build(self) -> HostDriver {
        let mut platforms = self.platforms;
        if platforms.is_empty() {
            platforms.push((
                DEFAULT_PLATFORM.to_string(),
                vec![HostDeviceConfig::gpu("Host GPU")],
            ));
        }

        let next = AtomicU64::new(0);
        let mint = || NonZeroU64::MIN.saturating_add(next.fetch_add(1, Ordering::Relaxed));

        let mut platform_records = Vec::with_capacity(platforms.len());
        let mut devices = HashMap::new();
        for (name, configs) in platforms {
            let handle = DriverHandle::from_nonzero(mint());
            let mut device_handles = Vec::with_capacity(configs.len());
            for config in configs {
                let device = DeviceHandle::from_nonzero(mint());
                devices.insert(
                    device,
                    DeviceRecord {
                        driver: handle,
                        config,
                    },
                );
                device_handles.push(device);
            }
            platform_records.push(PlatformRecord {
                handle,
                name,
                devices: device_handles,
            });
        }

        let registry = self
            .kernels
            .into_iter()
            .map(|k| (k.name().to_string(), k))
            .collect();

        HostDriver {
            inner: Arc::new(Inner {
                initialized: AtomicBool::new(false),
                platforms: platform_records,
                devices,
                registry,
                next_handle: AtomicU64::new(next.load(Ordering::Relaxed)),
                contexts: DashMap::new(),
                queues: DashMap::new(),
                lists: DashMap::new(),
                fences: DashMap::new(),
                modules: DashMap::new(),
                kernels: DashMap::new(),
                memory: Mutex::new(MemoryState::default()),
                faults: Mutex::new(HashMap::new()),
                engine_stats: Arc::new(EngineStats::default()),
                allocations: AtomicU64::new(0),
                frees: AtomicU64::new(0),
                modules_built: AtomicU64::new(0),
            }),
        }
    }
}

struct PlatformRecord {
    handle: DriverHandle,
    name: String,
    devices: Vec<DeviceHandle>,
}

struct DeviceRecord {
    driver: DriverHandle,
    config: HostDeviceConfig,
}

struct ContextRecord {
    driver: DriverHandle,
}

struct QueueRecord {
    context: ContextHandle,
    device: DeviceHandle,
    mode: CommandQueueMode,
    engine: Arc<HostQueue>,
}

struct ListObject {
    context: ContextHandle,
    device: DeviceHandle,
    immediate: bool,
    state: Mutex<ListState>,
}

#[derive(Default)]
struct ListState {
    closed: bool,
    commands: Vec<Command>,
}

struct FenceRecord {
    queue: CommandQueueHandle,
    fence: Arc<HostFence>,
}

struct ModuleRecord {
    context: ContextHandle,
    device: DeviceHandle,
    kernels: Vec<String>,
}

struct KernelObject {
    module: ModuleHandle,
    device: DeviceHandle,
    kernel: HostKernel,
    state: Mutex<KernelState>,
}

struct KernelState {
    group_size: GroupSize,
    args: Vec<Option<ArgValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    Device,
    Host,
    Shared,
}

struct AllocationRecord {
    layout: Layout,
    context: ContextHandle,
    device: Option<DeviceHandle>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<usize, AllocationRecord>,
    used: HashMap<DeviceHandle, u64>,
}

struct Inner {
    initialized: AtomicBool,
    platforms: Vec<PlatformRecord>,
    devices: HashMap<DeviceHandle, DeviceRecord>,
    registry: HashMap<String, HostKernel>,
    next_handle: AtomicU64,
    contexts: DashMap<ContextHandle, ContextRecord>,
    queues: DashMap<CommandQueueHandle, QueueRecord>,
    lists: DashMap<CommandListHandle, Arc<ListObject>>,
    fences: DashMap<FenceHandle, FenceRecord>,
    modules: DashMap<ModuleHandle, ModuleRecord>,
    kernels: DashMap<KernelHandle, Arc<KernelObject>>,
    memory: Mutex<MemoryState>,
    faults: Mutex<HashMap<DriverOp, Fault>>,
    engine_stats: Arc<EngineStats>,
    allocations: AtomicU64,
    frees: AtomicU64,
    modules_built: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for queue in self.queues.iter() {
            let _ = queue.engine.synchronize(WAIT_INFINITE);
        }
        let memory = self.memory.get_mut();
        if !memory.records.is_empty() {
            warn!(
                count = memory.records.len(),
                "Host driver dropped with live allocations; releasing them"
            );
        }
        for (addr, record) in memory.records.drain() {
            // SAFETY: `addr` was returned by `alloc_zeroed` with this layout and
            // has not been released.
            unsafe { std::alloc::dealloc(addr as *mut u8, record.layout) };
        }
    }
}

/// A host-emulated Level Zero driver
///
/// Cloning is cheap; clones share every object.
#[derive(Clone)]
pub struct HostDriver {
    inner: Arc<Inner>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDriver")
            .field("platforms", &self.inner.platforms.len())
            .field("devices", &self.inner.devices.len())
            .field("kernels", &self.inner.registry.len())
            .field("live", &self.live_objects())
            .finish()
    }
}

impl HostDriver {
    /// One platform with one GPU and no kernels
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a driver
    pub fn builder() -> HostDriverBuilder {
        HostDriverBuilder::default()
    }

    /// Fail the next call of `op` with `status`
    pub fn inject_fault(&self, op: DriverOp, status: ZeResult) {
        self.inject_fault_after(op, 0, status);
    }

    /// Let `skip` calls of `op` succeed, then fail the next one with `status`
    pub fn inject_fault_after(&self, op: DriverOp, skip: u32, status: ZeResult) {
        debug!(?op, skip, %status, "Fault armed");
        self.inner.faults.lock().insert(op, Fault { skip, status });
    }

    /// Disarm every pending fault
    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    /// Snapshot of the work counters
    pub fn stats(&self) -> HostDriverStats {
        let s = &self.inner.engine_stats;
        HostDriverStats {
            submissions: s.submissions.load(Ordering::Relaxed),
            immediate_commands: s.immediate_commands.load(Ordering::Relaxed),
            kernel_launches: s.kernel_launches.load(Ordering::Relaxed),
            copies: s.copies.load(Ordering::Relaxed),
            fills: s.fills.load(Ordering::Relaxed),
            bytes_copied: s.bytes_copied.load(Ordering::Relaxed),
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            frees: self.inner.frees.load(Ordering::Relaxed),
            modules_built: self.inner.modules_built.load(Ordering::Relaxed),
        }
    }

    /// Count of objects created and not yet destroyed
    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            contexts: self.inner.contexts.len(),
            command_queues: self.inner.queues.len(),
            command_lists: self.inner.lists.len(),
            fences: self.inner.fences.len(),
            modules: self.inner.modules.len(),
            kernels: self.inner.kernels.len(),
            allocations: self.inner.memory.lock().records.len(),
        }
    }

    /// Bytes currently allocated against `device`
    pub fn device_memory_used(&self, device: DeviceHandle) -> u64 {
        self.inner
            .memory
            .lock()
            .used
            .get(&device)
            .copied()
            .unwrap_or(0)
    }

    fn mint(&self) -> NonZeroU64 {
        NonZeroU64::MIN.saturating_add(self.inner.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn ready(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ZeResult::ErrorUninitialized)
        }
    }

    fn fault(&self, op: DriverOp) -> Result<()> {
        let mut faults = self.inner.faults.lock();
        let Some(fault) = faults.get_mut(&op) else {
            return Ok(());
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        let status = fault.status;
        faults.remove(&op);
        debug!(?op, %status, "Injected fault fired");
        Err(status)
    }

    fn enter(&self, op: DriverOp) -> Result<()> {
        self.ready()?;
        self.fault(op)
    }

    fn device(&self, device: DeviceHandle) -> Result<&DeviceRecord> {
        self.inner
            .devices
            .get(&device)
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn context_driver(&self, context: ContextHandle) -> Result<DriverHandle> {
        self.inner
            .contexts
            .get(&context)
            .map(|c| c.driver)
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    /// Check that `device` belongs to the driver instance of `context`
    fn context_device(&self, context: ContextHandle, device: DeviceHandle) -> Result<&DeviceRecord> {
        let driver = self.context_driver(context)?;
        let record = self.device(device)?;
        if record.driver != driver {
            return Err(ZeResult::ErrorInvalidArgument);
        }
        Ok(record)
    }

    fn list(&self, list: CommandListHandle) -> Result<Arc<ListObject>> {
        self.inner
            .lists
            .get(&list)
            .map(|l| Arc::clone(&l))
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn kernel(&self, kernel: KernelHandle) -> Result<Arc<KernelObject>> {
        self.inner
            .kernels
            .get(&kernel)
            .map(|k| Arc::clone(&k))
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn allocate(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
        device: Option<DeviceHandle>,
        kind: AllocKind,
    ) -> Result<*mut u8> {
        self.enter(DriverOp::MemAlloc)?;
        let driver = self.context_driver(context)?;
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        if !alignment.is_power_of_two() {
            return Err(ZeResult::ErrorUnsupportedAlignment);
        }
        if size == 0 {
            return Err(ZeResult::ErrorUnsupportedSize);
        }

        let limits = match device {
            Some(handle) => {
                let record = self.device(handle)?;
                if record.driver != driver {
                    return Err(ZeResult::ErrorInvalidArgument);
                }
                if kind == AllocKind::Shared && !record.config.shared_alloc {
                    return Err(ZeResult::ErrorUnsupportedFeature);
                }
                if size as u64 > record.config.max_mem_alloc_size {
                    return Err(ZeResult::ErrorUnsupportedSize);
                }
                Some((handle, record.config.memory_size))
            }
            None => None,
        };

        let layout =
            Layout::from_size_align(size, alignment).map_err(|_| ZeResult::ErrorUnsupportedSize)?;

        let mut memory = self.inner.memory.lock();
        if let Some((handle, capacity)) = limits {
            let used = memory.used.get(&handle).copied().unwrap_or(0);
            if used.saturating_add(size as u64) > capacity {
                debug!(device = %handle, used, size, capacity, "Device memory exhausted");
                return Err(ZeResult::ErrorOutOfDeviceMemory);
            }
        }

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ZeResult::ErrorOutOfHostMemory);
        }

        if let Some((handle, _)) = limits {
            *memory.used.entry(handle).or_insert(0) += size as u64;
        }
        memory.records.insert(
            ptr as usize,
            AllocationRecord {
                layout,
                context,
                device: limits.map(|(h, _)| h),
            },
        );
        self.inner.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(?kind, size, alignment, ptr = ?ptr, "Allocated");
        Ok(ptr)
    }

    fn append(&self, list: CommandListHandle, command: Command) -> Result<()> {
        self.enter(DriverOp::CommandListAppend)?;
        let list = self.list(list)?;
        let mut state = list.state.lock();
        if list.immediate {
            self.inner
                .engine_stats
                .immediate_commands
                .fetch_add(1, Ordering::Relaxed);
            if !engine::execute(std::slice::from_ref(&command), &self.inner.engine_stats) {
                return Err(ZeResult::ErrorDeviceLost);
            }
            return Ok(());
        }
        if state.closed {
            return Err(ZeResult::ErrorInvalidArgument);
        }
        state.commands.push(command);
        Ok(())
    }
}

impl ZeDriver for HostDriver {
    fn init(&self) -> Result<()> {
        self.fault(DriverOp::Init)?;
        if !self.inner.initialized.swap(true, Ordering::AcqRel) {
            info!(
                platforms = self.inner.platforms.len(),
                devices = self.inner.devices.len(),
                kernels = self.inner.registry.len(),
                "Host driver initialized"
            );
        }
        Ok(())
    }

    fn driver_get(&self) -> Result<Vec<DriverHandle>> {
        self.enter(DriverOp::DriverGet)?;
        Ok(self.inner.platforms.iter().map(|p| p.handle).collect())
    }

    fn driver_get_properties(&self, driver: DriverHandle) -> Result<DriverProperties> {
        self.enter(DriverOp::DriverGet)?;
        let platform = self
            .inner
            .platforms
            .iter()
            .find(|p| p.handle == driver)
            .ok_or(ZeResult::ErrorInvalidNullHandle)?;
        Ok(DriverProperties {
            name: platform.name.clone(),
            driver_version: DRIVER_VERSION,
        })
    }

    fn device_get(&self, driver: DriverHandle) -> Result<Vec<DeviceHandle>> {
        self.enter(DriverOp::DeviceGet)?;
        self.inner
            .platforms
            .iter()
            .find(|p| p.handle == driver)
            .map(|p| p.devices.clone())
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn device_get_properties(&self, device: DeviceHandle) -> Result<DeviceProperties> {
        self.enter(DriverOp::DeviceGetProperties)?;
        let c = &self.device(device)?.config;
        Ok(DeviceProperties {
            name: c.name.clone(),
            device_type: c.device_type,
            vendor_id: c.vendor_id,
            device_id: c.device_id,
            core_clock_rate: c.core_clock_mhz,
            max_mem_alloc_size: c.max_mem_alloc_size,
            num_threads_per_eu: c.threads_per_eu,
            num_eus_per_subslice: c.eus_per_subslice,
            num_subslices_per_slice: c.subslices_per_slice,
            num_slices: c.slices,
            integrated: c.integrated,
        })
    }

    fn device_get_compute_properties(&self, device: DeviceHandle) -> Result<ComputeProperties> {
        self.enter(DriverOp::DeviceGetProperties)?;
        let c = &self.device(device)?.config;
        Ok(ComputeProperties {
            max_total_group_size: c.max_total_group_size,
            max_group_size: c.max_group_size,
            max_group_count: c.max_group_count,
            max_shared_local_memory: c.shared_local_memory,
            sub_group_sizes: c.sub_group_sizes.clone(),
        })
    }

    fn device_get_memory_properties(&self, device: DeviceHandle) -> Result<Vec<MemoryProperties>> {
        self.enter(DriverOp::DeviceGetProperties)?;
        let c = &self.device(device)?.config;
        Ok(vec![MemoryProperties {
            name: "HBM".to_string(),
            total_size: c.memory_size,
            max_clock_rate: c.core_clock_mhz,
            max_bus_width: 64,
        }])
    }

    fn device_get_memory_access_properties(
        &self,
        device: DeviceHandle,
    ) -> Result<MemoryAccessProperties> {
        self.enter(DriverOp::DeviceGetProperties)?;
        let c = &self.device(device)?.config;
        Ok(MemoryAccessProperties {
            host_alloc: true,
            device_alloc: true,
            shared_single_device_alloc: c.shared_alloc,
        })
    }

    fn context_create(&self, driver: DriverHandle) -> Result<ContextHandle> {
        self.enter(DriverOp::ContextCreate)?;
        if !self.inner.platforms.iter().any(|p| p.handle == driver) {
            return Err(ZeResult::ErrorInvalidNullHandle);
        }
        let handle = ContextHandle::from_nonzero(self.mint());
        self.inner.contexts.insert(handle, ContextRecord { driver });
        debug!(context = %handle, "Context created");
        Ok(handle)
    }

    fn context_destroy(&self, context: ContextHandle) -> Result<()> {
        self.enter(DriverOp::ContextDestroy)?;
        if !self.inner.contexts.contains_key(&context) {
            return Err(ZeResult::ErrorInvalidNullHandle);
        }
        let in_use = self.inner.queues.iter().any(|q| q.context == context)
            || self.inner.lists.iter().any(|l| l.context == context)
            || self.inner.modules.iter().any(|m| m.context == context)
            || self
                .inner
                .memory
                .lock()
                .records
                .values()
                .any(|r| r.context == context);
        if in_use {
            warn!(context = %context, "Context destroyed while objects remain");
            return Err(ZeResult::ErrorHandleObjectInUse);
        }
        self.inner.contexts.remove(&context);
        debug!(context = %context, "Context destroyed");
        Ok(())
    }

    fn mem_alloc_device(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
        device: DeviceHandle,
    ) -> Result<*mut u8> {
        self.allocate(context, size, alignment, Some(device), AllocKind::Device)
    }

    fn mem_alloc_host(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8> {
        self.allocate(context, size, alignment, None, AllocKind::Host)
    }

    fn mem_alloc_shared(
        &self,
        context: ContextHandle,
        size: usize,
        alignment: usize,
        device: DeviceHandle,
    ) -> Result<*mut u8> {
        self.allocate(context, size, alignment, Some(device), AllocKind::Shared)
    }

    fn mem_free(&self, context: ContextHandle, ptr: *mut u8) -> Result<()> {
        self.enter(DriverOp::MemFree)?;
        if ptr.is_null() {
            return Err(ZeResult::ErrorInvalidNullPointer);
        }
        let mut memory = self.inner.memory.lock();
        match memory.records.get(&(ptr as usize)) {
            Some(record) if record.context == context => {}
            _ => return Err(ZeResult::ErrorInvalidArgument),
        }
        let Some(record) = memory.records.remove(&(ptr as usize)) else {
            return Err(ZeResult::ErrorInvalidArgument);
        };
        if let Some(device) = record.device
            && let Some(used) = memory.used.get_mut(&device)
        {
            *used = used.saturating_sub(record.layout.size() as u64);
        }
        // SAFETY: the record proves `ptr` came from `alloc_zeroed` with `layout`.
        unsafe { std::alloc::dealloc(ptr, record.layout) };
        self.inner.frees.fetch_add(1, Ordering::Relaxed);
        trace!(ptr = ?ptr, size = record.layout.size(), "Freed");
        Ok(())
    }

    fn command_queue_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> Result<CommandQueueHandle> {
        self.enter(DriverOp::CommandQueueCreate)?;
        self.context_device(context, device)?;
        let handle = CommandQueueHandle::from_nonzero(self.mint());
        let engine = HostQueue::spawn(
            format!("ze-queue-{:x}", handle.raw()),
            Arc::clone(&self.inner.engine_stats),
        )
        .map_err(|e| {
            warn!(error = %e, "Failed to spawn queue worker");
            ZeResult::ErrorOutOfHostMemory
        })?;
        self.inner.queues.insert(
            handle,
            QueueRecord {
                context,
                device,
                mode: desc.mode,
                engine: Arc::new(engine),
            },
        );
        debug!(queue = %handle, device = %device, mode = ?desc.mode, "Command queue created");
        Ok(handle)
    }

    fn command_queue_destroy(&self, queue: CommandQueueHandle) -> Result<()> {
        self.enter(DriverOp::CommandQueueDestroy)?;
        if !self.inner.queues.contains_key(&queue) {
            return Err(ZeResult::ErrorInvalidNullHandle);
        }
        if self.inner.fences.iter().any(|f| f.queue == queue) {
            return Err(ZeResult::ErrorHandleObjectInUse);
        }
        // The worker drains remaining jobs when the engine drops.
        self.inner.queues.remove(&queue);
        debug!(queue = %queue, "Command queue destroyed");
        Ok(())
    }

    fn command_queue_execute_command_lists(
        &self,
        queue: CommandQueueHandle,
        lists: &[CommandListHandle],
        fence: Option<FenceHandle>,
    ) -> Result<()> {
        self.enter(DriverOp::CommandQueueExecute)?;
        let (engine, device, mode) = {
            let record = self
                .inner
                .queues
                .get(&queue)
                .ok_or(ZeResult::ErrorInvalidNullHandle)?;
            (Arc::clone(&record.engine), record.device, record.mode)
        };

        let mut snapshots = Vec::with_capacity(lists.len());
        for &handle in lists {
            let list = self.list(handle)?;
            if list.immediate {
                return Err(ZeResult::ErrorInvalidCommandListType);
            }
            if list.device != device {
                return Err(ZeResult::ErrorInvalidArgument);
            }
            let state = list.state.lock();
            if !state.closed {
                return Err(ZeResult::ErrorInvalidArgument);
            }
            snapshots.push(Arc::new(state.commands.clone()));
        }

        let fence = match fence {
            Some(handle) => {
                let record = self
                    .inner
                    .fences
                    .get(&handle)
                    .ok_or(ZeResult::ErrorInvalidNullHandle)?;
                if record.queue != queue || record.fence.status().is_success() {
                    return Err(ZeResult::ErrorInvalidSynchronizationObject);
                }
                Some(Arc::clone(&record.fence))
            }
            None => None,
        };

        self.inner
            .engine_stats
            .submissions
            .fetch_add(1, Ordering::Relaxed);
        trace!(queue = %queue, lists = lists.len(), "Executing command lists");
        engine.submit(snapshots, fence).into_result()?;
        if mode == CommandQueueMode::Synchronous {
            engine.synchronize(WAIT_INFINITE).into_result()?;
        }
        Ok(())
    }

    fn command_queue_synchronize(&self, queue: CommandQueueHandle, timeout_ns: u64) -> ZeResult {
        if let Err(status) = self.enter(DriverOp::CommandQueueSynchronize) {
            return status;
        }
        let engine = match self.inner.queues.get(&queue) {
            Some(record) => Arc::clone(&record.engine),
            None => return ZeResult::ErrorInvalidNullHandle,
        };
        engine.synchronize(timeout_ns)
    }

    fn command_list_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
    ) -> Result<CommandListHandle> {
        self.enter(DriverOp::CommandListCreate)?;
        self.context_device(context, device)?;
        let handle = CommandListHandle::from_nonzero(self.mint());
        self.inner.lists.insert(
            handle,
            Arc::new(ListObject {
                context,
                device,
                immediate: false,
                state: Mutex::new(ListState::default()),
            }),
        );
        trace!(list = %handle, "Command list created");
        Ok(handle)
    }

    fn command_list_create_immediate(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> Result<CommandListHandle> {
        self.enter(DriverOp::CommandListCreate)?;
        self.context_device(context, device)?;
        let handle = CommandListHandle::from_nonzero(self.mint());
        self.inner.lists.insert(
            handle,
            Arc::new(ListObject {
                context,
                device,
                immediate: true,
                state: Mutex::new(ListState::default()),
            }),
        );
        debug!(list = %handle, mode = ?desc.mode, "Immediate command list created");
        Ok(handle)
    }

    fn command_list_destroy(&self, list: CommandListHandle) -> Result<()> {
        self.enter(DriverOp::CommandListDestroy)?;
        self.inner
            .lists
            .remove(&list)
            .map(|_| ())
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn command_list_close(&self, list: CommandListHandle) -> Result<()> {
        self.enter(DriverOp::CommandListClose)?;
        let list = self.list(list)?;
        if !list.immediate {
            list.state.lock().closed = true;
        }
        Ok(())
    }

    fn command_list_reset(&self, list: CommandListHandle) -> Result<()> {
        self.enter(DriverOp::CommandListReset)?;
        let list = self.list(list)?;
        let mut state = list.state.lock();
        state.commands.clear();
        state.closed = false;
        Ok(())
    }

    unsafe fn command_list_append_memory_copy(
        &self,
        list: CommandListHandle,
        dst: *mut u8,
        src: *const u8,
        size: usize,
    ) -> Result<()> {
        if size > 0 && (dst.is_null() || src.is_null()) {
            return Err(ZeResult::ErrorInvalidNullPointer);
        }
        self.append(
            list,
            Command::Copy {
                dst: dst as usize,
                src: src as usize,
                size,
            },
        )
    }

    unsafe fn command_list_append_memory_fill(
        &self,
        list: CommandListHandle,
        dst: *mut u8,
        pattern: &[u8],
        size: usize,
    ) -> Result<()> {
        if !pattern.len().is_power_of_two() {
            return Err(ZeResult::ErrorInvalidSize);
        }
        if size > 0 && dst.is_null() {
            return Err(ZeResult::ErrorInvalidNullPointer);
        }
        self.append(
            list,
            Command::Fill {
                dst: dst as usize,
                pattern: pattern.to_vec(),
                size,
            },
        )
    }

    fn command_list_append_barrier(&self, list: CommandListHandle) -> Result<()> {
        self.append(list, Command::Barrier)
    }

    fn command_list_append_launch_kernel(
        &self,
        list: CommandListHandle,
        kernel: KernelHandle,
        group_count: GroupCount,
    ) -> Result<()> {
        let object = self.kernel(kernel)?;
        let list_device = self.list(list)?.device;
        if object.device != list_device {
            return Err(ZeResult::ErrorInvalidArgument);
        }
        let config = &self.device(object.device)?.config;
        let within = [group_count.x, group_count.y, group_count.z]
            .iter()
            .zip(config.max_group_count.iter())
            .all(|(n, max)| n <= max);
        if !within {
            return Err(ZeResult::ErrorInvalidArgument);
        }

        let (group_size, args) = {
            let state = object.state.lock();
            let args: Option<Vec<ArgValue>> = state.args.iter().cloned().collect();
            let Some(args) = args else {
                debug!(kernel = object.kernel.name(), "Launch with unset arguments");
                return Err(ZeResult::ErrorInvalidArgument);
            };
            (state.group_size, args)
        };
        let local: usize = args
            .iter()
            .map(|a| match a {
                ArgValue::Local(n) => *n,
                ArgValue::Bytes(_) => 0,
            })
            .sum();
        if local > config.shared_local_memory as usize {
            return Err(ZeResult::ErrorInvalidKernelArgumentSize);
        }

        self.append(
            list,
            Command::Launch(Launch {
                kernel: object.kernel.name().to_string(),
                func: object.kernel.func(),
                group_size,
                group_count,
                args: Arc::new(KernelArgs::new(args)),
            }),
        )
    }

    fn fence_create(&self, queue: CommandQueueHandle) -> Result<FenceHandle> {
        self.enter(DriverOp::FenceCreate)?;
        if !self.inner.queues.contains_key(&queue) {
            return Err(ZeResult::ErrorInvalidNullHandle);
        }
        let handle = FenceHandle::from_nonzero(self.mint());
        self.inner.fences.insert(
            handle,
            FenceRecord {
                queue,
                fence: Arc::new(HostFence::default()),
            },
        );
        trace!(fence = %handle, queue = %queue, "Fence created");
        Ok(handle)
    }

    fn fence_destroy(&self, fence: FenceHandle) -> Result<()> {
        self.enter(DriverOp::FenceDestroy)?;
        self.inner
            .fences
            .remove(&fence)
            .map(|_| ())
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn fence_host_synchronize(&self, fence: FenceHandle, timeout_ns: u64) -> ZeResult {
        if let Err(status) = self.enter(DriverOp::FenceSynchronize) {
            return status;
        }
        let fence = match self.inner.fences.get(&fence) {
            Some(record) => Arc::clone(&record.fence),
            None => return ZeResult::ErrorInvalidNullHandle,
        };
        fence.wait(timeout_ns)
    }

    fn fence_query_status(&self, fence: FenceHandle) -> ZeResult {
        if let Err(status) = self.enter(DriverOp::FenceSynchronize) {
            return status;
        }
        match self.inner.fences.get(&fence) {
            Some(record) => record.fence.status(),
            None => ZeResult::ErrorInvalidNullHandle,
        }
    }

    fn fence_reset(&self, fence: FenceHandle) -> Result<()> {
        self.ready()?;
        let record = self
            .inner
            .fences
            .get(&fence)
            .ok_or(ZeResult::ErrorInvalidNullHandle)?;
        record.fence.reset();
        Ok(())
    }

    fn module_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ModuleDesc<'_>,
        build_log: &mut String,
    ) -> Result<ModuleHandle> {
        self.enter(DriverOp::ModuleCreate)?;
        self.context_device(context, device)?;

        let names = match parse_module(desc.input) {
            Ok(names) => names,
            Err(ParseError::BadMagic) => {
                build_log.push_str("error: input is not a host module (missing '");
                build_log.push_str(MODULE_MAGIC);
                build_log.push_str("' header)\n");
                return Err(match desc.format {
                    ModuleFormat::Native => ZeResult::ErrorInvalidNativeBinary,
                    ModuleFormat::IlSpirv => ZeResult::ErrorModuleBuildFailure,
                });
            }
            Err(ParseError::Malformed(msg)) => {
                build_log.push_str("error: ");
                build_log.push_str(&msg);
                build_log.push('\n');
                return Err(ZeResult::ErrorModuleBuildFailure);
            }
        };

        let unresolved: Vec<&String> = names
            .iter()
            .filter(|n| !self.inner.registry.contains_key(n.as_str()))
            .collect();
        if !unresolved.is_empty() {
            for name in unresolved {
                build_log.push_str(&format!("error: unresolved kernel symbol '{name}'\n"));
            }
            return Err(ZeResult::ErrorModuleBuildFailure);
        }

        let handle = ModuleHandle::from_nonzero(self.mint());
        debug!(
            module = %handle,
            device = %device,
            kernels = names.len(),
            flags = desc.build_flags,
            "Module built"
        );
        self.inner.modules.insert(
            handle,
            ModuleRecord {
                context,
                device,
                kernels: names,
            },
        );
        self.inner.modules_built.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn module_destroy(&self, module: ModuleHandle) -> Result<()> {
        self.enter(DriverOp::ModuleDestroy)?;
        if !self.inner.modules.contains_key(&module) {
            return Err(ZeResult::ErrorInvalidNullHandle);
        }
        if self.inner.kernels.iter().any(|k| k.module == module) {
            return Err(ZeResult::ErrorHandleObjectInUse);
        }
        self.inner.modules.remove(&module);
        debug!(module = %module, "Module destroyed");
        Ok(())
    }

    fn module_get_kernel_names(&self, module: ModuleHandle) -> Result<Vec<String>> {
        self.ready()?;
        self.inner
            .modules
            .get(&module)
            .map(|m| m.kernels.clone())
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn kernel_create(&self, module: ModuleHandle, name: &str) -> Result<KernelHandle> {
        self.enter(DriverOp::KernelCreate)?;
        let device = {
            let record = self
                .inner
                .modules
                .get(&module)
                .ok_or(ZeResult::ErrorInvalidNullHandle)?;
            if !record.kernels.iter().any(|k| k == name) {
                return Err(ZeResult::ErrorInvalidKernelName);
            }
            record.device
        };
        let kernel = self
            .inner
            .registry
            .get(name)
            .cloned()
            .ok_or(ZeResult::ErrorInvalidKernelName)?;
        let handle = KernelHandle::from_nonzero(self.mint());
        let args = vec![None; kernel.num_args() as usize];
        self.inner.kernels.insert(
            handle,
            Arc::new(KernelObject {
                module,
                device,
                kernel,
                state: Mutex::new(KernelState {
                    group_size: GroupSize::default(),
                    args,
                }),
            }),
        );
        trace!(kernel = %handle, name, "Kernel created");
        Ok(handle)
    }

    fn kernel_destroy(&self, kernel: KernelHandle) -> Result<()> {
        self.enter(DriverOp::KernelDestroy)?;
        self.inner
            .kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or(ZeResult::ErrorInvalidNullHandle)
    }

    fn kernel_set_group_size(&self, kernel: KernelHandle, size: GroupSize) -> Result<()> {
        self.enter(DriverOp::KernelSetGroupSize)?;
        let object = self.kernel(kernel)?;
        let config = &self.device(object.device)?.config;
        let dims = [size.x, size.y, size.z];
        let fits = dims
            .iter()
            .zip(config.max_group_size.iter())
            .all(|(d, max)| *d >= 1 && d <= max)
            && size.volume() <= config.max_total_group_size as u64;
        if !fits {
            return Err(ZeResult::ErrorInvalidGroupSizeDimension);
        }
        object.state.lock().group_size = size;
        Ok(())
    }

    fn kernel_set_argument_value(
        &self,
        kernel: KernelHandle,
        index: u32,
        size: usize,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.enter(DriverOp::KernelSetArgument)?;
        let object = self.kernel(kernel)?;
        let mut state = object.state.lock();
        let slot = state
            .args
            .get_mut(index as usize)
            .ok_or(ZeResult::ErrorInvalidKernelArgumentIndex)?;
        *slot = Some(match value {
            Some(bytes) => {
                if size == 0 || bytes.len() != size {
                    return Err(ZeResult::ErrorInvalidKernelArgumentSize);
                }
                ArgValue::Bytes(bytes.to_vec())
            }
            None => ArgValue::Local(size),
        });
        Ok(())
    }

    fn kernel_get_properties(&self, kernel: KernelHandle) -> Result<KernelProperties> {
        self.ready()?;
        let object = self.kernel(kernel)?;
        let group_size = object.state.lock().group_size;
        Ok(KernelProperties {
            num_args: object.kernel.num_args(),
            group_size,
        })
    }
}
