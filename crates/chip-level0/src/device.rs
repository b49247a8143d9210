//! Devices and their cached properties

use std::sync::{Arc, Weak};

use chip_ze::{DeviceHandle, DeviceType, DriverHandle, ZeDriver};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::blob::KernelBlob;
use crate::context::Level0Context;
use crate::error::{Error, Result};
use crate::memory::MemoryKind;
use crate::module::Level0Module;
use crate::queue::Level0Queue;
use crate::result::LzResultExt;

const DEFAULT_WARP_SIZE: u32 = 32;

/// Portable view of a device's capabilities, queried once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Device name
    pub name: String,
    /// Device class
    pub device_type: DeviceType,
    /// PCI vendor id
    pub vendor_id: u32,
    /// PCI device id
    pub device_id: u32,
    /// Name of the platform exposing the device
    pub platform_name: String,
    /// Sum of all memory regions in bytes
    pub total_global_mem: u64,
    /// Largest single allocation in bytes
    pub max_alloc_size: u64,
    /// Largest work-group size
    pub max_threads_per_block: u32,
    /// Per-dimension work-group limits
    pub max_block_dims: [u32; 3],
    /// Per-dimension work-group count limits
    pub max_grid_dims: [u32; 3],
    /// Largest sub-group size
    pub warp_size: u32,
    /// Core clock in kHz
    pub clock_rate_khz: u32,
    /// Slices × subslices × EUs per subslice
    pub multiprocessor_count: u32,
    /// Shared local memory per work-group in bytes
    pub shared_mem_per_block: u32,
    /// Host allocations supported
    pub host_alloc: bool,
    /// Device allocations supported
    pub device_alloc: bool,
    /// Shared allocations supported
    pub shared_alloc: bool,
    /// Shares memory with the host
    pub integrated: bool,
}

impl DeviceProperties {
    /// `true` if the device can serve allocations of `kind`
    pub fn supports(&self, kind: MemoryKind) -> bool {
        match kind {
            MemoryKind::Device => self.device_alloc,
            MemoryKind::Host => self.host_alloc,
            MemoryKind::Shared => self.shared_alloc,
        }
    }
}

/// Query every native property block of `device` and fold them into one
pub fn populate_device_properties(
    driver: &dyn ZeDriver,
    platform: DriverHandle,
    device: DeviceHandle,
) -> Result<DeviceProperties> {
    let platform_props = driver
        .driver_get_properties(platform)
        .lz_context("zeDriverGetProperties")?;
    let props = driver
        .device_get_properties(device)
        .lz_context("zeDeviceGetProperties")?;
    let compute = driver
        .device_get_compute_properties(device)
        .lz_context("zeDeviceGetComputeProperties")?;
    let memory = driver
        .device_get_memory_properties(device)
        .lz_context("zeDeviceGetMemoryProperties")?;
    let access = driver
        .device_get_memory_access_properties(device)
        .lz_context("zeDeviceGetMemoryAccessProperties")?;

    let properties = DeviceProperties {
        total_global_mem: memory.iter().map(|m| m.total_size).sum(),
        max_alloc_size: props.max_mem_alloc_size,
        max_threads_per_block: compute.max_total_group_size,
        max_block_dims: compute.max_group_size,
        max_grid_dims: compute.max_group_count,
        warp_size: compute
            .sub_group_sizes
            .iter()
            .copied()
            .max()
            .unwrap_or(DEFAULT_WARP_SIZE),
        clock_rate_khz: props.core_clock_rate.saturating_mul(1000),
        multiprocessor_count: props
            .num_slices
            .saturating_mul(props.num_subslices_per_slice)
            .saturating_mul(props.num_eus_per_subslice),
        shared_mem_per_block: compute.max_shared_local_memory,
        host_alloc: access.host_alloc,
        device_alloc: access.device_alloc,
        shared_alloc: access.shared_single_device_alloc,
        integrated: props.integrated,
        vendor_id: props.vendor_id,
        device_id: props.device_id,
        device_type: props.device_type,
        platform_name: platform_props.name,
        name: props.name,
    };
    debug!(
        device = %device,
        name = %properties.name,
        memory = properties.total_global_mem,
        compute_units = properties.multiprocessor_count,
        "Device properties cached"
    );
    Ok(properties)
}

/// One device, its modules and the queues created on it
pub struct Level0Device {
    driver: Arc<dyn ZeDriver>,
    handle: DeviceHandle,
    index: usize,
    properties: DeviceProperties,
    context: Weak<Level0Context>,
    modules: RwLock<Vec<Arc<Level0Module>>>,
    queues: Mutex<Vec<Weak<Level0Queue>>>,
}

impl Level0Device {
    /// Wrap `handle`; the context is owned by the backend
    pub fn new(
        driver: Arc<dyn ZeDriver>,
        handle: DeviceHandle,
        index: usize,
        properties: DeviceProperties,
        context: &Arc<Level0Context>,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            handle,
            index,
            properties,
            context: Arc::downgrade(context),
            modules: RwLock::new(Vec::new()),
            queues: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Position in the backend's device list
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Owning context; fails once the backend has torn it down
    pub fn context(&self) -> Result<Arc<Level0Context>> {
        self.context
            .upgrade()
            .filter(|ctx| !ctx.is_destroyed())
            .ok_or(Error::InvalidContext)
    }

    /// Register a kernel blob with this device
    ///
    /// The module is compiled lazily through [`Level0Module::compile`].
    pub fn add_module(&self, blob: Arc<KernelBlob>) -> Arc<Level0Module> {
        let module = Arc::new(Level0Module::new(Arc::clone(&self.driver), blob));
        self.modules.write().push(Arc::clone(&module));
        debug!(device = %self.handle, "Module added");
        module
    }

    /// Snapshot of the registered modules
    pub fn modules(&self) -> Vec<Arc<Level0Module>> {
        self.modules.read().clone()
    }

    /// Create a queue bound to this device and its context
    pub fn create_queue(self: &Arc<Self>) -> Result<Arc<Level0Queue>> {
        let context = self.context()?;
        let queue = Level0Queue::create(Arc::clone(&self.driver), context, Arc::clone(self))?;
        let mut queues = self.queues.lock();
        queues.retain(|q| q.strong_count() > 0);
        queues.push(Arc::downgrade(&queue));
        Ok(queue)
    }

    /// Queues created on this device that are still alive
    pub fn live_queues(&self) -> Vec<Arc<Level0Queue>> {
        self.queues.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Release this device's compiled state in every module
    ///
    /// Continues past failures and returns the first one.
    pub(crate) fn release_modules(&self) -> Result<()> {
        let mut first_error = None;
        for module in self.modules.read().iter() {
            if let Err(e) = module.release(self) {
                warn!(device = %self.handle, error = %e, "Module release failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Return the device to its freshly initialised state
    ///
    /// Drains live queues, drops every module and frees all outstanding
    /// allocations. A queue that faulted gets a fresh native queue. The
    /// device handle, the context and the queues stay valid.
    pub fn reset(&self) -> Result<()> {
        let mut first_error = None;
        for queue in self.live_queues() {
            match queue.finish() {
                Ok(()) | Err(Error::Destroyed(_)) => {}
                Err(e) => {
                    warn!(
                        device = %self.handle,
                        queue = %queue.handle(),
                        error = %e,
                        "Recreating faulted queue"
                    );
                    if let Err(e) = queue.reset() {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        if let Err(e) = self.release_modules() {
            first_error.get_or_insert(e);
        }
        self.modules.write().clear();
        match self.context().and_then(|ctx| ctx.free_all()) {
            Ok(freed) => info!(device = %self.handle, freed, "Device reset"),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Level0Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level0Device")
            .field("handle", &self.handle)
            .field("index", &self.index)
            .field("name", &self.properties.name)
            .field("modules", &self.modules.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chip_ze::{HostDeviceConfig, HostDriver};

    fn first_device(driver: &HostDriver) -> (DriverHandle, DeviceHandle) {
        driver.init().unwrap();
        let platform = driver.driver_get().unwrap()[0];
        let device = driver.device_get(platform).unwrap()[0];
        (platform, device)
    }

    #[test]
    fn test_populate_properties() {
        let driver = HostDriver::builder()
            .platform("Test Platform")
            .device(HostDeviceConfig::gpu("Test GPU").with_shared_alloc(false))
            .build();
        let (platform, device) = first_device(&driver);
        let props = populate_device_properties(&driver, platform, device).unwrap();

        assert_eq!(props.name, "Test GPU");
        assert_eq!(props.platform_name, "Test Platform");
        assert_eq!(props.device_type, DeviceType::Gpu);
        assert_eq!(props.warp_size, 32);
        assert_eq!(props.clock_rate_khz, 1_200_000);
        assert_eq!(props.multiprocessor_count, 64);
        assert!(props.supports(MemoryKind::Device));
        assert!(!props.supports(MemoryKind::Shared));
    }

    #[test]
    fn test_properties_require_init() {
        let driver = HostDriver::new();
        let platform = DriverHandle::from_raw(1).unwrap();
        let device = DeviceHandle::from_raw(1).unwrap();
        let err = populate_device_properties(&driver, platform, device).unwrap_err();
        assert_eq!(err.native_status(), Some(chip_ze::ZeResult::ErrorUninitialized));
    }
}
