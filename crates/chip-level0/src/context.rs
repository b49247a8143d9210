//! Contexts: the allocator root of a device
//!
//! A context owns the native context handle, one immediate synchronous
//! command list used for host-blocking copies and fills, and the table of
//! outstanding allocations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chip_ze::{
    CommandListHandle, CommandQueueDesc, CommandQueueMode, ContextHandle, DeviceHandle,
    DriverHandle, ZeDriver, ZeResult,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::device::DeviceProperties;
use crate::error::{Error, Result};
use crate::memory::{AllocationInfo, AllocationTable, DevicePtr, MemoryKind};
use crate::result::LzResultExt;

/// Native context plus allocation bookkeeping
pub struct Level0Context {
    driver: Arc<dyn ZeDriver>,
    handle: ContextHandle,
    device: DeviceHandle,
    max_alloc_size: u64,
    supported: [bool; 3],
    cmd_list: Mutex<Option<CommandListHandle>>,
    allocations: Mutex<AllocationTable>,
    destroyed: AtomicBool,
}

fn kind_index(kind: MemoryKind) -> usize {
    match kind {
        MemoryKind::Device => 0,
        MemoryKind::Host => 1,
        MemoryKind::Shared => 2,
    }
}

impl Level0Context {
    /// Create a context on `platform` for `device`
    pub fn create(
        driver: Arc<dyn ZeDriver>,
        platform: DriverHandle,
        device: DeviceHandle,
        properties: &DeviceProperties,
    ) -> Result<Arc<Self>> {
        let handle = driver.context_create(platform).lz_context("zeContextCreate")?;
        let desc = CommandQueueDesc {
            mode: CommandQueueMode::Synchronous,
            ..CommandQueueDesc::default()
        };
        let cmd_list = match driver.command_list_create_immediate(handle, device, &desc) {
            Ok(list) => list,
            Err(status) => {
                if let Err(e) = driver.context_destroy(handle) {
                    warn!(context = %handle, status = %e, "Context cleanup failed");
                }
                return Err(status).lz_context("zeCommandListCreateImmediate");
            }
        };
        debug!(context = %handle, device = %device, "Context created");

        let mut supported = [false; 3];
        for kind in [MemoryKind::Device, MemoryKind::Host, MemoryKind::Shared] {
            supported[kind_index(kind)] = properties.supports(kind);
        }
        Ok(Arc::new(Self {
            driver,
            handle,
            device,
            max_alloc_size: properties.max_alloc_size,
            supported,
            cmd_list: Mutex::new(Some(cmd_list)),
            allocations: Mutex::new(AllocationTable::default()),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Native context handle
    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Device the context allocates for
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(Error::InvalidContext)
        } else {
            Ok(())
        }
    }

    /// Allocate `size` bytes of `kind` memory
    ///
    /// `alignment` of 0 selects the driver default; otherwise it must be a
    /// power of two.
    pub fn allocate(&self, size: usize, alignment: usize, kind: MemoryKind) -> Result<DevicePtr> {
        if size == 0 {
            return Err(Error::invalid_value("zero-size allocation"));
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(Error::invalid_value(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        if !self.supported[kind_index(kind)] {
            return Err(Error::UnsupportedMemoryKind(kind));
        }
        if size as u64 > self.max_alloc_size {
            debug!(size, limit = self.max_alloc_size, "Allocation above device limit");
            return Err(Error::out_of_memory(size, kind));
        }
        self.check_live()?;

        let native = match kind {
            MemoryKind::Device => {
                self.driver
                    .mem_alloc_device(self.handle, size, alignment, self.device)
            }
            MemoryKind::Host => self.driver.mem_alloc_host(self.handle, size, alignment),
            MemoryKind::Shared => {
                self.driver
                    .mem_alloc_shared(self.handle, size, alignment, self.device)
            }
        };
        let raw = match native {
            Ok(raw) => raw,
            Err(ZeResult::ErrorOutOfDeviceMemory | ZeResult::ErrorOutOfHostMemory) => {
                return Err(Error::out_of_memory(size, kind));
            }
            Err(status) => return Err(status).lz_context("zeMemAlloc"),
        };

        let Some(ptr) = DevicePtr::from_ptr(raw) else {
            return Err(Error::driver(ZeResult::ErrorUnknown, "zeMemAlloc returned null"));
        };
        if !ptr.is_aligned_to(alignment) {
            if let Err(status) = self.driver.mem_free(self.handle, raw) {
                warn!(ptr = %ptr, %status, "Failed to release misaligned allocation");
            }
            return Err(Error::driver(
                ZeResult::ErrorUnsupportedAlignment,
                format!("zeMemAlloc returned {ptr}, not aligned to {alignment}"),
            ));
        }

        self.allocations.lock().insert(AllocationInfo {
            ptr,
            size,
            alignment,
            kind,
        });
        debug!(ptr = %ptr, size, alignment, %kind, "Allocated");
        Ok(ptr)
    }

    /// Release an allocation
    ///
    /// Addresses released earlier fail with [`Error::DoubleFree`], unknown
    /// ones with [`Error::InvalidDevicePointer`].
    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        let addr = ptr.addr();
        let mut table = self.allocations.lock();
        if table.get(addr).is_none() {
            if table.was_released(addr) {
                warn!(ptr = %ptr, "Double free");
                return Err(Error::DoubleFree(addr));
            }
            warn!(ptr = %ptr, "Free of a pointer this context did not allocate");
            return Err(Error::InvalidDevicePointer(addr));
        }
        self.check_live()?;
        self.driver
            .mem_free(self.handle, ptr.as_ptr())
            .lz_context("zeMemFree")?;
        table.release(addr);
        debug!(ptr = %ptr, "Freed");
        Ok(())
    }

    /// Allocation containing `ptr`, which may point inside it
    pub fn allocation(&self, ptr: DevicePtr) -> Option<AllocationInfo> {
        self.allocations.lock().find(ptr.addr()).copied()
    }

    pub fn outstanding_allocations(&self) -> usize {
        self.allocations.lock().len()
    }

    /// Bytes held by outstanding allocations
    pub fn allocated_bytes(&self) -> usize {
        self.allocations.lock().bytes()
    }

    /// Release every outstanding allocation
    ///
    /// Continues past failures and returns the first one; on success returns
    /// the number of allocations released.
    pub fn free_all(&self) -> Result<usize> {
        let mut table = self.allocations.lock();
        let mut first_error = None;
        let mut released = 0;
        for addr in table.addresses() {
            match self
                .driver
                .mem_free(self.handle, addr as *mut u8)
                .lz_context("zeMemFree")
            {
                Ok(()) => {
                    table.release(addr);
                    released += 1;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if released > 0 {
            debug!(context = %self.handle, released, "Released outstanding allocations");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Copy through the context's immediate list; returns once complete
    ///
    /// # Safety
    /// `src` must be readable and `dst` writable for `size` bytes.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<()> {
        let list = self.cmd_list.lock();
        let list = (*list).ok_or(Error::InvalidContext)?;
        // SAFETY: forwarded from the caller; immediate lists execute before returning.
        unsafe { self.driver.command_list_append_memory_copy(list, dst, src, size) }
            .lz_context("zeCommandListAppendMemoryCopy")
    }

    /// Fill through the context's immediate list; returns once complete
    ///
    /// # Safety
    /// `dst` must be writable for `size` bytes.
    pub unsafe fn fill(&self, dst: *mut u8, pattern: &[u8], size: usize) -> Result<()> {
        let list = self.cmd_list.lock();
        let list = (*list).ok_or(Error::InvalidContext)?;
        // SAFETY: forwarded from the caller.
        unsafe { self.driver.command_list_append_memory_fill(list, dst, pattern, size) }
            .lz_context("zeCommandListAppendMemoryFill")
    }

    /// Release allocations, the immediate list and the native context
    ///
    /// Queues and modules using the context must be destroyed first.
    /// Repeated calls are no-ops.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut first_error = self.free_all().err();

        // Hold the list lock so in-flight copies finish first.
        let mut list = self.cmd_list.lock();
        self.destroyed.store(true, Ordering::Release);
        if let Some(handle) = list.take()
            && let Err(e) = self
                .driver
                .command_list_destroy(handle)
                .lz_context("zeCommandListDestroy")
        {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self
            .driver
            .context_destroy(self.handle)
            .lz_context("zeContextDestroy")
        {
            error!(context = %self.handle, error = %e, "Context teardown incomplete");
            first_error.get_or_insert(e);
        }
        info!(context = %self.handle, "Context destroyed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Level0Context {
    fn drop(&mut self) {
        if !self.is_destroyed()
            && let Err(e) = self.destroy()
        {
            warn!(error = %e, "Context dropped with teardown errors");
        }
    }
}

impl std::fmt::Debug for Level0Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level0Context")
            .field("handle", &self.handle)
            .field("device", &self.device)
            .field("outstanding", &self.outstanding_allocations())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
