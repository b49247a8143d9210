//! Modules: a kernel blob compiled per device

use std::collections::HashMap;
use std::sync::Arc;

use chip_ze::{DeviceHandle, KernelHandle, ModuleDesc, ModuleHandle, ZeDriver, ZeResult};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::blob::KernelBlob;
use crate::device::Level0Device;
use crate::error::{Error, Result};
use crate::kernel::Level0Kernel;
use crate::result::LzResultExt;

struct CompiledModule {
    handle: ModuleHandle,
    kernels: Vec<Arc<Level0Kernel>>,
}

/// A kernel blob and the native modules built from it
pub struct Level0Module {
    driver: Arc<dyn ZeDriver>,
    blob: Arc<KernelBlob>,
    compiled: RwLock<HashMap<DeviceHandle, CompiledModule>>,
}

impl Level0Module {
    pub(crate) fn new(driver: Arc<dyn ZeDriver>, blob: Arc<KernelBlob>) -> Self {
        Self {
            driver,
            blob,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn blob(&self) -> &Arc<KernelBlob> {
        &self.blob
    }

    /// Build the blob for `device` and create one kernel per entry point
    ///
    /// A second call for the same device does nothing. On failure nothing
    /// created by this call survives.
    pub fn compile(&self, device: &Level0Device) -> Result<()> {
        let mut compiled = self.compiled.write();
        if compiled.contains_key(&device.handle()) {
            debug!(device = %device.handle(), "Module already compiled");
            return Ok(());
        }
        let context = device.context()?;

        let desc = ModuleDesc {
            format: self.blob.format(),
            input: self.blob.binary(),
            build_flags: self.blob.build_flags(),
        };
        let mut log = String::new();
        let handle = self
            .driver
            .module_create(context.handle(), device.handle(), &desc, &mut log)
            .map_err(|status| {
                warn!(device = %device.handle(), %status, log = %log, "Module build failed");
                Error::Compile { status, log: log.clone() }
            })?;

        match self.create_kernels(handle, device.handle()) {
            Ok(kernels) => {
                info!(
                    device = %device.handle(),
                    module = %handle,
                    kernels = kernels.len(),
                    "Module compiled"
                );
                compiled.insert(device.handle(), CompiledModule { handle, kernels });
                Ok(())
            }
            Err(e) => {
                if let Err(status) = self.driver.module_destroy(handle) {
                    warn!(module = %handle, %status, "Module rollback failed");
                }
                Err(e)
            }
        }
    }

    fn create_kernels(
        &self,
        module: ModuleHandle,
        device: DeviceHandle,
    ) -> Result<Vec<Arc<Level0Kernel>>> {
        let names = self
            .driver
            .module_get_kernel_names(module)
            .lz_context("zeModuleGetKernelNames")?;

        let mut kernels: Vec<Arc<Level0Kernel>> = Vec::with_capacity(names.len());
        for name in names {
            match self.create_kernel(module, device, name) {
                Ok(kernel) => kernels.push(kernel),
                Err(e) => {
                    self.destroy_kernels(kernels.iter().map(|k| k.handle()));
                    return Err(e);
                }
            }
        }
        Ok(kernels)
    }

    fn create_kernel(
        &self,
        module: ModuleHandle,
        device: DeviceHandle,
        name: String,
    ) -> Result<Arc<Level0Kernel>> {
        let info = self.blob.function(&name).ok_or_else(|| Error::Compile {
            status: ZeResult::ErrorInvalidKernelName,
            log: format!("no function info for kernel '{name}'"),
        })?;
        let handle = self
            .driver
            .kernel_create(module, &name)
            .lz_context("zeKernelCreate")?;
        debug!(kernel = %name, handle = %handle, "Kernel created");
        Ok(Arc::new(Level0Kernel::new(handle, name, info, device, module)))
    }

    fn destroy_kernels(&self, handles: impl Iterator<Item = KernelHandle>) -> Option<Error> {
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self
                .driver
                .kernel_destroy(handle)
                .lz_context("zeKernelDestroy")
            {
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    /// Kernel `name` compiled for `device`
    pub fn get_kernel(&self, device: &Level0Device, name: &str) -> Result<Arc<Level0Kernel>> {
        let compiled = self.compiled.read();
        let module = compiled
            .get(&device.handle())
            .ok_or(Error::NotCompiled(device.handle()))?;
        module
            .kernels
            .iter()
            .find(|k| k.name() == name)
            .cloned()
            .ok_or_else(|| Error::KernelNotFound(name.to_string()))
    }

    /// Every kernel compiled for `device`
    pub fn kernels(&self, device: &Level0Device) -> Vec<Arc<Level0Kernel>> {
        self.compiled
            .read()
            .get(&device.handle())
            .map(|m| m.kernels.clone())
            .unwrap_or_default()
    }

    /// Native module built for `device`
    pub fn native_handle(&self, device: &Level0Device) -> Option<ModuleHandle> {
        self.compiled.read().get(&device.handle()).map(|m| m.handle)
    }

    pub fn is_compiled_for(&self, device: &Level0Device) -> bool {
        self.compiled.read().contains_key(&device.handle())
    }

    fn release_compiled(&self, device: DeviceHandle, module: CompiledModule) -> Result<()> {
        let kernel_error = self.destroy_kernels(module.kernels.iter().map(|k| k.handle()));
        let module_error = self
            .driver
            .module_destroy(module.handle)
            .lz_context("zeModuleDestroy")
            .err();
        debug!(device = %device, module = %module.handle, "Module released");
        match kernel_error.or(module_error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Destroy the kernels and native module built for `device`
    ///
    /// Kernel objects handed out earlier keep their data but their handles
    /// become invalid.
    pub fn release(&self, device: &Level0Device) -> Result<()> {
        let removed = self.compiled.write().remove(&device.handle());
        match removed {
            Some(module) => self.release_compiled(device.handle(), module),
            None => Ok(()),
        }
    }

    /// Release the compiled state for every device
    pub fn release_all(&self) -> Result<()> {
        let drained: Vec<_> = self.compiled.write().drain().collect();
        let mut first_error = None;
        for (device, module) in drained {
            if let Err(e) = self.release_compiled(device, module) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Level0Module {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            warn!(error = %e, "Module dropped with teardown errors");
        }
    }
}

impl std::fmt::Debug for Level0Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level0Module")
            .field("devices", &self.compiled.read().len())
            .finish()
    }
}
