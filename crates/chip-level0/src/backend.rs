//! Backend lifecycle: device discovery, selection and ordered teardown

use std::sync::Arc;

use chip_ze::{DeviceHandle, DriverHandle, ZeDriver};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::context::Level0Context;
use crate::device::{Level0Device, populate_device_properties};
use crate::error::{Error, Result};
use crate::queue::Level0Queue;
use crate::result::LzResultExt;
use crate::selector::{DeviceSelector, DeviceTypeSelector, PlatformSelector};

/// Everything built for one selected device
#[derive(Debug)]
struct DeviceEntry {
    platform: DriverHandle,
    context: Arc<Level0Context>,
    device: Arc<Level0Device>,
    default_queue: Arc<Level0Queue>,
}

#[derive(Debug, Default)]
enum BackendState {
    #[default]
    Uninitialized,
    Ready(Vec<DeviceEntry>),
    ShutDown,
}

/// Entry point of the runtime
///
/// Constructed explicitly and owned by the caller. [`initialize`] runs at
/// most once; [`uninitialize`] or dropping the backend releases every
/// native object it created.
///
/// [`initialize`]: Level0Backend::initialize
/// [`uninitialize`]: Level0Backend::uninitialize
pub struct Level0Backend {
    driver: Arc<dyn ZeDriver>,
    state: RwLock<BackendState>,
}

impl Level0Backend {
    /// Create an uninitialised backend over `driver`
    pub fn new(driver: Arc<dyn ZeDriver>) -> Self {
        Self {
            driver,
            state: RwLock::new(BackendState::Uninitialized),
        }
    }

    pub fn driver(&self) -> &Arc<dyn ZeDriver> {
        &self.driver
    }

    /// Discover devices matching the three selectors and set each one up
    ///
    /// On failure every object built by this call is released again.
    pub fn initialize(&self, platform: &str, device_type: &str, device: &str) -> Result<()> {
        let platform_selector: PlatformSelector = platform.parse()?;
        let type_selector: DeviceTypeSelector = device_type.parse()?;
        let device_selector: DeviceSelector = device.parse()?;

        let mut state = self.state.write();
        if !matches!(*state, BackendState::Uninitialized) {
            return Err(Error::AlreadyInitialized);
        }
        self.driver.init().lz_context("zeInit")?;

        let mut entries = Vec::new();
        if let Err(e) = self.discover(
            &platform_selector,
            type_selector,
            &device_selector,
            &mut entries,
        ) {
            error!(error = %e, built = entries.len(), "Initialization failed, rolling back");
            if let Err(cleanup) = teardown(entries) {
                warn!(error = %cleanup, "Rollback incomplete");
            }
            return Err(e);
        }
        if entries.is_empty() {
            return Err(Error::NoMatchingDevice {
                platform: platform_selector.to_string(),
                device_type: type_selector.to_string(),
                device: device_selector.to_string(),
            });
        }

        info!(devices = entries.len(), "Backend initialized");
        *state = BackendState::Ready(entries);
        Ok(())
    }

    /// [`initialize`](Self::initialize) with selectors from configuration
    pub fn initialize_with_config(&self, config: &BackendConfig) -> Result<()> {
        self.initialize(&config.platform, &config.device_type, &config.device)
    }

    fn discover(
        &self,
        platform_selector: &PlatformSelector,
        type_selector: DeviceTypeSelector,
        device_selector: &DeviceSelector,
        entries: &mut Vec<DeviceEntry>,
    ) -> Result<()> {
        let platforms = self.driver.driver_get().lz_context("zeDriverGet")?;
        for (platform_index, platform) in platforms.into_iter().enumerate() {
            let platform_props = self
                .driver
                .driver_get_properties(platform)
                .lz_context("zeDriverGetProperties")?;
            if !platform_selector.matches(platform_index, &platform_props.name) {
                debug!(platform = %platform_props.name, "Platform filtered out");
                continue;
            }

            let devices = self
                .driver
                .device_get(platform)
                .lz_context("zeDeviceGet")?;
            let mut type_index = 0;
            for device in devices {
                let props = self
                    .driver
                    .device_get_properties(device)
                    .lz_context("zeDeviceGetProperties")?;
                if !type_selector.matches(props.device_type) {
                    continue;
                }
                let index = type_index;
                type_index += 1;
                if !device_selector.matches(index, &props.name) {
                    continue;
                }
                entries.push(self.build_entry(platform, device, entries.len())?);
            }
        }
        Ok(())
    }

    fn build_entry(
        &self,
        platform: DriverHandle,
        handle: DeviceHandle,
        index: usize,
    ) -> Result<DeviceEntry> {
        let properties = populate_device_properties(self.driver.as_ref(), platform, handle)?;
        let context =
            Level0Context::create(Arc::clone(&self.driver), platform, handle, &properties)?;
        let device = Level0Device::new(
            Arc::clone(&self.driver),
            handle,
            index,
            properties,
            &context,
        );
        let default_queue = match device.create_queue() {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(cleanup) = context.destroy() {
                    warn!(error = %cleanup, "Context rollback failed");
                }
                return Err(e);
            }
        };
        info!(device = %handle, name = device.name(), index, "Device ready");
        Ok(DeviceEntry {
            platform,
            context,
            device,
            default_queue,
        })
    }

    /// Release every native object in dependency order
    ///
    /// Queues are drained and destroyed first, then modules, then contexts.
    /// Continues past failures and returns the first one. A second call is
    /// a no-op.
    pub fn uninitialize(&self) -> Result<()> {
        let mut state = self.state.write();
        match std::mem::replace(&mut *state, BackendState::ShutDown) {
            BackendState::Uninitialized => {
                *state = BackendState::Uninitialized;
                Err(Error::NotInitialized)
            }
            BackendState::ShutDown => Ok(()),
            BackendState::Ready(entries) => {
                let result = teardown(entries);
                info!("Backend shut down");
                result
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.read(), BackendState::Ready(_))
    }

    fn with_entries<T>(&self, f: impl FnOnce(&[DeviceEntry]) -> Result<T>) -> Result<T> {
        match &*self.state.read() {
            BackendState::Ready(entries) => f(entries),
            _ => Err(Error::NotInitialized),
        }
    }

    fn entry<T>(&self, index: usize, f: impl FnOnce(&DeviceEntry) -> T) -> Result<T> {
        self.with_entries(|entries| {
            entries
                .get(index)
                .map(f)
                .ok_or_else(|| Error::invalid_value(format!("no device at index {index}")))
        })
    }

    /// Number of selected devices; 0 before initialization
    pub fn device_count(&self) -> usize {
        self.with_entries(|entries| Ok(entries.len())).unwrap_or(0)
    }

    pub fn devices(&self) -> Result<Vec<Arc<Level0Device>>> {
        self.with_entries(|entries| Ok(entries.iter().map(|e| Arc::clone(&e.device)).collect()))
    }

    pub fn device(&self, index: usize) -> Result<Arc<Level0Device>> {
        self.entry(index, |e| Arc::clone(&e.device))
    }

    pub fn context(&self, index: usize) -> Result<Arc<Level0Context>> {
        self.entry(index, |e| Arc::clone(&e.context))
    }

    /// Queue created for device `index` during initialization
    pub fn default_queue(&self, index: usize) -> Result<Arc<Level0Queue>> {
        self.entry(index, |e| Arc::clone(&e.default_queue))
    }

    /// Platform that exposes device `index`
    pub fn platform(&self, index: usize) -> Result<DriverHandle> {
        self.entry(index, |e| e.platform)
    }
}

/// Release queues, then modules, then contexts of `entries`
fn teardown(entries: Vec<DeviceEntry>) -> Result<()> {
    let mut first_error = None;
    let mut note = |e: Error| {
        warn!(error = %e, "Teardown step failed");
        first_error.get_or_insert(e);
    };

    for entry in &entries {
        if let Err(e) = entry.default_queue.destroy() {
            note(e);
        }
        for queue in entry.device.live_queues() {
            if let Err(e) = queue.destroy() {
                note(e);
            }
        }
    }
    for entry in &entries {
        for module in entry.device.modules() {
            if let Err(e) = module.release_all() {
                note(e);
            }
        }
    }
    for entry in &entries {
        if let Err(e) = entry.context.destroy() {
            note(e);
        }
    }
    drop(entries);
    first_error.map_or(Ok(()), Err)
}

impl Drop for Level0Backend {
    fn drop(&mut self) {
        if self.is_initialized()
            && let Err(e) = self.uninitialize()
        {
            warn!(error = %e, "Backend dropped with teardown errors");
        }
    }
}

impl std::fmt::Debug for Level0Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level0Backend")
            .field("initialized", &self.is_initialized())
            .field("devices", &self.device_count())
            .finish()
    }
}
