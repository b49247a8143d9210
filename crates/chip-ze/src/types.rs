//! Property structures and descriptors exchanged with the driver

use std::fmt;

/// Device category reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Graphics processing unit
    Gpu,
    /// Central processing unit
    Cpu,
    /// Field programmable gate array
    Fpga,
    /// Memory copy accelerator
    Mca,
    /// Vision processing unit
    Vpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Gpu => write!(f, "GPU"),
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Fpga => write!(f, "FPGA"),
            DeviceType::Mca => write!(f, "MCA"),
            DeviceType::Vpu => write!(f, "VPU"),
        }
    }
}

/// Properties of a driver instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverProperties {
    /// Human readable platform name
    pub name: String,
    /// Driver version
    pub driver_version: u32,
}

/// General device properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Device name
    pub name: String,
    /// Device category
    pub device_type: DeviceType,
    /// PCI vendor id
    pub vendor_id: u32,
    /// Vendor specific device id
    pub device_id: u32,
    /// Core clock rate in MHz
    pub core_clock_rate: u32,
    /// Largest single allocation in bytes
    pub max_mem_alloc_size: u64,
    /// Hardware threads per execution unit
    pub num_threads_per_eu: u32,
    /// Execution units per subslice
    pub num_eus_per_subslice: u32,
    /// Subslices per slice
    pub num_subslices_per_slice: u32,
    /// Slices
    pub num_slices: u32,
    /// Device shares memory with the host
    pub integrated: bool,
}

/// Compute properties of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeProperties {
    /// Maximum work-items in one group
    pub max_total_group_size: u32,
    /// Maximum group size per dimension
    pub max_group_size: [u32; 3],
    /// Maximum group count per dimension
    pub max_group_count: [u32; 3],
    /// Shared local memory per group in bytes
    pub max_shared_local_memory: u32,
    /// Supported sub-group sizes
    pub sub_group_sizes: Vec<u32>,
}

/// One memory region of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProperties {
    /// Region name
    pub name: String,
    /// Total size in bytes
    pub total_size: u64,
    /// Maximum clock rate in MHz
    pub max_clock_rate: u32,
    /// Bus width in bits
    pub max_bus_width: u32,
}

/// Which allocation kinds a device can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessProperties {
    /// Host allocations are accessible by the device
    pub host_alloc: bool,
    /// Device allocations are supported
    pub device_alloc: bool,
    /// Shared allocations migrating between host and this device are supported
    pub shared_single_device_alloc: bool,
}

/// Execution mode of a command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandQueueMode {
    /// Driver chooses
    #[default]
    Default,
    /// Submission blocks until the work completes
    Synchronous,
    /// Submission returns immediately
    Asynchronous,
}

/// Command queue creation descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandQueueDesc {
    /// Command queue group ordinal
    pub ordinal: u32,
    /// Queue index within the group
    pub index: u32,
    /// Execution mode
    pub mode: CommandQueueMode,
}

/// Module input format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleFormat {
    /// SPIR-V intermediate language
    IlSpirv,
    /// Device specific native binary
    Native,
}

/// Module creation descriptor
#[derive(Debug, Clone, Copy)]
pub struct ModuleDesc<'a> {
    /// Input format
    pub format: ModuleFormat,
    /// Module bytes
    pub input: &'a [u8],
    /// Build flags passed to the compiler
    pub build_flags: &'a str,
}

/// Work-items per group, per dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupSize {
    /// X dimension
    pub x: u32,
    /// Y dimension
    pub y: u32,
    /// Z dimension
    pub z: u32,
}

impl GroupSize {
    /// Create a group size
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Work-items in one group
    pub const fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GroupSize {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Groups per dispatch, per dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupCount {
    /// X dimension
    pub x: u32,
    /// Y dimension
    pub y: u32,
    /// Z dimension
    pub z: u32,
}

impl GroupCount {
    /// Create a group count
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Groups in the dispatch
    pub const fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// Properties of a created kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelProperties {
    /// Number of kernel arguments
    pub num_args: u32,
    /// Group size set on the kernel
    pub group_size: GroupSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_volume() {
        assert_eq!(GroupSize::new(8, 4, 2).volume(), 64);
        assert_eq!(GroupCount::new(u32::MAX, 2, 1).volume(), u32::MAX as u64 * 2);
        assert_eq!(GroupSize::default().volume(), 1);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(DeviceType::Gpu.to_string(), "GPU");
        assert_eq!(DeviceType::Vpu.to_string(), "VPU");
    }
}
