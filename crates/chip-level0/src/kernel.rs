//! Kernels and their reflected signatures

use std::fmt;
use std::sync::Arc;

use chip_ze::{DeviceHandle, KernelHandle, ModuleHandle};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};

const POINTER_SIZE: usize = std::mem::size_of::<usize>();
const MAX_ARG_ALIGNMENT: usize = 16;

/// Kind of one kernel parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// By-value argument of the given size
    Value(usize),
    /// Pointer to global memory
    Pointer,
    /// Pointer to local memory; sized by the launch's dynamic shared memory
    LocalMemory,
    /// Image object
    Image,
    /// Sampler object
    Sampler,
}

impl ParamKind {
    /// Bytes the parameter occupies in the packed argument buffer
    pub const fn size(&self) -> usize {
        match self {
            Self::Value(n) => *n,
            Self::Pointer | Self::Image | Self::Sampler => POINTER_SIZE,
            Self::LocalMemory => 0,
        }
    }
}

/// One parameter and its place in the packed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    /// Parameter kind
    pub kind: ParamKind,
    /// Size in bytes
    pub size: usize,
    /// Offset in the packed buffer
    pub offset: usize,
}

/// Reflected signature of a kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    params: Vec<ParamInfo>,
    packed_size: usize,
}

fn natural_alignment(size: usize) -> usize {
    size.max(1).next_power_of_two().min(MAX_ARG_ALIGNMENT)
}

impl FunctionInfo {
    /// Lay out `kinds` in order, each at its natural alignment
    pub fn new(kinds: impl IntoIterator<Item = ParamKind>) -> Self {
        let mut cursor = 0usize;
        let params = kinds
            .into_iter()
            .map(|kind| {
                let size = kind.size();
                let offset = if size == 0 {
                    cursor
                } else {
                    cursor.next_multiple_of(natural_alignment(size))
                };
                cursor = offset + size;
                ParamInfo { kind, size, offset }
            })
            .collect();
        Self {
            params,
            packed_size: cursor,
        }
    }

    /// Parameters in declaration order
    pub fn params(&self) -> &[ParamInfo] {
        &self.params
    }

    /// Number of parameters
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Length of a packed argument buffer
    pub fn packed_size(&self) -> usize {
        self.packed_size
    }

    /// `true` if any parameter is an image or sampler
    pub fn has_image_params(&self) -> bool {
        self.params
            .iter()
            .any(|p| matches!(p.kind, ParamKind::Image | ParamKind::Sampler))
    }

    /// Pack one value per non-local parameter into a buffer
    pub fn pack(&self, values: &[&[u8]]) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.packed_size];
        let mut values = values.iter();
        for (index, param) in self.params.iter().enumerate() {
            if param.kind == ParamKind::LocalMemory {
                continue;
            }
            let value = values
                .next()
                .ok_or_else(|| Error::invalid_value(format!("missing value for parameter {index}")))?;
            if value.len() != param.size {
                return Err(Error::invalid_value(format!(
                    "parameter {index} takes {} bytes, got {}",
                    param.size,
                    value.len()
                )));
            }
            buffer[param.offset..param.offset + param.size].copy_from_slice(value);
        }
        if values.next().is_some() {
            return Err(Error::invalid_value("too many argument values"));
        }
        Ok(buffer)
    }
}

/// A compiled entry point on one device
pub struct Level0Kernel {
    handle: KernelHandle,
    name: String,
    info: Arc<FunctionInfo>,
    device: DeviceHandle,
    module: ModuleHandle,
    launch_guard: Mutex<()>,
}

impl Level0Kernel {
    pub(crate) fn new(
        handle: KernelHandle,
        name: String,
        info: Arc<FunctionInfo>,
        device: DeviceHandle,
        module: ModuleHandle,
    ) -> Self {
        Self {
            handle,
            name,
            info,
            device,
            module,
            launch_guard: Mutex::new(()),
        }
    }

    /// Native kernel handle; invalid once the owning module is released
    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_info(&self) -> &FunctionInfo {
        &self.info
    }

    /// Device the kernel was compiled for
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn module_handle(&self) -> ModuleHandle {
        self.module
    }

    /// Serialises argument setting and recording, which mutate kernel state
    pub(crate) fn lock_launch(&self) -> MutexGuard<'_, ()> {
        self.launch_guard.lock()
    }
}

impl fmt::Debug for Level0Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Level0Kernel")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("device", &self.device)
            .field("params", &self.info.param_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_natural_alignment() {
        let info = FunctionInfo::new([
            ParamKind::Value(1),
            ParamKind::Pointer,
            ParamKind::Value(4),
            ParamKind::LocalMemory,
            ParamKind::Value(2),
            ParamKind::Value(32),
        ]);
        let offsets: Vec<usize> = info.params().iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 20, 20, 32]);
        assert_eq!(info.packed_size(), 64);
    }

    #[test]
    fn test_odd_sized_value_rounds_alignment_up() {
        let info = FunctionInfo::new([ParamKind::Value(1), ParamKind::Value(12)]);
        assert_eq!(info.params()[1].offset, 16);
        assert_eq!(info.packed_size(), 28);
    }

    #[test]
    fn test_pack() {
        let info = FunctionInfo::new([ParamKind::Pointer, ParamKind::LocalMemory, ParamKind::Value(4)]);
        let packed = info
            .pack(&[&0x1000usize.to_ne_bytes(), &7u32.to_ne_bytes()])
            .unwrap();
        assert_eq!(packed.len(), 12);
        assert_eq!(&packed[8..12], &7u32.to_ne_bytes());

        assert!(info.pack(&[&0x1000usize.to_ne_bytes()]).is_err());
        assert!(info.pack(&[&[0u8; 4], &[0u8; 4]]).is_err());
    }

    #[test]
    fn test_image_params_detected() {
        assert!(FunctionInfo::new([ParamKind::Image]).has_image_params());
        assert!(!FunctionInfo::new([ParamKind::Pointer]).has_image_params());
    }
}
