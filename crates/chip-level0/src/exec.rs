//! Launch descriptions

use std::fmt;
use std::sync::Arc;

use chip_ze::{GroupCount, GroupSize};

use crate::kernel::Level0Kernel;

/// Three-dimensional extent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Product of the three extents
    pub const fn volume(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    pub const fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

impl From<Dim3> for GroupSize {
    fn from(d: Dim3) -> Self {
        GroupSize::new(d.x, d.y, d.z)
    }
}

impl From<Dim3> for GroupCount {
    fn from(d: Dim3) -> Self {
        GroupCount::new(d.x, d.y, d.z)
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// One kernel launch with its packed arguments
///
/// Generic over the kernel type so backend-independent code can build
/// launches; defaults to the Level Zero kernel.
#[derive(Debug)]
pub struct ExecItem<K = Level0Kernel> {
    /// Kernel to run
    pub kernel: Arc<K>,
    /// Blocks per grid
    pub grid: Dim3,
    /// Threads per block
    pub block: Dim3,
    /// Dynamic shared memory in bytes
    pub shared_mem: usize,
    /// Arguments packed per the kernel's `FunctionInfo`
    pub args: Vec<u8>,
}

impl<K> ExecItem<K> {
    pub fn new(kernel: Arc<K>, grid: impl Into<Dim3>, block: impl Into<Dim3>, args: Vec<u8>) -> Self {
        Self {
            kernel,
            grid: grid.into(),
            block: block.into(),
            shared_mem: 0,
            args,
        }
    }

    /// Request dynamic shared memory
    pub fn with_shared_mem(mut self, bytes: usize) -> Self {
        self.shared_mem = bytes;
        self
    }
}

impl<K> Clone for ExecItem<K> {
    fn clone(&self) -> Self {
        Self {
            kernel: Arc::clone(&self.kernel),
            grid: self.grid,
            block: self.block,
            shared_mem: self.shared_mem,
            args: self.args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dim3_conversions() {
        assert_eq!(Dim3::from(8), Dim3::new(8, 1, 1));
        assert_eq!(Dim3::from((2, 3, 4)).volume(), 24);
        assert_eq!(GroupCount::from(Dim3::new(1, 2, 3)), GroupCount::new(1, 2, 3));
        assert_eq!(Dim3::default().to_string(), "(1, 1, 1)");
    }

    #[test]
    fn test_item_over_any_kernel_type() {
        struct Stub;

        let item = ExecItem::new(Arc::new(Stub), 2, (4, 2, 1), vec![1, 2]).with_shared_mem(64);
        let copy = item.clone();
        assert_eq!(Arc::strong_count(&item.kernel), 2);
        assert_eq!(copy.block.volume(), 8);
        assert_eq!((copy.shared_mem, copy.args), (64, vec![1, 2]));
    }
}
