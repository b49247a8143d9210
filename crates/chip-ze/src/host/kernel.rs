//! Host kernels and the host module binary format
//!
//! A host module binary is UTF-8 text:
//!
//! ```text
//! !zehost 1
//! # comments are ignored
//! kernel vector_add
//! kernel fill_u32
//! ```
//!
//! Every `kernel` line must name a kernel registered with the driver,
//! otherwise module creation fails with a build log naming the symbol.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::types::{GroupCount, GroupSize};

/// First line of every host module binary
pub const MODULE_MAGIC: &str = "!zehost 1";

/// Body of a host kernel, invoked once per work-group
pub type HostKernelFn = dyn Fn(&WorkGroup, &KernelArgs) + Send + Sync;

/// A kernel implemented on the host
#[derive(Clone)]
pub struct HostKernel {
    name: String,
    num_args: u32,
    func: Arc<HostKernelFn>,
}

impl HostKernel {
    /// Register `func` under `name`, taking `num_args` arguments
    pub fn new<F>(name: impl Into<String>, num_args: u32, func: F) -> Self
    where
        F: Fn(&WorkGroup, &KernelArgs) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            num_args,
            func: Arc::new(func),
        }
    }

    /// Kernel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments
    pub fn num_args(&self) -> u32 {
        self.num_args
    }

    pub(crate) fn func(&self) -> Arc<HostKernelFn> {
        Arc::clone(&self.func)
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.name)
            .field("num_args", &self.num_args)
            .finish()
    }
}

/// One argument as captured at launch time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// Value bytes, including pointers
    Bytes(Vec<u8>),
    /// Local memory of the given size
    Local(usize),
}

/// Scalars readable from argument bytes
pub trait ArgScalar: Copy {
    /// Size in bytes
    const SIZE: usize;
    /// Decode from native-endian bytes of length `SIZE`
    fn from_ne_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_arg_scalar {
    ($($ty:ty),+) => {
        $(
            impl ArgScalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_ne_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )+
    };
}

impl_arg_scalar!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

/// Arguments of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    values: Vec<ArgValue>,
}

impl KernelArgs {
    /// Build an argument set
    pub fn new(values: Vec<ArgValue>) -> Self {
        Self { values }
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` if the kernel takes no arguments
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw bytes of a value argument
    pub fn bytes(&self, index: usize) -> Option<&[u8]> {
        match self.values.get(index)? {
            ArgValue::Bytes(b) => Some(b),
            ArgValue::Local(_) => None,
        }
    }

    /// Decode a scalar argument; `None` when the size does not match
    pub fn value<T: ArgScalar>(&self, index: usize) -> Option<T> {
        let bytes = self.bytes(index)?;
        (bytes.len() == T::SIZE).then(|| T::from_ne_slice(bytes))
    }

    /// Decode a pointer argument
    pub fn pointer(&self, index: usize) -> Option<*mut u8> {
        self.value::<usize>(index).map(|addr| addr as *mut u8)
    }

    /// Size of a local memory argument
    pub fn local_size(&self, index: usize) -> Option<usize> {
        match self.values.get(index)? {
            ArgValue::Local(size) => Some(*size),
            ArgValue::Bytes(_) => None,
        }
    }
}

/// Position of one work-group inside a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroup {
    /// Group id per dimension
    pub group_id: [u32; 3],
    /// Work-items per group per dimension
    pub group_size: [u32; 3],
    /// Groups in the dispatch per dimension
    pub group_count: [u32; 3],
}

impl WorkGroup {
    pub(crate) fn from_linear(linear: u64, size: GroupSize, count: GroupCount) -> Self {
        let cx = count.x as u64;
        let cy = count.y as u64;
        let x = linear % cx;
        let y = (linear / cx) % cy;
        let z = linear / (cx * cy);
        Self {
            group_id: [x as u32, y as u32, z as u32],
            group_size: [size.x, size.y, size.z],
            group_count: [count.x, count.y, count.z],
        }
    }

    /// Global id of the group's first work-item per dimension
    pub fn global_offset(&self) -> [u64; 3] {
        [
            self.group_id[0] as u64 * self.group_size[0] as u64,
            self.group_id[1] as u64 * self.group_size[1] as u64,
            self.group_id[2] as u64 * self.group_size[2] as u64,
        ]
    }

    /// Global x ids covered by this group
    pub fn global_x(&self) -> Range<u64> {
        let start = self.global_offset()[0];
        start..start + self.group_size[0] as u64
    }

    /// Visit every work-item as (global id, local id)
    pub fn for_each_item(&self, mut f: impl FnMut([u64; 3], [u32; 3])) {
        let offset = self.global_offset();
        for lz in 0..self.group_size[2] {
            for ly in 0..self.group_size[1] {
                for lx in 0..self.group_size[0] {
                    let global = [
                        offset[0] + lx as u64,
                        offset[1] + ly as u64,
                        offset[2] + lz as u64,
                    ];
                    f(global, [lx, ly, lz]);
                }
            }
        }
    }
}

/// Produce a host module binary defining `kernels`
pub fn module_binary<S: AsRef<str>>(kernels: &[S]) -> Vec<u8> {
    let mut text = String::from(MODULE_MAGIC);
    text.push('\n');
    for name in kernels {
        text.push_str("kernel ");
        text.push_str(name.as_ref());
        text.push('\n');
    }
    text.into_bytes()
}

/// Why a module binary could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParseError {
    /// Not a host module at all
    BadMagic,
    /// Host module with a malformed line
    Malformed(String),
}

/// Extract kernel names from a host module binary
pub(crate) fn parse_module(input: &[u8]) -> Result<Vec<String>, ParseError> {
    let text = std::str::from_utf8(input).map_err(|_| ParseError::BadMagic)?;
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'));

    if lines.next() != Some(MODULE_MAGIC) {
        return Err(ParseError::BadMagic);
    }

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for line in lines {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("kernel"), Some(name), None) => {
                if !seen.insert(name.to_string()) {
                    return Err(ParseError::Malformed(format!(
                        "kernel '{name}' defined more than once"
                    )));
                }
                names.push(name.to_string());
            }
            _ => {
                return Err(ParseError::Malformed(format!(
                    "unrecognised directive '{line}'"
                )));
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_binary_parses_back() {
        let bin = module_binary(&["a", "b"]);
        assert_eq!(parse_module(&bin).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let bin = b"\n# header\n!zehost 1\n\n# body\nkernel k\n";
        assert_eq!(parse_module(bin).unwrap(), vec!["k"]);
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(parse_module(b"\x03\x02\x23\x07"), Err(ParseError::BadMagic));
        assert_eq!(parse_module(b"kernel k\n"), Err(ParseError::BadMagic));
    }

    #[test]
    fn test_duplicate_kernel_rejected() {
        let bin = module_binary(&["k", "k"]);
        assert!(matches!(parse_module(&bin), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_args_decode() {
        let args = KernelArgs::new(vec![
            ArgValue::Bytes(7u32.to_ne_bytes().to_vec()),
            ArgValue::Bytes(0x1000usize.to_ne_bytes().to_vec()),
            ArgValue::Local(256),
        ]);
        assert_eq!(args.value::<u32>(0), Some(7));
        assert_eq!(args.value::<u64>(0), None);
        assert_eq!(args.pointer(1), Some(0x1000 as *mut u8));
        assert_eq!(args.local_size(2), Some(256));
        assert_eq!(args.bytes(2), None);
    }

    #[test]
    fn test_work_group_from_linear() {
        let wg = WorkGroup::from_linear(7, GroupSize::new(4, 2, 1), GroupCount::new(3, 2, 2));
        assert_eq!(wg.group_id, [1, 0, 1]);
        assert_eq!(wg.global_offset(), [4, 0, 1]);
        assert_eq!(wg.global_x(), 4..8);

        let mut items = 0;
        wg.for_each_item(|_, _| items += 1);
        assert_eq!(items, 8);
    }

    proptest::proptest! {
        #[test]
        fn prop_linear_ids_cover_dispatch_once(
            count in (1u32..6, 1u32..6, 1u32..6),
            size in (1u32..5, 1u32..5, 1u32..5),
        ) {
            let count = GroupCount::new(count.0, count.1, count.2);
            let size = GroupSize::new(size.0, size.1, size.2);
            let total = count.x as u64 * count.y as u64 * count.z as u64;

            let mut seen = HashSet::new();
            for linear in 0..total {
                let wg = WorkGroup::from_linear(linear, size, count);
                proptest::prop_assert!(wg.group_id.iter().zip(wg.group_count).all(|(&id, n)| id < n));
                wg.for_each_item(|global, _| {
                    seen.insert(global);
                });
            }
            let items = total * size.x as u64 * size.y as u64 * size.z as u64;
            proptest::prop_assert_eq!(seen.len() as u64, items);
        }
    }
}
