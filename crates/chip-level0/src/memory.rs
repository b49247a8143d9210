//! Allocation bookkeeping

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;

/// Addresses remembered after release for double-free detection
pub const RELEASED_HISTORY: usize = 4096;

/// Memory class selected at allocation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Device-local memory
    Device,
    /// Host memory visible to the device
    Host,
    /// Memory migrating between host and device
    Shared,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Host => f.write_str("host"),
            Self::Shared => f.write_str("shared"),
        }
    }
}

/// Non-null address returned by an allocation
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(NonZeroUsize);

impl DevicePtr {
    /// Wrap an address; `None` for zero
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }

    /// Wrap a raw pointer; `None` for null
    #[inline]
    pub fn from_ptr(ptr: *mut u8) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// Address as an integer
    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Address as a raw pointer
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.get() as *mut u8
    }

    /// Address `bytes` past this one
    #[inline]
    pub fn offset(self, bytes: usize) -> Option<Self> {
        self.0.get().checked_add(bytes).and_then(Self::new)
    }

    /// `true` if the address is a multiple of `alignment`
    #[inline]
    pub fn is_aligned_to(self, alignment: usize) -> bool {
        alignment == 0 || self.0.get() % alignment == 0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0.get())
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// One outstanding allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Base address
    pub ptr: DevicePtr,
    /// Size in bytes
    pub size: usize,
    /// Requested alignment; 0 means driver default
    pub alignment: usize,
    /// Memory class
    pub kind: MemoryKind,
}

impl AllocationInfo {
    /// `true` if `addr` lies inside the allocation
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.ptr.addr() && addr - self.ptr.addr() < self.size
    }
}

/// Live allocations of a context plus recently released addresses
#[derive(Debug, Default)]
pub(crate) struct AllocationTable {
    live: BTreeMap<usize, AllocationInfo>,
    bytes: usize,
    released: VecDeque<usize>,
    released_set: HashSet<usize>,
}

impl AllocationTable {
    pub fn insert(&mut self, info: AllocationInfo) {
        let addr = info.ptr.addr();
        // The allocator may hand a released address out again.
        if self.released_set.remove(&addr) {
            self.released.retain(|a| *a != addr);
        }
        self.bytes += info.size;
        self.live.insert(addr, info);
    }

    /// Exact base address lookup
    pub fn get(&self, addr: usize) -> Option<&AllocationInfo> {
        self.live.get(&addr)
    }

    /// Lookup that also accepts interior addresses
    pub fn find(&self, addr: usize) -> Option<&AllocationInfo> {
        self.live
            .range(..=addr)
            .next_back()
            .map(|(_, info)| info)
            .filter(|info| info.contains(addr))
    }

    /// Stop tracking `addr` and remember it as released
    pub fn release(&mut self, addr: usize) -> Option<AllocationInfo> {
        let info = self.live.remove(&addr)?;
        self.bytes -= info.size;
        if self.released.len() == RELEASED_HISTORY
            && let Some(oldest) = self.released.pop_front()
        {
            self.released_set.remove(&oldest);
        }
        self.released.push_back(addr);
        self.released_set.insert(addr);
        Some(info)
    }

    pub fn was_released(&self, addr: usize) -> bool {
        self.released_set.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn addresses(&self) -> Vec<usize> {
        self.live.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(addr: usize, size: usize) -> AllocationInfo {
        AllocationInfo {
            ptr: DevicePtr::new(addr).unwrap(),
            size,
            alignment: 0,
            kind: MemoryKind::Device,
        }
    }

    #[test]
    fn test_interior_lookup() {
        let mut table = AllocationTable::default();
        table.insert(info(0x1000, 0x100));
        table.insert(info(0x2000, 0x10));
        assert_eq!(table.find(0x1080).map(|i| i.ptr.addr()), Some(0x1000));
        assert_eq!(table.find(0x10ff).map(|i| i.ptr.addr()), Some(0x1000));
        assert!(table.find(0x1100).is_none());
        assert!(table.find(0x0fff).is_none());
        assert!(table.get(0x1080).is_none());
        assert_eq!(table.bytes(), 0x110);
    }

    #[test]
    fn test_release_history() {
        let mut table = AllocationTable::default();
        table.insert(info(0x1000, 8));
        assert!(table.release(0x1000).is_some());
        assert!(table.was_released(0x1000));
        assert!(table.release(0x1000).is_none());
        assert_eq!(table.len(), 0);

        table.insert(info(0x1000, 8));
        assert!(!table.was_released(0x1000));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut table = AllocationTable::default();
        for i in 1..=RELEASED_HISTORY + 10 {
            table.insert(info(i * 16, 8));
            table.release(i * 16);
        }
        assert!(!table.was_released(16));
        assert!(table.was_released((RELEASED_HISTORY + 10) * 16));
        assert_eq!(table.released.len(), RELEASED_HISTORY);
    }

    #[test]
    fn test_device_ptr() {
        assert!(DevicePtr::new(0).is_none());
        let p = DevicePtr::new(0x40).unwrap();
        assert!(p.is_aligned_to(64));
        assert!(!p.is_aligned_to(128));
        assert_eq!(p.offset(4).map(DevicePtr::addr), Some(0x44));
        assert_eq!(p.to_string(), "0x40");
    }
}
