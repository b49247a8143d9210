//! Shared fixtures: a host driver with a few kernels and matching blobs

#![allow(dead_code)]

use std::sync::Arc;

use chip_level0::{FunctionInfo, KernelBlob, Level0Backend, Level0Kernel, ParamKind};
use chip_ze::host::{KernelArgs, WorkGroup, module_binary};
use chip_ze::{HostDeviceConfig, HostDriver, HostKernel};

/// `c[i] = a[i] + b[i]` over `n` f32 elements
fn vector_add(group: &WorkGroup, args: &KernelArgs) {
    let (Some(a), Some(b), Some(c), Some(n)) = (
        args.pointer(0),
        args.pointer(1),
        args.pointer(2),
        args.value::<u32>(3),
    ) else {
        return;
    };
    let (a, b, c) = (a as *const f32, b as *const f32, c as *mut f32);
    for i in group.global_x().take_while(|&i| i < u64::from(n)) {
        let i = i as usize;
        // SAFETY: the test allocates `n` elements per buffer; groups touch
        // disjoint indices.
        unsafe { *c.add(i) = *a.add(i) + *b.add(i) };
    }
}

/// `dst[i] = value` over `n` u32 elements
fn fill_u32(group: &WorkGroup, args: &KernelArgs) {
    let (Some(dst), Some(value), Some(n)) =
        (args.pointer(0), args.value::<u32>(1), args.value::<u32>(2))
    else {
        return;
    };
    let dst = dst as *mut u32;
    for i in group.global_x().take_while(|&i| i < u64::from(n)) {
        // SAFETY: as above.
        unsafe { *dst.add(i as usize) = value };
    }
}

/// `dst[i] = local bytes per group` over `n` u32 elements
fn local_size(group: &WorkGroup, args: &KernelArgs) {
    let (Some(dst), Some(local), Some(n)) =
        (args.pointer(0), args.local_size(1), args.value::<u32>(2))
    else {
        return;
    };
    let dst = dst as *mut u32;
    for i in group.global_x().take_while(|&i| i < u64::from(n)) {
        // SAFETY: as above.
        unsafe { *dst.add(i as usize) = local as u32 };
    }
}

/// Sleep for the given number of milliseconds
fn sleep_ms(_: &WorkGroup, args: &KernelArgs) {
    if let Some(ms) = args.value::<u32>(0) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }
}

/// Fault the device
fn trap(_: &WorkGroup, _: &KernelArgs) {
    panic!("trap instruction");
}

pub const KERNEL_NAMES: [&str; 5] = ["vector_add", "fill_u32", "local_size", "sleep_ms", "trap"];

pub fn kernels() -> Vec<HostKernel> {
    vec![
        HostKernel::new("vector_add", 4, vector_add),
        HostKernel::new("fill_u32", 3, fill_u32),
        HostKernel::new("local_size", 3, local_size),
        HostKernel::new("sleep_ms", 1, sleep_ms),
        HostKernel::new("trap", 0, trap),
    ]
}

/// One platform, one GPU
pub fn driver() -> HostDriver {
    HostDriver::builder().kernels(kernels()).build()
}

/// One platform with a GPU named `GPU A` and a GPU named `GPU B`
pub fn two_gpu_driver() -> HostDriver {
    HostDriver::builder()
        .platform("Host Level Zero Platform")
        .device(HostDeviceConfig::gpu("GPU A"))
        .device(HostDeviceConfig::gpu("GPU B"))
        .kernels(kernels())
        .build()
}

/// Backend over `driver`, sharing its state so tests can inspect it
pub fn backend(driver: &HostDriver) -> Level0Backend {
    Level0Backend::new(Arc::new(driver.clone()))
}

/// Backend initialised on every GPU of `driver`
pub fn ready_backend(driver: &HostDriver) -> Level0Backend {
    let backend = backend(driver);
    backend.initialize("", "gpu", "").unwrap();
    backend
}

pub fn vector_add_info() -> FunctionInfo {
    FunctionInfo::new([
        ParamKind::Pointer,
        ParamKind::Pointer,
        ParamKind::Pointer,
        ParamKind::Value(4),
    ])
}

pub fn fill_u32_info() -> FunctionInfo {
    FunctionInfo::new([ParamKind::Pointer, ParamKind::Value(4), ParamKind::Value(4)])
}

pub fn local_size_info() -> FunctionInfo {
    FunctionInfo::new([ParamKind::Pointer, ParamKind::LocalMemory, ParamKind::Value(4)])
}

/// Blob defining every fixture kernel
pub fn blob() -> Arc<KernelBlob> {
    Arc::new(
        KernelBlob::new(module_binary(&KERNEL_NAMES))
            .with_function("vector_add", vector_add_info())
            .with_function("fill_u32", fill_u32_info())
            .with_function("local_size", local_size_info())
            .with_function("sleep_ms", FunctionInfo::new([ParamKind::Value(4)]))
            .with_function("trap", FunctionInfo::default()),
    )
}

pub fn ptr_bytes(ptr: *const u8) -> [u8; std::mem::size_of::<usize>()] {
    (ptr as usize).to_ne_bytes()
}

/// View `len` elements at a host-accessible allocation
///
/// # Safety
/// `ptr` must point at `len` initialised elements that nothing else writes.
pub unsafe fn read<T: Copy>(ptr: *const u8, len: usize) -> Vec<T> {
    // SAFETY: forwarded from the caller.
    unsafe { std::slice::from_raw_parts(ptr as *const T, len).to_vec() }
}

/// Compile the fixture blob for device `index` and fetch kernel `name`
pub fn kernel(backend: &Level0Backend, index: usize, name: &str) -> Arc<Level0Kernel> {
    let device = backend.device(index).unwrap();
    let module = device.add_module(blob());
    module.compile(&device).unwrap();
    module.get_kernel(&device, name).unwrap()
}
