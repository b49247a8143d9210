//! Allocation tests against the host driver

mod common;

use chip_level0::{DevicePtr, Error, HipErrorCode, MemoryKind, status_of};
use chip_ze::{DriverOp, HostDeviceConfig, HostDriver, ZeResult};
use proptest::prelude::*;

const MIB: usize = 1024 * 1024;

fn kind_strategy() -> impl Strategy<Value = MemoryKind> {
    prop_oneof![
        Just(MemoryKind::Device),
        Just(MemoryKind::Host),
        Just(MemoryKind::Shared),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_allocation_aligned_and_freed_once(
        size in 1usize..(256 * 1024),
        align_shift in prop::option::of(0u32..13),
        kind in kind_strategy(),
    ) {
        let driver = common::driver();
        let backend = common::ready_backend(&driver);
        let ctx = backend.context(0).unwrap();
        let alignment = align_shift.map_or(0, |s| 1usize << s);

        let ptr = ctx.allocate(size, alignment, kind).unwrap();
        prop_assert!(ptr.is_aligned_to(alignment));
        prop_assert_eq!(ctx.allocated_bytes(), size);
        prop_assert_eq!(ctx.allocation(ptr).map(|a| a.kind), Some(kind));

        prop_assert!(ctx.free(ptr).is_ok());
        prop_assert!(matches!(ctx.free(ptr), Err(Error::DoubleFree(_))));
        prop_assert_eq!(ctx.outstanding_allocations(), 0);
    }
}

#[test]
fn test_double_free_reports_invalid_value() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    let ptr = ctx.allocate(4096, 0, MemoryKind::Device).unwrap();
    ctx.free(ptr).unwrap();
    let err = ctx.free(ptr).unwrap_err();
    assert!(matches!(err, Error::DoubleFree(addr) if addr == ptr.addr()));
    assert_eq!(err.code(), HipErrorCode::InvalidValue);
    assert_eq!(driver.stats().frees, 1);

    // Same portable code as a bad argument, but a distinct variant.
    let repeat = ctx.free(ptr);
    assert_eq!(status_of(&repeat), HipErrorCode::InvalidValue);
    let zero = ctx.allocate(0, 0, MemoryKind::Device);
    assert_eq!(status_of(&zero), HipErrorCode::InvalidValue);
    assert!(matches!(repeat, Err(Error::DoubleFree(_))));
    assert!(matches!(zero, Err(Error::InvalidValue(_))));
}

#[test]
fn test_foreign_pointer_rejected() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    let mut local = [0u8; 16];
    let foreign = DevicePtr::from_ptr(local.as_mut_ptr()).unwrap();
    let err = ctx.free(foreign).unwrap_err();
    assert!(matches!(err, Error::InvalidDevicePointer(_)));
    assert_eq!(err.code(), HipErrorCode::InvalidDevicePointer);

    // Interior pointers are not allocation starts.
    let ptr = ctx.allocate(256, 0, MemoryKind::Host).unwrap();
    let interior = ptr.offset(16).unwrap();
    assert!(matches!(ctx.free(interior), Err(Error::InvalidDevicePointer(_))));
    assert_eq!(ctx.allocation(interior).map(|a| a.ptr), Some(ptr));
    ctx.free(ptr).unwrap();
}

#[test]
fn test_zero_size_and_bad_alignment() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    assert!(matches!(
        ctx.allocate(0, 0, MemoryKind::Device),
        Err(Error::InvalidValue(_))
    ));
    assert!(matches!(
        ctx.allocate(64, 48, MemoryKind::Device),
        Err(Error::InvalidValue(_))
    ));
    assert_eq!(driver.stats().allocations, 0);
}

#[test]
fn test_over_limit_is_out_of_memory() {
    let driver = HostDriver::builder()
        .device(HostDeviceConfig::gpu("Small GPU").with_memory(4 * MIB as u64, 2 * MIB as u64))
        .build();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    let err = ctx.allocate(3 * MIB, 0, MemoryKind::Device).unwrap_err();
    assert!(matches!(err, Error::OutOfMemory { size, kind: MemoryKind::Device } if size == 3 * MIB));
    assert!(err.is_recoverable());

    // Two allocations fit under the limit, the third exhausts capacity.
    let a = ctx.allocate(2 * MIB, 0, MemoryKind::Device).unwrap();
    let b = ctx.allocate(2 * MIB, 0, MemoryKind::Device).unwrap();
    let err = ctx.allocate(MIB, 0, MemoryKind::Device).unwrap_err();
    assert_eq!(err.code(), HipErrorCode::OutOfMemory);

    ctx.free(a).unwrap();
    let c = ctx.allocate(MIB, 0, MemoryKind::Device).unwrap();
    assert_eq!(ctx.free_all().unwrap(), 2);
    assert!(ctx.allocation(b).is_none());
    assert!(ctx.allocation(c).is_none());
    assert_eq!(driver.live_objects().allocations, 0);
}

#[test]
fn test_unsupported_kind() {
    let driver = HostDriver::builder()
        .device(HostDeviceConfig::gpu("Discrete GPU").with_shared_alloc(false))
        .build();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    let err = ctx.allocate(64, 0, MemoryKind::Shared).unwrap_err();
    assert!(matches!(err, Error::UnsupportedMemoryKind(MemoryKind::Shared)));
    assert_eq!(err.code(), HipErrorCode::NotSupported);
    assert!(ctx.allocate(64, 0, MemoryKind::Host).is_ok());
}

#[test]
fn test_native_failure_is_wrapped() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    driver.inject_fault(DriverOp::MemAlloc, ZeResult::ErrorDeviceLost);
    let err = ctx.allocate(64, 0, MemoryKind::Device).unwrap_err();
    assert_eq!(err.native_status(), Some(ZeResult::ErrorDeviceLost));
    assert_eq!(err.code(), HipErrorCode::LaunchFailure);

    driver.inject_fault(DriverOp::MemAlloc, ZeResult::ErrorOutOfHostMemory);
    assert!(matches!(
        ctx.allocate(64, 0, MemoryKind::Host),
        Err(Error::OutOfMemory { kind: MemoryKind::Host, .. })
    ));

    // The fault is consumed; the context still works.
    let ptr = ctx.allocate(64, 0, MemoryKind::Device).unwrap();
    ctx.free(ptr).unwrap();
}

#[test]
fn test_failed_native_free_keeps_allocation_tracked() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    let ptr = ctx.allocate(64, 0, MemoryKind::Device).unwrap();
    driver.inject_fault(DriverOp::MemFree, ZeResult::ErrorUnknown);
    assert!(matches!(ctx.free(ptr), Err(Error::Driver { .. })));
    assert_eq!(ctx.outstanding_allocations(), 1);
    ctx.free(ptr).unwrap();
}

#[test]
fn test_context_copy_and_fill() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();

    let dst = ctx.allocate(64, 0, MemoryKind::Device).unwrap();
    unsafe {
        ctx.fill(dst.as_ptr(), &[0xAB, 0xCD], 64).unwrap();
        assert_eq!(common::read::<u8>(dst.as_ptr(), 4), vec![0xAB, 0xCD, 0xAB, 0xCD]);

        let src: Vec<u8> = (0..64).collect();
        ctx.copy(dst.as_ptr(), src.as_ptr(), src.len()).unwrap();
        assert_eq!(common::read::<u8>(dst.as_ptr(), 64), src);

        assert!(ctx.fill(dst.as_ptr(), &[1, 2, 3], 64).is_err());
    }
    assert_eq!(driver.stats().immediate_commands, 2);
    ctx.free(dst).unwrap();
}

#[test]
fn test_destroyed_context_rejects_allocation() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let ctx = backend.context(0).unwrap();
    backend.uninitialize().unwrap();

    assert!(ctx.is_destroyed());
    assert!(matches!(
        ctx.allocate(64, 0, MemoryKind::Device),
        Err(Error::InvalidContext)
    ));
    assert_eq!(
        ctx.allocate(64, 0, MemoryKind::Device).unwrap_err().code(),
        HipErrorCode::InvalidContext
    );
}
