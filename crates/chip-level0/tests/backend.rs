//! Backend discovery, selection and teardown against the host driver

mod common;

use std::sync::Arc;

use chip_level0::{ConfigLoader, Error, ExecItem, HipErrorCode, MemoryKind};
use chip_ze::{DeviceType, DriverOp, HostDeviceConfig, HostDriver, ZeResult};

fn mixed_driver() -> HostDriver {
    HostDriver::builder()
        .platform("Host Level Zero Platform")
        .device(HostDeviceConfig::cpu("Host CPU"))
        .device(HostDeviceConfig::gpu("GPU A"))
        .device(HostDeviceConfig::gpu("GPU B"))
        .platform("Secondary Platform")
        .device(HostDeviceConfig::gpu("GPU C"))
        .kernels(common::kernels())
        .build()
}

fn names(backend: &chip_level0::Level0Backend) -> Vec<String> {
    backend
        .devices()
        .unwrap()
        .iter()
        .map(|d| d.name().to_string())
        .collect()
}

#[test]
fn test_default_driver_exposes_one_gpu() {
    let driver = HostDriver::new();
    let backend = common::ready_backend(&driver);

    assert!(backend.is_initialized());
    assert_eq!(backend.device_count(), 1);
    let device = backend.device(0).unwrap();
    let props = device.properties();
    assert_eq!(props.name, "Host GPU");
    assert_eq!(props.platform_name, "Host Level Zero Platform");
    assert_eq!(props.device_type, DeviceType::Gpu);
    assert_eq!(props.max_threads_per_block, 1024);
    assert_eq!(props.multiprocessor_count, 64);
    assert_eq!(props.clock_rate_khz, 1_200_000);
    assert_eq!(props.warp_size, 32);
    assert_eq!(props.shared_mem_per_block, 64 * 1024);
    assert!(props.shared_alloc);

    assert_eq!(backend.default_queue(0).unwrap().device().handle(), device.handle());
    assert_eq!(backend.context(0).unwrap().device(), device.handle());
}

#[test]
fn test_selection_by_type_index_and_name() {
    let driver = mixed_driver();

    let backend = common::backend(&driver);
    backend.initialize("all", "gpu", "all").unwrap();
    assert_eq!(names(&backend), ["GPU A", "GPU B", "GPU C"]);
    backend.uninitialize().unwrap();

    // Device indices count devices of the selected type within a platform.
    let backend = common::backend(&driver);
    backend.initialize("0", "gpu", "1").unwrap();
    assert_eq!(names(&backend), ["GPU B"]);
    backend.uninitialize().unwrap();

    let backend = common::backend(&driver);
    backend.initialize("secondary", "", "gpu c").unwrap();
    assert_eq!(names(&backend), ["GPU C"]);
    assert_eq!(backend.device(0).unwrap().index(), 0);
    backend.uninitialize().unwrap();

    let backend = common::backend(&driver);
    backend.initialize("", "cpu", "").unwrap();
    assert_eq!(names(&backend), ["Host CPU"]);
    assert!(backend.device(0).unwrap().properties().integrated);
    backend.uninitialize().unwrap();

    assert!(driver.live_objects().is_empty());
}

#[test]
fn test_no_matching_device() {
    let driver = common::driver();
    let backend = common::backend(&driver);

    let err = backend.initialize("", "cpu", "").unwrap_err();
    assert!(matches!(&err, Error::NoMatchingDevice { device_type, .. } if device_type == "cpu"));
    assert_eq!(err.code(), HipErrorCode::NoDevice);
    assert!(!backend.is_initialized());
    assert!(driver.live_objects().is_empty());

    assert!(matches!(
        backend.initialize("no such platform", "gpu", ""),
        Err(Error::NoMatchingDevice { .. })
    ));
    assert!(matches!(
        backend.initialize("", "gpu", "7"),
        Err(Error::NoMatchingDevice { .. })
    ));

    // A failed selection leaves the backend usable.
    backend.initialize("", "gpu", "").unwrap();
    assert_eq!(backend.device_count(), 1);
}

#[test]
fn test_unknown_device_type_rejected() {
    let driver = common::driver();
    let backend = common::backend(&driver);

    let err = backend.initialize("", "tpu", "").unwrap_err();
    assert!(matches!(err, Error::InvalidValue(_)));
    assert_eq!(err.code(), HipErrorCode::InvalidValue);
    assert!(!backend.is_initialized());
}

#[test]
fn test_driver_init_failure() {
    let driver = common::driver();
    let backend = common::backend(&driver);

    driver.inject_fault(DriverOp::Init, ZeResult::ErrorUninitialized);
    let err = backend.initialize("", "gpu", "").unwrap_err();
    assert_eq!(err.code(), HipErrorCode::NotInitialized);
    backend.initialize("", "gpu", "").unwrap();
}

#[test]
fn test_partial_initialization_rolls_back() {
    for op in [
        DriverOp::ContextCreate,
        DriverOp::CommandListCreate,
        DriverOp::CommandQueueCreate,
    ] {
        let driver = common::two_gpu_driver();
        let backend = common::backend(&driver);

        // The first device is fully built before the second one fails.
        driver.inject_fault_after(op, 1, ZeResult::ErrorOutOfDeviceMemory);
        let err = backend.initialize("", "gpu", "").unwrap_err();
        assert_eq!(err.native_status(), Some(ZeResult::ErrorOutOfDeviceMemory), "{op:?}");
        assert!(!backend.is_initialized());
        assert_eq!(backend.device_count(), 0);
        assert!(driver.live_objects().is_empty(), "{op:?}: {:?}", driver.live_objects());
    }
}

#[test]
fn test_initialize_twice_rejected() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);

    assert!(matches!(
        backend.initialize("", "gpu", ""),
        Err(Error::AlreadyInitialized)
    ));
    assert_eq!(backend.device_count(), 1);

    backend.uninitialize().unwrap();
    assert!(matches!(
        backend.initialize("", "gpu", ""),
        Err(Error::AlreadyInitialized)
    ));
}

#[test]
fn test_uninitialize_releases_everything() {
    let driver = common::two_gpu_driver();
    let backend = common::ready_backend(&driver);

    let src = vec![5u8; 4096];
    for index in 0..backend.device_count() {
        let device = backend.device(index).unwrap();
        let ctx = backend.context(index).unwrap();
        let _kernel = common::kernel(&backend, index, "fill_u32");
        let extra = device.create_queue().unwrap();
        let dst = ctx.allocate(src.len(), 0, MemoryKind::Device).unwrap();
        ctx.allocate(128, 64, MemoryKind::Shared).unwrap();
        unsafe {
            extra.mem_copy_async(dst.as_ptr(), src.as_ptr(), src.len()).unwrap();
        }
    }
    assert!(!driver.live_objects().is_empty());

    backend.uninitialize().unwrap();
    assert!(driver.live_objects().is_empty(), "{:?}", driver.live_objects());
    assert!(!backend.is_initialized());
    assert!(matches!(backend.device(0), Err(Error::NotInitialized)));
    assert_eq!(backend.default_queue(0).unwrap_err().code(), HipErrorCode::NotInitialized);

    // Second call is a no-op.
    backend.uninitialize().unwrap();
}

#[test]
fn test_uninitialize_before_initialize() {
    let driver = common::driver();
    let backend = common::backend(&driver);

    assert!(matches!(backend.uninitialize(), Err(Error::NotInitialized)));
    assert_eq!(backend.device_count(), 0);
    backend.initialize("", "gpu", "").unwrap();
}

#[test]
fn test_drop_releases_everything() {
    let driver = common::driver();
    {
        let backend = common::ready_backend(&driver);
        let ctx = backend.context(0).unwrap();
        ctx.allocate(1024, 0, MemoryKind::Host).unwrap();
        let _kernel = common::kernel(&backend, 0, "vector_add");
    }
    assert!(driver.live_objects().is_empty(), "{:?}", driver.live_objects());
}

#[test]
fn test_bad_device_index() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);

    assert!(matches!(backend.device(1), Err(Error::InvalidValue(_))));
    assert!(matches!(backend.context(3), Err(Error::InvalidValue(_))));
    assert!(backend.platform(0).is_ok());
}

#[test]
fn test_device_reset() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();
    let ctx = backend.context(0).unwrap();
    let queue = backend.default_queue(0).unwrap();
    let kernel = common::kernel(&backend, 0, "fill_u32");

    let n = 256u32;
    let dst = ctx.allocate(n as usize * 4, 0, MemoryKind::Device).unwrap();
    let args = kernel
        .function_info()
        .pack(&[&common::ptr_bytes(dst.as_ptr()), &9u32.to_ne_bytes(), &n.to_ne_bytes()])
        .unwrap();
    queue
        .launch(&ExecItem::new(Arc::clone(&kernel), 4, 64, args))
        .unwrap();

    device.reset().unwrap();
    assert_eq!(ctx.outstanding_allocations(), 0);
    assert!(device.modules().is_empty());
    assert_eq!(queue.in_flight(), 0);
    let live = driver.live_objects();
    assert_eq!((live.allocations, live.modules, live.kernels), (0, 0, 0));

    // The context and queues survive a reset.
    let src = [1u8, 2, 3, 4];
    let dst = ctx.allocate(src.len(), 0, MemoryKind::Host).unwrap();
    unsafe {
        queue.mem_copy(dst.as_ptr(), src.as_ptr(), src.len()).unwrap();
        assert_eq!(common::read::<u8>(dst.as_ptr(), 4), src);
    }
}

#[test]
fn test_initialize_with_config() {
    let driver = common::two_gpu_driver();
    let config = ConfigLoader::new()
        .with_str("device_type = \"gpu\"\ndevice = \"GPU B\"\n")
        .load()
        .unwrap();

    let backend = common::backend(&driver);
    backend.initialize_with_config(&config).unwrap();
    assert_eq!(names(&backend), ["GPU B"]);
}

#[test]
fn test_initialize_with_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chip.toml");
    std::fs::write(&path, "platform = \"host level zero\"\ndevice = \"0\"\n\n[log]\nlevel = \"debug\"\n")
        .unwrap();

    let driver = common::two_gpu_driver();
    let config = ConfigLoader::new().with_file(&path).load().unwrap();
    let backend = common::backend(&driver);
    backend.initialize_with_config(&config).unwrap();
    assert_eq!(names(&backend), ["GPU A"]);
}
