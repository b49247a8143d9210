//! Module compilation and kernel lookup against the host driver

mod common;

use std::sync::Arc;

use chip_level0::{Error, FunctionInfo, HipErrorCode, KernelBlob};
use chip_ze::host::module_binary;
use chip_ze::{DriverOp, ModuleFormat, ZeResult};

#[test]
fn test_compile_is_idempotent() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();
    let module = device.add_module(common::blob());

    module.compile(&device).unwrap();
    let handle = module.native_handle(&device);
    module.compile(&device).unwrap();

    assert_eq!(module.native_handle(&device), handle);
    assert_eq!(driver.stats().modules_built, 1);
    assert_eq!(module.kernels(&device).len(), common::KERNEL_NAMES.len());
    assert_eq!(driver.live_objects().kernels, common::KERNEL_NAMES.len());
}

#[test]
fn test_concurrent_compile_builds_once() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();
    let module = device.add_module(common::blob());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| module.compile(&device).unwrap());
        }
    });

    assert_eq!(driver.stats().modules_built, 1);
    assert!(module.get_kernel(&device, "vector_add").is_ok());
}

#[test]
fn test_two_devices_get_independent_modules() {
    let driver = common::two_gpu_driver();
    let backend = common::ready_backend(&driver);
    let (a, b) = (backend.device(0).unwrap(), backend.device(1).unwrap());
    let module = a.add_module(common::blob());

    module.compile(&a).unwrap();
    assert!(module.is_compiled_for(&a));
    assert!(!module.is_compiled_for(&b));
    module.compile(&b).unwrap();

    assert_ne!(module.native_handle(&a), module.native_handle(&b));
    let ka = module.get_kernel(&a, "fill_u32").unwrap();
    let kb = module.get_kernel(&b, "fill_u32").unwrap();
    assert_eq!(ka.device(), a.handle());
    assert_eq!(kb.device(), b.handle());
    assert_ne!(ka.handle(), kb.handle());
    assert_eq!(driver.stats().modules_built, 2);

    // Teardown releases the compiled state for both devices.
    backend.uninitialize().unwrap();
    assert!(driver.live_objects().is_empty());
}

#[test]
fn test_bad_binary_reports_build_log() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();

    let module = device.add_module(Arc::new(KernelBlob::new(b"\x03\x02\x23\x07garbage".to_vec())));
    let err = module.compile(&device).unwrap_err();
    match &err {
        Error::Compile { status, log } => {
            assert_eq!(*status, ZeResult::ErrorModuleBuildFailure);
            assert!(log.contains("not a host module"), "log: {log}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.code(), HipErrorCode::InvalidImage);
    assert!(!module.is_compiled_for(&device));

    let native = device.add_module(Arc::new(KernelBlob::with_format(
        b"not native".to_vec(),
        ModuleFormat::Native,
    )));
    assert!(matches!(
        native.compile(&device),
        Err(Error::Compile { status: ZeResult::ErrorInvalidNativeBinary, .. })
    ));
    assert_eq!(driver.live_objects().modules, 0);
}

#[test]
fn test_unresolved_symbol_in_log() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();

    let blob = KernelBlob::new(module_binary(&["vector_add", "missing_kernel"]))
        .with_function("vector_add", common::vector_add_info())
        .with_function("missing_kernel", FunctionInfo::default());
    let module = device.add_module(Arc::new(blob));

    let Err(Error::Compile { log, .. }) = module.compile(&device) else {
        panic!("compile should fail");
    };
    assert!(log.contains("unresolved kernel symbol 'missing_kernel'"), "log: {log}");
    assert_eq!(driver.live_objects().modules, 0);
}

#[test]
fn test_missing_function_info_rolls_back() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();

    let blob = KernelBlob::new(module_binary(&["vector_add", "fill_u32"]))
        .with_function("vector_add", common::vector_add_info());
    let module = device.add_module(Arc::new(blob));

    let err = module.compile(&device).unwrap_err();
    assert!(matches!(
        &err,
        Error::Compile { status: ZeResult::ErrorInvalidKernelName, log } if log.contains("fill_u32")
    ));
    let live = driver.live_objects();
    assert_eq!(live.kernels, 0);
    assert_eq!(live.modules, 0);
    assert!(!module.is_compiled_for(&device));
}

#[test]
fn test_kernel_create_failure_rolls_back() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();
    let module = device.add_module(common::blob());

    driver.inject_fault_after(DriverOp::KernelCreate, 2, ZeResult::ErrorOutOfHostMemory);
    let err = module.compile(&device).unwrap_err();
    assert_eq!(err.native_status(), Some(ZeResult::ErrorOutOfHostMemory));
    assert_eq!(driver.live_objects().kernels, 0);
    assert_eq!(driver.live_objects().modules, 0);

    // Nothing was cached, so a retry builds again.
    module.compile(&device).unwrap();
    assert_eq!(module.kernels(&device).len(), common::KERNEL_NAMES.len());
}

#[test]
fn test_get_kernel_errors() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();
    let module = device.add_module(common::blob());

    let err = module.get_kernel(&device, "vector_add").unwrap_err();
    assert!(matches!(err, Error::NotCompiled(handle) if handle == device.handle()));
    assert_eq!(err.code(), HipErrorCode::NoBinaryForGpu);

    module.compile(&device).unwrap();
    let err = module.get_kernel(&device, "vector_sub").unwrap_err();
    assert!(matches!(&err, Error::KernelNotFound(name) if name == "vector_sub"));
    assert_eq!(err.code(), HipErrorCode::InvalidDeviceFunction);

    let kernel = module.get_kernel(&device, "vector_add").unwrap();
    assert_eq!(kernel.name(), "vector_add");
    assert_eq!(kernel.function_info().param_count(), 4);
    assert_eq!(kernel.module_handle(), module.native_handle(&device).unwrap());
}

#[test]
fn test_release_and_recompile() {
    let driver = common::driver();
    let backend = common::ready_backend(&driver);
    let device = backend.device(0).unwrap();
    let module = device.add_module(common::blob());

    module.compile(&device).unwrap();
    module.release(&device).unwrap();
    assert!(!module.is_compiled_for(&device));
    assert_eq!(driver.live_objects().kernels, 0);
    assert_eq!(driver.live_objects().modules, 0);

    // Releasing twice is harmless.
    module.release(&device).unwrap();

    module.compile(&device).unwrap();
    assert_eq!(driver.stats().modules_built, 2);
    assert_eq!(device.modules().len(), 1);
}
