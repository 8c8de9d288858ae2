use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use kiln_device::PlatformId;

use crate::client::LocalClient;
use crate::error::{ErrorKind, Result};
use crate::interpreter::{HOST_COMPILATION_DEVICE, HostPlatform, InterpreterClient};
use crate::jit_runtime::JitRuntime;
use crate::platform::{ClientOptions, Platform, PlatformRegistry};

/// Host platform counting the clients it creates.
#[derive(Debug, Default)]
struct CountingPlatform {
    created: AtomicUsize,
}

impl Platform for CountingPlatform {
    fn id(&self) -> PlatformId {
        PlatformId::HOST
    }

    fn name(&self) -> &str {
        "Counting"
    }

    fn create_client(&self, options: &ClientOptions) -> Result<Arc<dyn LocalClient>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InterpreterClient::host(options.intra_op_parallelism)))
    }
}

#[test]
fn test_unknown_platform() {
    let registry = PlatformRegistry::new();
    let error = registry.platform_with_id(PlatformId::CUDA).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NotFound);
}

#[test]
fn test_client_cached_per_options() {
    let registry = PlatformRegistry::new();
    let platform = Arc::new(CountingPlatform::default());
    registry.register_platform(platform.clone());

    let options = |threads| ClientOptions { platform: platform.clone(), intra_op_parallelism: threads };
    let a = registry.get_or_create_local_client(&options(2)).unwrap();
    let b = registry.get_or_create_local_client(&options(2)).unwrap();
    let c = registry.get_or_create_local_client(&options(4)).unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(platform.created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_client_created_once_under_contention() {
    let registry = Arc::new(PlatformRegistry::new());
    let platform = Arc::new(CountingPlatform::default());
    registry.register_platform(platform.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let platform: Arc<dyn Platform> = platform.clone();
            thread::spawn(move || {
                registry.get_or_create_local_client(&ClientOptions { platform, intra_op_parallelism: 1 }).unwrap()
            })
        })
        .collect();

    let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(clients.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(platform.created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reregistering_drops_clients() {
    let registry = PlatformRegistry::new();
    let first = Arc::new(CountingPlatform::default());
    registry.register_platform(first.clone());
    registry.get_or_create_local_client(&ClientOptions { platform: first.clone(), intra_op_parallelism: 1 }).unwrap();

    let second = Arc::new(CountingPlatform::default());
    registry.register_platform(second.clone());
    let platform = registry.platform_with_id(PlatformId::HOST).unwrap();
    assert_eq!(platform.name(), "Counting");
    registry.get_or_create_local_client(&ClientOptions { platform, intra_op_parallelism: 1 }).unwrap();

    assert_eq!(first.created.load(Ordering::SeqCst), 1);
    assert_eq!(second.created.load(Ordering::SeqCst), 1);
}

#[test]
fn test_compilation_device_case_insensitive() {
    let registry = PlatformRegistry::new();
    assert!(registry.compilation_device("gpu").is_none());

    registry.register_compilation_device("gpu", "JIT_GPU_JIT");
    assert_eq!(registry.compilation_device("GPU").unwrap().compilation_device_name, "JIT_GPU_JIT");
}

#[test]
fn test_runtime_registers_host() {
    let runtime = JitRuntime::builder().build();
    let platform = runtime.platforms().platform_with_id(PlatformId::HOST).unwrap();
    assert_eq!(platform.name(), HostPlatform.name());
    assert_eq!(
        runtime.platforms().compilation_device("CPU").unwrap().compilation_device_name,
        HOST_COMPILATION_DEVICE
    );

    let client = runtime
        .platforms()
        .get_or_create_local_client(&ClientOptions { platform, intra_op_parallelism: 3 })
        .unwrap();
    assert_eq!(client.platform_id(), PlatformId::HOST);
    assert_eq!(client.backend_allocator().platform_id(), PlatformId::HOST);
}
