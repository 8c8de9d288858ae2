//! The runtime handle threaded through every kernel invocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bon::bon;
use tracing::debug;

use crate::closure_store::ClosureStore;
use crate::config::JitConfig;
use crate::function::FunctionLibraryDefinition;
use crate::interpreter::{HOST_COMPILATION_DEVICE, HostPlatform};
use crate::platform::PlatformRegistry;

/// Process-level state of the JIT kernels.
///
/// Owns the closure store shared by the compile and run kernels, the platform
/// registry, the function library and the rng-seed sequence. Closures still
/// stored when the runtime is dropped are reported as leaks.
#[derive(Debug)]
pub struct JitRuntime {
    config: JitConfig,
    platforms: PlatformRegistry,
    closures: ClosureStore,
    library: Arc<FunctionLibraryDefinition>,
    graph_def_version: i32,
    launches: AtomicU64,
}

#[bon]
impl JitRuntime {
    /// Create a runtime with the host interpreter registered for `CPU`.
    #[builder]
    pub fn new(
        #[builder(default)] config: JitConfig,
        #[builder(default)] library: FunctionLibraryDefinition,
        #[builder(default)] graph_def_version: i32,
    ) -> Arc<Self> {
        let platforms = PlatformRegistry::new();
        platforms.register_platform(Arc::new(HostPlatform));
        platforms.register_compilation_device("CPU", HOST_COMPILATION_DEVICE);

        debug!(
            cache_name = %config.cache_name,
            rng_seed = config.rng_seed,
            functions = library.len(),
            "jit runtime created"
        );
        Arc::new(Self {
            closures: ClosureStore::new(config.warn_on_leaked_closures),
            config,
            platforms,
            library: Arc::new(library),
            graph_def_version,
            launches: AtomicU64::new(0),
        })
    }
}

impl JitRuntime {
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn platforms(&self) -> &PlatformRegistry {
        &self.platforms
    }

    pub fn closures(&self) -> &ClosureStore {
        &self.closures
    }

    pub fn function_library(&self) -> &Arc<FunctionLibraryDefinition> {
        &self.library
    }

    pub fn graph_def_version(&self) -> i32 {
        self.graph_def_version
    }

    /// Seed for the next executable run: `base + 2 * n` for the n-th call.
    pub fn next_rng_seed(&self) -> u64 {
        let n = self.launches.fetch_add(1, Ordering::Relaxed);
        self.config.rng_seed.wrapping_add(n.wrapping_mul(2))
    }
}
