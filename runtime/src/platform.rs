//! Accelerator platforms, their clients, and compilation-device registrations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kiln_device::PlatformId;
use parking_lot::RwLock;
use tracing::debug;

use crate::client::LocalClient;
use crate::error::{PlatformNotFoundSnafu, Result};

/// A backend able to create clients for its devices.
pub trait Platform: Send + Sync + fmt::Debug {
    fn id(&self) -> PlatformId;

    fn name(&self) -> &str;

    fn create_client(&self, options: &ClientOptions) -> Result<Arc<dyn LocalClient>>;
}

/// Options for [`PlatformRegistry::get_or_create_local_client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub platform: Arc<dyn Platform>,
    pub intra_op_parallelism: usize,
}

/// Compiler-side device a device kind lowers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationDevice {
    pub compilation_device_name: String,
}

/// Registry of platforms, cached clients and compilation devices.
///
/// Uses the same double-checked locking as device registries: lookups take a
/// read lock, client creation takes the write lock once per options value.
#[derive(Debug, Default)]
pub struct PlatformRegistry {
    platforms: RwLock<HashMap<PlatformId, Arc<dyn Platform>>>,
    clients: RwLock<HashMap<(PlatformId, usize), Arc<dyn LocalClient>>>,
    compilation_devices: RwLock<HashMap<String, CompilationDevice>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `platform`, replacing a platform with the same id.
    ///
    /// Clients already created for the replaced platform are dropped.
    pub fn register_platform(&self, platform: Arc<dyn Platform>) {
        let id = platform.id();
        self.clients.write().retain(|(platform_id, _), _| *platform_id != id);
        self.platforms.write().insert(id, platform);
    }

    pub fn platform_with_id(&self, id: PlatformId) -> Result<Arc<dyn Platform>> {
        self.platforms.read().get(&id).cloned().ok_or_else(|| PlatformNotFoundSnafu { platform: id }.build())
    }

    /// Get the client for `options`, creating it on first use.
    pub fn get_or_create_local_client(&self, options: &ClientOptions) -> Result<Arc<dyn LocalClient>> {
        let key = (options.platform.id(), options.intra_op_parallelism);

        // Fast path: read lock to check cache
        if let Some(client) = self.clients.read().get(&key) {
            return Ok(Arc::clone(client));
        }

        // Slow path: write lock to create
        let mut clients = self.clients.write();

        // Double-check after acquiring write lock (another thread may have created it)
        if let Some(client) = clients.get(&key) {
            return Ok(Arc::clone(client));
        }

        let client = options.platform.create_client(options)?;
        debug!(platform = %key.0, intra_op_parallelism = key.1, "local client created");
        clients.insert(key, Arc::clone(&client));
        Ok(client)
    }

    /// Register the compilation device used for kernels on `device_type`.
    ///
    /// The device type is case-insensitive.
    pub fn register_compilation_device(&self, device_type: &str, compilation_device_name: impl Into<String>) {
        self.compilation_devices.write().insert(
            device_type.to_uppercase(),
            CompilationDevice { compilation_device_name: compilation_device_name.into() },
        );
    }

    pub fn compilation_device(&self, device_type: &str) -> Option<CompilationDevice> {
        self.compilation_devices.read().get(&device_type.to_uppercase()).cloned()
    }
}
