//! Per-kernel record of the platform a JIT kernel targets.

use std::fmt;
use std::sync::Arc;

use kiln_device::{DeviceKind, DeviceMemoryAllocator, PlatformId, WrappingAllocator};

use crate::client::{LocalClient, ShapeRepresentationFn};
use crate::context::JitDevice;
use crate::error::{Result, UnsupportedDeviceSnafu};

/// Long-lived record exposed by accelerator devices.
///
/// Accelerator-device kinds hand ordinary kernels opaque placeholder tensors;
/// this record gives the JIT kernels the backend client and its real-buffer
/// allocator instead.
#[derive(Clone)]
pub struct DeviceMetadata {
    pub platform_id: PlatformId,
    pub client: Arc<dyn LocalClient>,
    /// Compilation device name used for this device.
    pub jit_device_type: String,
    pub shape_representation_fn: Option<ShapeRepresentationFn>,
    pub use_multiple_streams: bool,
}

impl DeviceMetadata {
    pub fn new(client: Arc<dyn LocalClient>, jit_device_type: impl Into<String>) -> Self {
        Self {
            platform_id: client.platform_id(),
            client,
            jit_device_type: jit_device_type.into(),
            shape_representation_fn: None,
            use_multiple_streams: false,
        }
    }

    pub fn with_shape_representation_fn(mut self, f: ShapeRepresentationFn) -> Self {
        self.shape_representation_fn = Some(f);
        self
    }

    pub fn with_multiple_streams(mut self, enabled: bool) -> Self {
        self.use_multiple_streams = enabled;
        self
    }
}

impl fmt::Debug for DeviceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMetadata")
            .field("platform_id", &self.platform_id)
            .field("jit_device_type", &self.jit_device_type)
            .field("shape_representation_fn", &self.shape_representation_fn.is_some())
            .field("use_multiple_streams", &self.use_multiple_streams)
            .finish()
    }
}

/// Where the real-buffer allocator comes from. Exactly one source is active.
#[derive(Debug, Clone)]
enum AllocatorSource {
    /// Built over the device's own allocator (CPU and GPU).
    Owned(Arc<WrappingAllocator>),
    /// Taken from the accelerator's backend client.
    Borrowed(Arc<dyn DeviceMemoryAllocator>),
}

/// Immutable platform description built once per kernel.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    device_kind: DeviceKind,
    platform_id: PlatformId,
    metadata: Option<Arc<DeviceMetadata>>,
    allocator: AllocatorSource,
}

impl PlatformInfo {
    /// Resolve the platform of `device`.
    ///
    /// # Errors
    ///
    /// Fails with "unsupported device" when the device is neither CPU nor GPU
    /// and exposes no accelerator metadata, or is a GPU without a stream.
    pub fn from_device(device: &JitDevice) -> Result<Self> {
        let owned = |platform_id: PlatformId| {
            AllocatorSource::Owned(Arc::new(WrappingAllocator::new(platform_id, Arc::clone(&device.allocator))))
        };

        match &device.kind {
            DeviceKind::Cpu => Ok(Self {
                device_kind: DeviceKind::Cpu,
                platform_id: PlatformId::HOST,
                metadata: None,
                allocator: owned(PlatformId::HOST),
            }),
            DeviceKind::Gpu => {
                let stream = device.stream.as_ref().ok_or_else(|| {
                    UnsupportedDeviceSnafu { device: format!("{} (GPU without a stream)", device.name) }.build()
                })?;
                let platform_id = stream.platform_id();
                Ok(Self { device_kind: DeviceKind::Gpu, platform_id, metadata: None, allocator: owned(platform_id) })
            }
            kind => {
                let metadata = device.metadata.clone().ok_or_else(|| {
                    UnsupportedDeviceSnafu { device: format!("{} of kind {kind}", device.name) }.build()
                })?;
                Ok(Self {
                    device_kind: kind.clone(),
                    platform_id: metadata.platform_id,
                    allocator: AllocatorSource::Borrowed(metadata.client.backend_allocator()),
                    metadata: Some(metadata),
                })
            }
        }
    }

    pub fn device_kind(&self) -> &DeviceKind {
        &self.device_kind
    }

    pub fn platform_id(&self) -> PlatformId {
        self.platform_id
    }

    pub fn metadata(&self) -> Option<&Arc<DeviceMetadata>> {
        self.metadata.as_ref()
    }

    /// The active real-buffer allocator.
    pub fn allocator(&self) -> Arc<dyn DeviceMemoryAllocator> {
        match &self.allocator {
            AllocatorSource::Owned(wrapping) => Arc::clone(wrapping) as Arc<dyn DeviceMemoryAllocator>,
            AllocatorSource::Borrowed(allocator) => Arc::clone(allocator),
        }
    }

    /// Whether the allocator is the owned wrapping allocator.
    pub fn owns_allocator(&self) -> bool {
        matches!(self.allocator, AllocatorSource::Owned(_))
    }

    pub fn is_on_accelerator_device(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn use_multiple_streams(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.use_multiple_streams)
    }

    pub fn shape_representation_fn(&self) -> Option<&ShapeRepresentationFn> {
        self.metadata.as_ref().and_then(|m| m.shape_representation_fn.as_ref())
    }
}
