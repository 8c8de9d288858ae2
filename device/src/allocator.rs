use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::platform::PlatformId;

/// Owned host-visible backing memory handed out by allocators.
#[derive(Debug, Default)]
pub struct RawBuffer {
    data: Box<[u8]>,
}

impl RawBuffer {
    /// Zero-initialized buffer of `size` bytes.
    pub fn zeroed(size: usize) -> Self {
        Self { data: vec![0u8; size].into_boxed_slice() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Attributes a kernel passes when asking its device for an allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocatorAttributes {
    /// Memory must be host resident even on an accelerator device.
    pub on_host: bool,
    /// Host memory must be pinned so a GPU can read it without staging.
    pub gpu_compatible: bool,
}

impl AllocatorAttributes {
    /// Host-resident, GPU-compatible memory: what small control tensors use.
    pub const fn host_gpu_compatible() -> Self {
        Self { on_host: true, gpu_compatible: true }
    }
}

/// Tensor allocator of a device, as seen by ordinary kernels.
///
/// On accelerator-device kinds this allocator may only produce placeholders,
/// which is why compiled code allocates through a [`DeviceMemoryAllocator`].
pub trait Allocator: Send + Sync + fmt::Debug {
    fn alloc(&self, size: usize) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer) {}
    fn name(&self) -> &str;
}

/// CPU allocator using system memory.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize) -> Result<RawBuffer> {
        Ok(RawBuffer::zeroed(size))
    }

    fn name(&self) -> &str {
        "CPU"
    }
}

/// Allocator producing real device buffers for compiled executables.
pub trait DeviceMemoryAllocator: Send + Sync + fmt::Debug {
    /// Platform whose memory this allocator hands out.
    fn platform_id(&self) -> PlatformId;

    fn allocate(&self, device_ordinal: i32, size: usize) -> Result<RawBuffer>;

    fn deallocate(&self, _device_ordinal: i32, _buffer: RawBuffer) {}

    fn name(&self) -> &str;
}

/// Device-memory allocator built over a device's ordinary tensor allocator.
///
/// Used on CPU and GPU devices, where the tensor allocator already returns
/// real memory.
#[derive(Debug)]
pub struct WrappingAllocator {
    platform: PlatformId,
    inner: Arc<dyn Allocator>,
    name: String,
}

impl WrappingAllocator {
    pub fn new(platform: PlatformId, inner: Arc<dyn Allocator>) -> Self {
        let name = format!("{}:{}", platform, inner.name());
        Self { platform, inner, name }
    }

    /// The wrapped tensor allocator.
    pub fn inner(&self) -> &Arc<dyn Allocator> {
        &self.inner
    }
}

impl DeviceMemoryAllocator for WrappingAllocator {
    fn platform_id(&self) -> PlatformId {
        self.platform
    }

    fn allocate(&self, _device_ordinal: i32, size: usize) -> Result<RawBuffer> {
        self.inner.alloc(size)
    }

    fn deallocate(&self, _device_ordinal: i32, buffer: RawBuffer) {
        self.inner.free(buffer);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
