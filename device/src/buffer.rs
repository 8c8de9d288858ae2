use std::fmt;
use std::sync::Arc;

use kiln_dtype::DType;
use parking_lot::RwLock;
use snafu::ensure;
use tracing::trace;

use crate::allocator::{DeviceMemoryAllocator, RawBuffer};
use crate::error::{NotDenseSnafu, Result, SizeMismatchSnafu};
use crate::tensor::Shape;

/// Shared buffer data that can be referenced by multiple handles.
struct BufferData {
    raw: RwLock<RawBuffer>,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    device_ordinal: i32,
}

impl Drop for BufferData {
    fn drop(&mut self) {
        let raw = std::mem::take(self.raw.get_mut());
        self.allocator.deallocate(self.device_ordinal, raw);
    }
}

/// Device memory obtained from a [`DeviceMemoryAllocator`].
///
/// Cloning shares the allocation; the memory goes back to its allocator when
/// the last handle is dropped.
#[derive(Clone)]
pub struct DeviceBuffer {
    data: Arc<BufferData>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("allocator", &self.data.allocator.name())
            .field("device_ordinal", &self.data.device_ordinal)
            .field("size", &self.size())
            .finish()
    }
}

impl DeviceBuffer {
    /// Allocate `size` zeroed bytes.
    pub fn allocate(allocator: Arc<dyn DeviceMemoryAllocator>, device_ordinal: i32, size: usize) -> Result<Self> {
        let raw = allocator.allocate(device_ordinal, size)?;
        ensure!(raw.len() == size, SizeMismatchSnafu { expected: size, actual: raw.len() });
        trace!(allocator = allocator.name(), device_ordinal, size, "device buffer allocated");
        Ok(Self { data: Arc::new(BufferData { raw: RwLock::new(raw), allocator, device_ordinal }) })
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn from_host(allocator: Arc<dyn DeviceMemoryAllocator>, device_ordinal: i32, bytes: &[u8]) -> Result<Self> {
        let buffer = Self::allocate(allocator, device_ordinal, bytes.len())?;
        buffer.copyin(bytes)?;
        Ok(buffer)
    }

    pub fn size(&self) -> usize {
        self.data.raw.read().len()
    }

    pub fn device_ordinal(&self) -> i32 {
        self.data.device_ordinal
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceMemoryAllocator> {
        &self.data.allocator
    }

    /// Copy data from host memory into this buffer.
    pub fn copyin(&self, src: &[u8]) -> Result<()> {
        let mut raw = self.data.raw.write();
        let expected = raw.len();
        let actual = src.len();
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });
        raw.as_mut_slice().copy_from_slice(src);
        Ok(())
    }

    /// Copy data from this buffer to host memory.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let raw = self.data.raw.read();
        let expected = raw.len();
        let actual = dst.len();
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });
        dst.copy_from_slice(raw.as_slice());
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.raw.read().as_slice().to_vec()
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_memory(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// A device buffer together with the logical type and shape of its contents.
#[derive(Debug, Clone)]
pub struct ShapedBuffer {
    pub buffer: DeviceBuffer,
    pub dtype: DType,
    pub shape: Shape,
}

impl ShapedBuffer {
    /// Wrap `buffer`, checking its size against `dtype` and `shape`.
    pub fn new(buffer: DeviceBuffer, dtype: DType, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        let num_elements = shape.iter().product::<usize>();
        let expected = dtype.byte_size(num_elements).ok_or_else(|| NotDenseSnafu { dtype }.build())?;
        let actual = buffer.size();
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });
        Ok(Self { buffer, dtype, shape })
    }

    /// Allocate an uninitialized-contents (zeroed) buffer for `dtype` and `shape`.
    pub fn allocate(
        allocator: Arc<dyn DeviceMemoryAllocator>,
        device_ordinal: i32,
        dtype: DType,
        shape: impl Into<Shape>,
    ) -> Result<Self> {
        let shape = shape.into();
        let num_elements = shape.iter().product::<usize>();
        let size = dtype.byte_size(num_elements).ok_or_else(|| NotDenseSnafu { dtype }.build())?;
        let buffer = DeviceBuffer::allocate(allocator, device_ordinal, size)?;
        Ok(Self { buffer, dtype, shape })
    }
}
