//! Runtime tensors as the dataflow executor sees them.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use kiln_dtype::{DType, NativeType};
use smallvec::SmallVec;
use snafu::ensure;

use crate::allocator::AllocatorAttributes;
use crate::buffer::{DeviceBuffer, ShapedBuffer};
use crate::error::{DTypeMismatchSnafu, NotDenseSnafu, Result, SizeMismatchSnafu, WrongStorageSnafu};

/// Tensor dimensions (stack-allocated for 0-4D tensors).
pub type Shape = SmallVec<[usize; 4]>;

/// Rust element types that can be viewed as dense tensor bytes.
pub trait Element: NativeType + bytemuck::Pod {}

impl<T: NativeType + bytemuck::Pod> Element for T {}

/// Address of a resource inside a resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    pub container: String,
    pub name: String,
}

impl ResourceHandle {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self { container: container.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Host(Arc<[u8]>),
    /// Backed by device memory. On accelerator-device kinds this is the
    /// placeholder form ordinary kernels cannot read directly.
    Device(DeviceBuffer),
    Strings(Arc<[String]>),
    Resources(Arc<[ResourceHandle]>),
}

/// Immutable, cheaply clonable tensor value.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    storage: Storage,
    attributes: AllocatorAttributes,
}

impl Tensor {
    /// Dense tensor from raw little-endian element bytes.
    pub fn from_bytes(dtype: DType, shape: impl Into<Shape>, bytes: Vec<u8>) -> Result<Self> {
        let shape = shape.into();
        let expected = dtype.byte_size(shape.iter().product()).ok_or_else(|| NotDenseSnafu { dtype }.build())?;
        ensure!(expected == bytes.len(), SizeMismatchSnafu { expected, actual: bytes.len() });
        Ok(Self { dtype, shape, storage: Storage::Host(bytes.into()), attributes: AllocatorAttributes::default() })
    }

    pub fn from_slice<T: Element>(shape: impl Into<Shape>, values: &[T]) -> Result<Self> {
        Self::from_bytes(T::DTYPE, shape, bytemuck::cast_slice(values).to_vec())
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        let bytes = bytemuck::bytes_of(&value).to_vec();
        Self { dtype: T::DTYPE, shape: Shape::new(), storage: Storage::Host(bytes.into()), attributes: Default::default() }
    }

    pub fn bool_scalar(value: bool) -> Self {
        Self {
            dtype: DType::Bool,
            shape: Shape::new(),
            storage: Storage::Host(vec![u8::from(value)].into()),
            attributes: AllocatorAttributes::default(),
        }
    }

    pub fn string_scalar(value: impl Into<String>) -> Self {
        Self {
            dtype: DType::String,
            shape: Shape::new(),
            storage: Storage::Strings(vec![value.into()].into()),
            attributes: AllocatorAttributes::default(),
        }
    }

    /// Scalar resource-handle tensor.
    pub fn resource(handle: ResourceHandle) -> Self {
        Self {
            dtype: DType::Resource,
            shape: Shape::new(),
            storage: Storage::Resources(vec![handle].into()),
            attributes: AllocatorAttributes::default(),
        }
    }

    /// Tensor whose backing storage is device memory. No copy is made.
    pub fn from_device(buffer: ShapedBuffer) -> Self {
        let ShapedBuffer { buffer, dtype, shape } = buffer;
        Self { dtype, shape, storage: Storage::Device(buffer), attributes: AllocatorAttributes::default() }
    }

    /// Record the allocator attributes this tensor was allocated with.
    pub fn with_attributes(mut self, attributes: AllocatorAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn attributes(&self) -> AllocatorAttributes {
        self.attributes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Byte size of the dense contents, `None` for strings and handles.
    pub fn byte_size(&self) -> Option<usize> {
        self.dtype.byte_size(self.num_elements())
    }

    /// Whether this tensor is backed by device memory.
    pub fn is_on_device(&self) -> bool {
        matches!(self.storage, Storage::Device(_))
    }

    pub fn device_buffer(&self) -> Option<&DeviceBuffer> {
        match &self.storage {
            Storage::Device(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Dense contents. Device-backed tensors are copied out.
    pub fn host_bytes(&self) -> Result<Cow<'_, [u8]>> {
        match &self.storage {
            Storage::Host(bytes) => Ok(Cow::Borrowed(bytes)),
            Storage::Device(buffer) => Ok(Cow::Owned(buffer.to_vec())),
            _ => WrongStorageSnafu { dtype: self.dtype, expected: "dense data" }.fail(),
        }
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        ensure!(self.dtype == T::DTYPE, DTypeMismatchSnafu { expected: T::DTYPE, actual: self.dtype });
        let bytes = self.host_bytes()?;
        Ok(bytes.chunks_exact(std::mem::size_of::<T>()).map(bytemuck::pod_read_unaligned).collect())
    }

    pub fn to_bool_vec(&self) -> Result<Vec<bool>> {
        ensure!(self.dtype == DType::Bool, DTypeMismatchSnafu { expected: DType::Bool, actual: self.dtype });
        Ok(self.host_bytes()?.iter().map(|b| *b != 0).collect())
    }

    pub fn strings(&self) -> Result<&[String]> {
        match &self.storage {
            Storage::Strings(values) => Ok(values),
            _ => WrongStorageSnafu { dtype: self.dtype, expected: "strings" }.fail(),
        }
    }

    /// The handle held by a scalar resource tensor.
    pub fn resource_handle(&self) -> Result<&ResourceHandle> {
        match &self.storage {
            Storage::Resources(handles) if handles.len() == 1 => Ok(&handles[0]),
            _ => WrongStorageSnafu { dtype: self.dtype, expected: "a resource handle" }.fail(),
        }
    }
}
