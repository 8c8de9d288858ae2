//! Device-side building blocks of the kiln runtime.
//!
//! - [`Allocator`]: a device's ordinary tensor allocator.
//! - [`DeviceMemoryAllocator`]: real-buffer allocator used by compiled code,
//!   either owned ([`WrappingAllocator`]) or borrowed from a backend client.
//! - [`DeviceBuffer`] / [`ShapedBuffer`]: device memory handed to executables.
//! - [`Stream`]: ordered work queue of a device.
//! - [`Tensor`]: runtime values flowing between dataflow nodes.

pub mod allocator;
pub mod buffer;
pub mod error;
pub mod platform;
pub mod stream;
pub mod tensor;


pub use allocator::{
    Allocator, AllocatorAttributes, CpuAllocator, DeviceMemoryAllocator, RawBuffer, WrappingAllocator,
};
pub use buffer::{DeviceBuffer, ShapedBuffer};
pub use error::{Error, Result};
pub use platform::{DeviceKind, PlatformId};
pub use stream::{HostStream, Stream};
pub use tensor::{Element, ResourceHandle, Shape, Tensor};
