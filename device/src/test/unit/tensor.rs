use std::sync::Arc;

use kiln_dtype::DType;

use crate::{AllocatorAttributes, CpuAllocator, PlatformId, ResourceHandle, ShapedBuffer, Tensor, WrappingAllocator};

#[test]
fn test_from_slice() {
    let t = Tensor::from_slice(vec![2, 2], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(t.dtype(), DType::Float32);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.num_elements(), 4);
    assert_eq!(t.byte_size(), Some(16));
    assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_from_slice_shape_mismatch() {
    assert!(Tensor::from_slice(vec![3], &[1i32, 2]).is_err());
}

#[test]
fn test_scalar_has_empty_shape() {
    let t = Tensor::scalar(7i64);
    assert!(t.shape().is_empty());
    assert_eq!(t.num_elements(), 1);
    assert_eq!(t.to_vec::<i64>().unwrap(), vec![7]);
}

#[test]
fn test_to_vec_wrong_dtype() {
    let t = Tensor::scalar(1i32);
    assert!(t.to_vec::<f32>().is_err());
}

#[test]
fn test_bool_and_string_scalars() {
    assert_eq!(Tensor::bool_scalar(true).to_bool_vec().unwrap(), vec![true]);
    let key = Tensor::string_scalar("0");
    assert_eq!(key.dtype(), DType::String);
    assert_eq!(key.strings().unwrap(), &["0".to_string()]);
    assert!(key.host_bytes().is_err());
}

#[test]
fn test_resource_tensor() {
    let handle = ResourceHandle::new("localhost", "v");
    let t = Tensor::resource(handle.clone());
    assert_eq!(t.dtype(), DType::Resource);
    assert_eq!(t.resource_handle().unwrap(), &handle);
    assert_eq!(handle.to_string(), "localhost/v");
    assert!(Tensor::scalar(1.0f64).resource_handle().is_err());
}

#[test]
fn test_device_tensor_shares_buffer() {
    let allocator = Arc::new(WrappingAllocator::new(PlatformId::HOST, Arc::new(CpuAllocator)));
    let shaped = ShapedBuffer::allocate(allocator, 0, DType::Int32, vec![2]).unwrap();
    shaped.buffer.copyin(bytemuck::cast_slice(&[5i32, 6])).unwrap();
    let buffer = shaped.buffer.clone();

    let t = Tensor::from_device(shaped);
    assert!(t.is_on_device());
    assert!(t.device_buffer().unwrap().same_memory(&buffer));
    assert_eq!(t.to_vec::<i32>().unwrap(), vec![5, 6]);
}

#[test]
fn test_with_attributes() {
    let t = Tensor::scalar(1u8).with_attributes(AllocatorAttributes::host_gpu_compatible());
    assert!(t.attributes().on_host);
}
