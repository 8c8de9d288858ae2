use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use kiln_device::{PlatformId, Shape, Tensor};
use kiln_dtype::DType;
use kiln_dtype::test::proptests::generators::dense_dtype;
use proptest::prelude::*;
use smallvec::smallvec;

use crate::client::{CompileOptions, CompilerArgument, OutputDescription};
use crate::compilation_cache::Signature;
use crate::error::ErrorKind;
use crate::function::{AttrValue, FunctionSpec};
use crate::resource::Resource;
use crate::test::support::{RecordingClient, compilation_cache};

fn param(dtype: DType, shape: Shape) -> CompilerArgument {
    CompilerArgument::Parameter { dtype, shape }
}

fn signature(function: &str, args: &[CompilerArgument]) -> Signature {
    Signature::new(&FunctionSpec::new(function), args).unwrap()
}

#[test]
fn test_equal_requests_share_artifact() {
    let client = RecordingClient::new(PlatformId::HOST);
    let cache = compilation_cache(&client);
    let args = [param(DType::Float32, smallvec![3])];

    let a = cache.compile(&CompileOptions::entry(), &FunctionSpec::new("identity"), &args).unwrap();
    let b = cache.compile(&CompileOptions::entry(), &FunctionSpec::new("identity"), &args).unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(client.compiles(), 1);
    assert_eq!(cache.len(), 1);
    let stats = cache.stats();
    assert_eq!((stats.requests, stats.compiles, stats.failed_compiles), (2, 1, 0));
    assert!(cache.debug_string().contains("compiles=1"));
}

#[test]
fn test_distinct_shapes_compile_separately() {
    let client = RecordingClient::new(PlatformId::HOST);
    let cache = compilation_cache(&client);
    let function = FunctionSpec::new("identity");

    let a = cache.compile(&CompileOptions::entry(), &function, &[param(DType::Int32, smallvec![2])]).unwrap();
    let b = cache.compile(&CompileOptions::entry(), &function, &[param(DType::Int32, smallvec![3])]).unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_ne!(a.fingerprint, b.fingerprint);
    assert_eq!(client.compiles(), 2);
}

#[test]
fn test_concurrent_requests_build_once() {
    let client = RecordingClient::new(PlatformId::HOST);
    client.set_delay(Duration::from_millis(50));
    let cache = Arc::new(compilation_cache(&client));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let args = [param(DType::Int64, smallvec![4])];
                cache.compile(&CompileOptions::entry(), &FunctionSpec::new("identity"), &args).unwrap()
            })
        })
        .collect();

    let artifacts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(artifacts.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(client.compiles(), 1);
    assert_eq!(cache.stats().requests, 8);
}

#[test]
fn test_failed_build_is_not_cached() {
    let client = RecordingClient::new(PlatformId::HOST);
    let cache = compilation_cache(&client);
    let function = FunctionSpec::new("identity");
    let args = [param(DType::Int32, Shape::new())];
    client.fail_next(1);

    let error = cache.compile(&CompileOptions::entry(), &function, &args).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Compiler);
    assert!(error.to_string().contains("injected failure"));
    assert!(cache.is_empty());
    assert_eq!(cache.entry_count(), 0);

    cache.compile(&CompileOptions::entry(), &function, &args).unwrap();
    assert_eq!(client.compiles(), 2);
    assert_eq!(cache.stats().failed_compiles, 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn test_failing_signatures_leave_no_entries() {
    let client = RecordingClient::new(PlatformId::HOST);
    let cache = compilation_cache(&client);
    client.fail_next(8);

    for rank in 0..8 {
        let args = [param(DType::Int32, smallvec![1; rank])];
        assert!(cache.compile(&CompileOptions::entry(), &FunctionSpec::new("identity"), &args).is_err());
    }
    assert_eq!(cache.stats().failed_compiles, 8);
    assert_eq!(cache.entry_count(), 0);
}

#[test]
fn test_waiters_retry_after_failed_build() {
    let client = RecordingClient::new(PlatformId::HOST);
    client.set_delay(Duration::from_millis(30));
    client.fail_next(1);
    let cache = Arc::new(compilation_cache(&client));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let args = [param(DType::Float64, smallvec![2])];
                cache.compile(&CompileOptions::entry(), &FunctionSpec::new("identity"), &args).is_ok()
            })
        })
        .collect();

    let succeeded = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
    // One builder fails; a waiter takes over and the rest share its artifact
    assert_eq!(succeeded, 3);
    assert_eq!(client.compiles(), 2);
    assert_eq!(cache.entry_count(), 1);
}

#[test]
fn test_constant_values_are_part_of_the_key() {
    let seven = signature("add", &[CompilerArgument::Constant(Tensor::scalar(7i32)), param(DType::Int32, Shape::new())]);
    let again = signature("add", &[CompilerArgument::Constant(Tensor::scalar(7i32)), param(DType::Int32, Shape::new())]);
    let eight = signature("add", &[CompilerArgument::Constant(Tensor::scalar(8i32)), param(DType::Int32, Shape::new())]);

    assert_eq!(seven, again);
    assert_eq!(seven.fingerprint(), again.fingerprint());
    assert_ne!(seven, eight);
}

#[test]
fn test_string_constants_are_hashed() {
    let a = signature("identity", &[CompilerArgument::Constant(Tensor::string_scalar("a"))]);
    let b = signature("identity", &[CompilerArgument::Constant(Tensor::string_scalar("b"))]);
    assert_ne!(a, b);
}

#[test]
fn test_resource_constant_rejected() {
    let handle = Tensor::resource(kiln_device::ResourceHandle::new("c", "v"));
    let error = Signature::new(&FunctionSpec::new("identity"), &[CompilerArgument::Constant(handle)]).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_uninitialized_differs_from_empty_shape() {
    let uninitialized = signature("assign", &[
        param(DType::Int32, Shape::new()),
        CompilerArgument::Resource { dtype: DType::Int32, shape: None },
    ]);
    let scalar = signature("assign", &[
        param(DType::Int32, Shape::new()),
        CompilerArgument::Resource { dtype: DType::Int32, shape: Some(Shape::new()) },
    ]);
    assert_ne!(uninitialized, scalar);
}

#[test]
fn test_function_attrs_are_part_of_the_key() {
    let args = [param(DType::Int32, Shape::new())];
    let plain = Signature::new(&FunctionSpec::new("identity"), &args).unwrap();
    let attributed =
        Signature::new(&FunctionSpec::new("identity").with_attr("T", AttrValue::DType(DType::Int32)), &args).unwrap();
    assert_eq!(plain.function(), "identity");
    assert_eq!(attributed.function(), "identity[T=int32]");
    assert_ne!(plain, attributed);
}

#[test]
fn test_constant_outputs_skip_the_executable() {
    let client = RecordingClient::new(PlatformId::HOST);
    let cache = compilation_cache(&client);
    let args = [CompilerArgument::Constant(Tensor::scalar(2i32)), CompilerArgument::Constant(Tensor::scalar(3i32))];

    let artifact = cache.compile(&CompileOptions::entry(), &FunctionSpec::new("add"), &args).unwrap();
    let result = &artifact.compilation_result;
    assert!(result.input_mapping.is_empty());
    assert_eq!(result.num_result_buffers(), 0);
    let OutputDescription::Constant(value) = &result.outputs[0] else {
        panic!("expected a folded output, got {:?}", result.outputs[0]);
    };
    assert_eq!(value.to_vec::<i32>().unwrap(), vec![5]);
}

fn arb_args() -> impl Strategy<Value = Vec<(DType, Vec<usize>, bool)>> {
    prop::collection::vec((dense_dtype(), prop::collection::vec(0usize..5, 0..3), any::<bool>()), 0..4)
}

fn to_arguments(layout: &[(DType, Vec<usize>, bool)]) -> Vec<CompilerArgument> {
    layout.iter()
        .map(|(dtype, shape, resource)| match resource {
            true => CompilerArgument::Resource { dtype: *dtype, shape: Some(Shape::from(shape.as_slice())) },
            false => param(*dtype, Shape::from(shape.as_slice())),
        })
        .collect()
}

proptest! {
    #[test]
    fn signature_is_deterministic(layout in arb_args()) {
        let a = signature("f", &to_arguments(&layout));
        let b = signature("f", &to_arguments(&layout));
        prop_assert_eq!(a.fingerprint(), b.fingerprint());
        prop_assert_eq!(a, b);
    }

    #[test]
    fn signature_distinguishes_shapes(layout in arb_args(), extra in 1usize..5) {
        prop_assume!(!layout.is_empty());
        let mut changed = layout.clone();
        changed[0].1.push(extra);
        prop_assert_ne!(signature("f", &to_arguments(&layout)), signature("f", &to_arguments(&changed)));
    }
}
