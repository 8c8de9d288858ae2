use std::sync::Arc;

use kiln_device::{
    CpuAllocator, DeviceBuffer, HostStream, PlatformId, Shape, ShapedBuffer, Stream, Tensor, WrappingAllocator,
};
use kiln_dtype::DType;
use smallvec::smallvec;
use test_case::test_case;

use crate::client::{
    CompilationResult, CompileOptions, CompilerArgument, CompilerOptions, Executable, ExecutionOutput, LocalClient,
    OutputDescription, ResourceUpdate, RunOptions,
};
use crate::error::{ErrorKind, Result};
use crate::function::{FunctionDef, FunctionSpec, Primitive, ValueRef};
use crate::interpreter::{InterpreterClient, broadcast_shape};
use crate::test::support::library;

fn compile_with(
    compile_options: CompileOptions,
    function: &str,
    args: &[CompilerArgument],
) -> Result<(CompilationResult, Arc<dyn Executable>)> {
    let client = InterpreterClient::host(1);
    let mut flib_def = library();
    let mut negate = FunctionDef::new("negate", 1);
    let out = negate.unary(Primitive::Neg, ValueRef::Arg(0));
    flib_def.add(negate.output(out));
    flib_def.add(FunctionDef::new("dangling", 1).output(ValueRef::Node(3)));

    let options = CompilerOptions {
        client: Arc::new(InterpreterClient::host(1)),
        device_ordinal: -1,
        device_type: "JIT_CPU_JIT".to_string(),
        flib_def: Arc::new(flib_def),
        graph_def_version: 0,
        allow_cpu_custom_calls: true,
        device_allocator: client.backend_allocator(),
        shape_representation_fn: None,
    };
    client.compile(&options, &compile_options, &FunctionSpec::new(function), args)
}

fn compile(function: &str, args: &[CompilerArgument]) -> Result<(CompilationResult, Arc<dyn Executable>)> {
    compile_with(CompileOptions::entry(), function, args)
}

fn param(dtype: DType, shape: &[usize]) -> CompilerArgument {
    CompilerArgument::Parameter { dtype, shape: Shape::from(shape) }
}

fn run_options(stream: Option<Arc<dyn Stream>>) -> RunOptions {
    RunOptions {
        stream,
        allocator: Arc::new(WrappingAllocator::new(PlatformId::HOST, Arc::new(CpuAllocator))),
        intra_op_threads: 1,
        rng_seed: 0,
        device_ordinal: 0,
    }
}

fn arg(tensor: Tensor) -> ShapedBuffer {
    let allocator = Arc::new(WrappingAllocator::new(PlatformId::HOST, Arc::new(CpuAllocator)));
    let buffer = DeviceBuffer::from_host(allocator, 0, &tensor.host_bytes().unwrap()).unwrap();
    ShapedBuffer::new(buffer, tensor.dtype(), tensor.shape()).unwrap()
}

fn single(output: ExecutionOutput) -> Tensor {
    match output {
        ExecutionOutput::Single(buffer) => Tensor::from_device(buffer),
        ExecutionOutput::Tuple(buffers) => panic!("expected a single buffer, got {}", buffers.len()),
    }
}

#[test]
fn test_parameters_are_mapped() {
    let (result, executable) = compile("add", &[param(DType::Int64, &[3]), param(DType::Int64, &[3])]).unwrap();
    assert_eq!(result.input_mapping, vec![0, 1]);
    assert!(matches!(
        &result.outputs[0],
        OutputDescription::Computed { dtype: DType::Int64, shape } if shape.as_slice() == [3]
    ));

    let lhs = arg(Tensor::from_slice(vec![3], &[1i64, 2, 3]).unwrap());
    let rhs = arg(Tensor::from_slice(vec![3], &[10i64, 20, 30]).unwrap());
    let output = single(executable.run(&[lhs, rhs], &run_options(None)).unwrap());
    assert_eq!(output.to_vec::<i64>().unwrap(), vec![11, 22, 33]);
}

#[test]
fn test_constants_are_folded() {
    let args = [CompilerArgument::Constant(Tensor::scalar(3.0f32)), param(DType::Float32, &[2])];
    let (result, executable) = compile("scale", &args).unwrap();
    assert_eq!(result.input_mapping, vec![1]);

    let x = arg(Tensor::from_slice(vec![2], &[1.5f32, -2.0]).unwrap());
    let output = single(executable.run(&[x], &run_options(None)).unwrap());
    assert_eq!(output.to_vec::<f32>().unwrap(), vec![4.5, -6.0]);
}

#[test]
fn test_constants_passed_when_not_resolved() {
    let options = CompileOptions { resolve_compile_time_constants: false, ..CompileOptions::entry() };
    let args = [CompilerArgument::Constant(Tensor::scalar(3i32)), param(DType::Int32, &[])];
    let (result, _) = compile_with(options, "add", &args).unwrap();
    assert_eq!(result.input_mapping, vec![0, 1]);
    assert!(matches!(result.outputs[0], OutputDescription::Computed { .. }));
}

#[test]
fn test_always_return_tuple() {
    let options = CompileOptions { always_return_tuple: true, ..CompileOptions::entry() };
    let (_, executable) = compile_with(options, "identity", &[param(DType::Int32, &[])]).unwrap();
    let output = executable.run(&[arg(Tensor::scalar(4i32))], &run_options(None)).unwrap();
    assert!(matches!(output, ExecutionOutput::Tuple(ref buffers) if buffers.len() == 1));
}

#[test]
fn test_resource_updates_follow_outputs() {
    let resource = CompilerArgument::Resource { dtype: DType::Int32, shape: Some(smallvec![2]) };
    let (result, executable) = compile("accumulate", &[param(DType::Int32, &[2]), resource]).unwrap();
    assert_eq!(result.input_mapping, vec![0, 1]);
    let update = ResourceUpdate { input_index: 1, dtype: DType::Int32, shape: smallvec![2] };
    assert_eq!(result.resource_updates, vec![update]);
    assert_eq!(result.num_result_buffers(), 2);

    let x = arg(Tensor::from_slice(vec![2], &[1i32, 1]).unwrap());
    let v = arg(Tensor::from_slice(vec![2], &[5i32, 6]).unwrap());
    let buffers = executable.run(&[x, v], &run_options(None)).unwrap().into_buffers();
    assert_eq!(buffers.len(), 2);
    for buffer in buffers {
        assert_eq!(Tensor::from_device(buffer).to_vec::<i32>().unwrap(), vec![6, 7]);
    }
}

#[test]
fn test_uninitialized_resource_may_be_written() {
    let args = [param(DType::Int32, &[]), CompilerArgument::Resource { dtype: DType::Int32, shape: None }];
    let (result, _) = compile("assign", &args).unwrap();
    assert_eq!(result.input_mapping, vec![0, 1]);
    assert_eq!(result.resource_updates[0].input_index, 1);
}

#[test]
fn test_missing_variable_takes_any_update_dtype() {
    let args = [param(DType::Float32, &[2]), CompilerArgument::Resource { dtype: DType::Resource, shape: None }];
    let (result, _) = compile("assign", &args).unwrap();
    let update = &result.resource_updates[0];
    assert_eq!((update.input_index, update.dtype), (1, DType::Float32));
    assert_eq!(update.shape.as_slice(), &[2]);
}

#[test]
fn test_uninitialized_resource_cannot_be_read() {
    let args = [param(DType::Int32, &[]), CompilerArgument::Resource { dtype: DType::Int32, shape: None }];
    let error = compile("accumulate", &args).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Compiler);
    assert!(error.to_string().contains("uninitialized"));
}

#[test]
fn test_update_dtype_must_match_resource() {
    let args = [param(DType::Float32, &[]), CompilerArgument::Resource { dtype: DType::Int32, shape: None }];
    assert_eq!(compile("assign", &args).unwrap_err().kind(), ErrorKind::Compiler);
}

#[test_case("missing", &[param(DType::Int32, &[])]; "unknown function")]
#[test_case("add", &[param(DType::Int32, &[])]; "wrong arity")]
#[test_case("add", &[param(DType::Int32, &[]), param(DType::Float32, &[])]; "mixed dtypes")]
#[test_case("add", &[param(DType::Int32, &[2]), param(DType::Int32, &[3])]; "incompatible shapes")]
#[test_case("add", &[param(DType::UInt8, &[]), param(DType::UInt8, &[])]; "unsupported dtype")]
#[test_case("dangling", &[param(DType::Int32, &[])]; "dangling reference")]
fn test_compile_errors(function: &str, args: &[CompilerArgument]) {
    assert_eq!(compile(function, args).unwrap_err().kind(), ErrorKind::Compiler);
}

#[test]
fn test_identity_accepts_any_dense_dtype() {
    let (_, executable) = compile("identity", &[param(DType::UInt8, &[3])]).unwrap();
    let x = arg(Tensor::from_slice(vec![3], &[1u8, 2, 3]).unwrap());
    assert_eq!(single(executable.run(&[x], &run_options(None)).unwrap()).to_vec::<u8>().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_scalar_broadcasts() {
    let (result, executable) = compile("add", &[param(DType::Float64, &[]), param(DType::Float64, &[3])]).unwrap();
    assert!(matches!(&result.outputs[0], OutputDescription::Computed { shape, .. } if shape.as_slice() == [3]));

    let a = arg(Tensor::scalar(0.5f64));
    let b = arg(Tensor::from_slice(vec![3], &[1.0f64, 2.0, 3.0]).unwrap());
    let output = single(executable.run(&[a, b], &run_options(None)).unwrap());
    assert_eq!(output.to_vec::<f64>().unwrap(), vec![1.5, 2.5, 3.5]);
}

#[test]
fn test_negate_folds_to_constant() {
    let (result, _) = compile("negate", &[CompilerArgument::Constant(Tensor::scalar(i32::MIN))]).unwrap();
    let OutputDescription::Constant(value) = &result.outputs[0] else {
        panic!("expected a folded output");
    };
    // Integer arithmetic wraps
    assert_eq!(value.to_vec::<i32>().unwrap(), vec![i32::MIN]);
}

#[test]
fn test_run_rejects_mismatched_arguments() {
    let (_, executable) = compile("identity", &[param(DType::Int32, &[2])]).unwrap();

    let error = executable.run(&[], &run_options(None)).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Runtime);

    let wrong_shape = arg(Tensor::from_slice(vec![3], &[1i32, 2, 3]).unwrap());
    let error = executable.run(&[wrong_shape], &run_options(None)).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Runtime);
}

#[test]
fn test_run_completes_stream_work() {
    let stream = Arc::new(HostStream::new(PlatformId::HOST, 0));
    let shared: Arc<dyn Stream> = stream.clone();
    let (_, executable) = compile("identity", &[param(DType::Int32, &[])]).unwrap();

    executable.run(&[arg(Tensor::scalar(1i32))], &run_options(Some(shared.clone()))).unwrap();
    assert_eq!(stream.submitted(), 1);
    stream.block_host_until_done(1).unwrap();

    // Failed runs still complete their ticket
    executable.run(&[], &run_options(Some(shared))).unwrap_err();
    assert_eq!(stream.submitted(), 2);
    stream.block_host_until_done(1).unwrap();
}

#[test_case(&[], &[], Some(&[]); "scalars")]
#[test_case(&[2, 3], &[2, 3], Some(&[2, 3]); "equal")]
#[test_case(&[2, 3], &[], Some(&[2, 3]); "scalar rhs")]
#[test_case(&[], &[4], Some(&[4]); "scalar lhs")]
#[test_case(&[2, 3], &[3], None; "no general broadcasting")]
fn test_broadcast_shape(lhs: &[usize], rhs: &[usize], expected: Option<&[usize]>) {
    assert_eq!(broadcast_shape(lhs, rhs).as_deref(), expected);
}
