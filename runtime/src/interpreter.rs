//! Host backend: compiles cluster functions into interpreted executables.
//!
//! Compilation resolves the function in the library, folds compile-time
//! constants through the body, infers every result's dtype and shape, and
//! records which node inputs the executable takes. Running evaluates the
//! remaining instructions over host copies of the argument buffers and
//! allocates the results through the run's allocator.

use std::sync::Arc;

use kiln_device::{
    CpuAllocator, DeviceBuffer, DeviceMemoryAllocator, Element, PlatformId, Shape, ShapedBuffer, Tensor,
    WrappingAllocator,
};
use kiln_dtype::DType;
use smallvec::SmallVec;
use snafu::{ResultExt, ensure};
use tracing::trace;

use crate::client::{
    CompilationResult, CompileOptions, CompilerArgument, CompilerOptions, Executable, ExecutionOutput, LocalClient,
    OutputDescription, ResourceUpdate, RunOptions,
};
use crate::error::{CompilationSnafu, DeviceSnafu, Error, ExecutionSnafu, Result};
use crate::function::{FunctionSpec, Instruction, Primitive, ValueRef};
use crate::platform::{ClientOptions, Platform};

/// Compilation device the host platform registers for `CPU` kernels.
pub const HOST_COMPILATION_DEVICE: &str = "JIT_CPU_JIT";

/// The host platform, backed by [`InterpreterClient`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn id(&self) -> PlatformId {
        PlatformId::HOST
    }

    fn name(&self) -> &str {
        "Host"
    }

    fn create_client(&self, options: &ClientOptions) -> Result<Arc<dyn LocalClient>> {
        Ok(Arc::new(InterpreterClient::host(options.intra_op_parallelism)))
    }
}

/// Client compiling clusters into [`InterpreterExecutable`]s.
#[derive(Debug)]
pub struct InterpreterClient {
    platform_id: PlatformId,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    intra_op_parallelism: usize,
}

impl InterpreterClient {
    pub fn new(platform_id: PlatformId, allocator: Arc<dyn DeviceMemoryAllocator>, intra_op_parallelism: usize) -> Self {
        Self { platform_id, allocator, intra_op_parallelism }
    }

    /// Client of the host platform using system memory.
    pub fn host(intra_op_parallelism: usize) -> Self {
        let allocator = Arc::new(WrappingAllocator::new(PlatformId::HOST, Arc::new(CpuAllocator)));
        Self::new(PlatformId::HOST, allocator, intra_op_parallelism)
    }

    pub fn intra_op_parallelism(&self) -> usize {
        self.intra_op_parallelism
    }
}

/// Compile-time view of a value.
#[derive(Debug, Clone)]
enum Symbol {
    Const(Tensor),
    Dynamic { dtype: DType, shape: Shape },
    /// Resource argument whose variable is uninitialized.
    Uninitialized,
}

impl LocalClient for InterpreterClient {
    fn platform_id(&self) -> PlatformId {
        self.platform_id
    }

    fn backend_allocator(&self) -> Arc<dyn DeviceMemoryAllocator> {
        Arc::clone(&self.allocator)
    }

    fn compile(
        &self,
        options: &CompilerOptions,
        compile_options: &CompileOptions,
        function: &FunctionSpec,
        args: &[CompilerArgument],
    ) -> Result<(CompilationResult, Arc<dyn Executable>)> {
        let fail = |reason: String| CompilationSnafu { function: function.canonical(), reason }.build();

        let def = options
            .flib_def
            .find(&function.name)
            .ok_or_else(|| fail(format!("function '{}' not found in library", function.name)))?;
        if def.num_args != args.len() {
            return Err(fail(format!("function takes {} arguments, node has {} inputs", def.num_args, args.len())));
        }

        let mut input_mapping = Vec::new();
        let mut params = Vec::new();
        let mut constant_args = vec![None; args.len()];
        let mut arg_symbols = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let symbol = match arg {
                CompilerArgument::Constant(value) if compile_options.resolve_compile_time_constants => {
                    constant_args[index] = Some(value.clone());
                    Symbol::Const(value.clone())
                }
                CompilerArgument::Constant(value) => {
                    Symbol::Dynamic { dtype: value.dtype(), shape: value.shape().into() }
                }
                CompilerArgument::Parameter { dtype, shape } => Symbol::Dynamic { dtype: *dtype, shape: shape.clone() },
                CompilerArgument::Resource { dtype, shape: Some(shape) } => {
                    Symbol::Dynamic { dtype: *dtype, shape: shape.clone() }
                }
                CompilerArgument::Resource { shape: None, .. } => Symbol::Uninitialized,
            };
            if !matches!(symbol, Symbol::Const(_)) {
                input_mapping.push(index);
                params.push(match &symbol {
                    Symbol::Dynamic { dtype, shape } => (*dtype, shape.clone()),
                    _ => (arg.dtype(), Shape::new()),
                });
            }
            arg_symbols.push(symbol);
        }

        let mut node_symbols: Vec<Symbol> = Vec::with_capacity(def.body.len());
        for (position, instruction) in def.body.iter().enumerate() {
            let symbol = infer(instruction, &arg_symbols, &node_symbols)
                .map_err(|error| fail(format!("instruction {position} ({}): {error}", instruction.op)))?;
            node_symbols.push(symbol);
        }
        let resolve = |value: &ValueRef| -> Result<(Option<Tensor>, DType, Shape)> {
            let symbol = match *value {
                ValueRef::Arg(index) => arg_symbols.get(index),
                ValueRef::Node(index) => node_symbols.get(index),
            };
            match symbol {
                Some(Symbol::Const(tensor)) => Ok((Some(tensor.clone()), tensor.dtype(), Shape::from(tensor.shape()))),
                Some(Symbol::Dynamic { dtype, shape }) => Ok((None, *dtype, shape.clone())),
                Some(Symbol::Uninitialized) => Err(fail(format!("read of uninitialized variable {value:?}"))),
                None => Err(fail(format!("dangling reference {value:?}"))),
            }
        };

        let mut outputs = Vec::with_capacity(def.outputs.len());
        let mut results = Vec::new();
        let mut result_types = Vec::new();
        for value in &def.outputs {
            match resolve(value)? {
                (Some(tensor), _, _) => outputs.push(OutputDescription::Constant(tensor)),
                (None, dtype, shape) => {
                    outputs.push(OutputDescription::Computed { dtype, shape: shape.clone() });
                    results.push(*value);
                    result_types.push((dtype, shape));
                }
            }
        }

        let mut resource_updates = Vec::with_capacity(def.resource_updates.len());
        for &(arg, value) in &def.resource_updates {
            let Some(CompilerArgument::Resource { dtype: variable_dtype, .. }) = args.get(arg) else {
                return Err(fail(format!("argument {arg} is updated but is not a resource")));
            };
            let (_, dtype, shape) = resolve(&value)?;
            if !variable_dtype.is_resource() && dtype != *variable_dtype {
                return Err(fail(format!("update of {variable_dtype} resource {arg} has dtype {dtype}")));
            }
            resource_updates.push(ResourceUpdate { input_index: arg, dtype, shape: shape.clone() });
            results.push(value);
            result_types.push((dtype, shape));
        }

        trace!(
            function = %function,
            params = params.len(),
            results = results.len(),
            folded = node_symbols.iter().filter(|s| matches!(s, Symbol::Const(_))).count(),
            "interpreter compiled"
        );

        let folded = node_symbols
            .into_iter()
            .map(|symbol| match symbol {
                Symbol::Const(tensor) => Some(tensor),
                _ => None,
            })
            .collect();
        let executable = InterpreterExecutable {
            function: function.canonical(),
            input_mapping: input_mapping.clone(),
            params,
            constant_args,
            body: def.body.clone(),
            folded,
            results,
            result_types,
            always_return_tuple: compile_options.always_return_tuple,
        };
        let result = CompilationResult { input_mapping, outputs, resource_updates };
        Ok((result, Arc::new(executable)))
    }
}

/// Infer (or fold) the result of one instruction.
fn infer(instruction: &Instruction, args: &[Symbol], nodes: &[Symbol]) -> Result<Symbol, String> {
    let op = instruction.op;
    if instruction.operands.len() != op.arity() {
        return Err(format!("expected {} operands, got {}", op.arity(), instruction.operands.len()));
    }

    let mut constants: SmallVec<[&Tensor; 2]> = SmallVec::new();
    let mut types: SmallVec<[(DType, Shape); 2]> = SmallVec::new();
    for value in &instruction.operands {
        let symbol = match *value {
            ValueRef::Arg(index) => args.get(index),
            ValueRef::Node(index) => nodes.get(index),
        };
        match symbol {
            Some(Symbol::Const(tensor)) => {
                constants.push(tensor);
                types.push((tensor.dtype(), tensor.shape().into()));
            }
            Some(Symbol::Dynamic { dtype, shape }) => types.push((*dtype, shape.clone())),
            Some(Symbol::Uninitialized) => return Err(format!("read of uninitialized variable {value:?}")),
            None => return Err(format!("dangling reference {value:?}")),
        }
    }

    if constants.len() == types.len() {
        return evaluate(op, &constants).map(Symbol::Const).map_err(|error| error.to_string());
    }

    let (dtype, shape) = types[0].clone();
    if op != Primitive::Identity && !supports_arithmetic(dtype) {
        return Err(format!("{op} does not support {dtype}"));
    }
    match types.get(1) {
        None => Ok(Symbol::Dynamic { dtype, shape }),
        Some((rhs_dtype, rhs_shape)) => {
            if *rhs_dtype != dtype {
                return Err(format!("operand dtypes differ: {dtype} vs {rhs_dtype}"));
            }
            let shape = broadcast_shape(&shape, rhs_shape)
                .ok_or_else(|| format!("incompatible shapes {shape:?} and {rhs_shape:?}"))?;
            Ok(Symbol::Dynamic { dtype, shape })
        }
    }
}

/// Executable produced by [`InterpreterClient`].
#[derive(Debug)]
pub struct InterpreterExecutable {
    function: String,
    input_mapping: Vec<usize>,
    /// Expected dtype and shape of each argument buffer.
    params: Vec<(DType, Shape)>,
    /// Folded constant inputs, by node input index.
    constant_args: Vec<Option<Tensor>>,
    body: Vec<Instruction>,
    /// Instruction results known at compile time.
    folded: Vec<Option<Tensor>>,
    /// Computed outputs followed by resource updates.
    results: Vec<ValueRef>,
    result_types: Vec<(DType, Shape)>,
    always_return_tuple: bool,
}

impl InterpreterExecutable {
    fn execute(&self, args: &[ShapedBuffer], options: &RunOptions) -> Result<Vec<ShapedBuffer>> {
        ensure!(
            args.len() == self.params.len(),
            ExecutionSnafu {
                reason: format!("{} takes {} arguments, got {}", self.function, self.params.len(), args.len())
            }
        );

        let mut arg_values = self.constant_args.clone();
        for (position, (buffer, &index)) in args.iter().zip(&self.input_mapping).enumerate() {
            let (dtype, shape) = &self.params[position];
            ensure!(
                buffer.dtype == *dtype && buffer.shape == *shape,
                ExecutionSnafu {
                    reason: format!(
                        "argument {position} is {}{:?}, compiled for {dtype}{shape:?}",
                        buffer.dtype, buffer.shape
                    )
                }
            );
            let value = Tensor::from_bytes(buffer.dtype, buffer.shape.clone(), buffer.buffer.to_vec());
            arg_values[index] = Some(value.context(DeviceSnafu)?);
        }

        let mut nodes = self.folded.clone();
        for (position, instruction) in self.body.iter().enumerate() {
            if nodes[position].is_some() {
                continue;
            }
            let value = {
                let operands = instruction
                    .operands
                    .iter()
                    .map(|value| lookup(value, &arg_values, &nodes))
                    .collect::<Result<SmallVec<[&Tensor; 2]>>>()?;
                evaluate(instruction.op, &operands)?
            };
            nodes[position] = Some(value);
        }

        self.results
            .iter()
            .zip(&self.result_types)
            .map(|(value, (dtype, shape))| {
                let tensor = lookup(value, &arg_values, &nodes)?;
                let bytes = tensor.host_bytes().context(DeviceSnafu)?;
                let buffer = DeviceBuffer::from_host(Arc::clone(&options.allocator), options.device_ordinal, &bytes)
                    .context(DeviceSnafu)?;
                ShapedBuffer::new(buffer, *dtype, shape.clone()).context(DeviceSnafu)
            })
            .collect()
    }
}

impl Executable for InterpreterExecutable {
    fn run(&self, args: &[ShapedBuffer], options: &RunOptions) -> Result<ExecutionOutput> {
        let ticket = options.stream.as_ref().map(|stream| (stream, stream.submit()));
        let executed = self.execute(args, options);
        if let Some((stream, ticket)) = ticket {
            stream.complete(ticket);
        }

        let mut buffers = executed?;
        trace!(function = %self.function, results = buffers.len(), rng_seed = options.rng_seed, "interpreter ran");
        Ok(match buffers.len() {
            1 if !self.always_return_tuple => ExecutionOutput::Single(buffers.remove(0)),
            _ => ExecutionOutput::Tuple(buffers),
        })
    }
}

fn lookup<'a>(value: &ValueRef, args: &'a [Option<Tensor>], nodes: &'a [Option<Tensor>]) -> Result<&'a Tensor> {
    let slot = match *value {
        ValueRef::Arg(index) => args.get(index),
        ValueRef::Node(index) => nodes.get(index),
    };
    slot.and_then(Option::as_ref)
        .ok_or_else(|| ExecutionSnafu { reason: format!("value {value:?} is not available") }.build())
}

/// Element types the arithmetic primitives accept.
trait Arith: Element {
    fn negate(self) -> Self;
    fn plus(self, other: Self) -> Self;
    fn minus(self, other: Self) -> Self;
    fn times(self, other: Self) -> Self;
}

macro_rules! impl_arith_int {
    ($($ty:ty),*) => {
        $(impl Arith for $ty {
            fn negate(self) -> Self { self.wrapping_neg() }
            fn plus(self, other: Self) -> Self { self.wrapping_add(other) }
            fn minus(self, other: Self) -> Self { self.wrapping_sub(other) }
            fn times(self, other: Self) -> Self { self.wrapping_mul(other) }
        })*
    };
}

macro_rules! impl_arith_float {
    ($($ty:ty),*) => {
        $(impl Arith for $ty {
            fn negate(self) -> Self { -self }
            fn plus(self, other: Self) -> Self { self + other }
            fn minus(self, other: Self) -> Self { self - other }
            fn times(self, other: Self) -> Self { self * other }
        })*
    };
}

impl_arith_int!(i32, i64);
impl_arith_float!(f32, f64);

fn supports_arithmetic(dtype: DType) -> bool {
    matches!(dtype, DType::Int32 | DType::Int64 | DType::Float32 | DType::Float64)
}

/// Result shape of a binary elementwise op: equal shapes, or one scalar side.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Shape> {
    if lhs == rhs || rhs.is_empty() {
        Some(lhs.into())
    } else if lhs.is_empty() {
        Some(rhs.into())
    } else {
        None
    }
}

fn unary<T: Arith>(x: &Tensor, f: fn(T) -> T) -> Result<Tensor> {
    let values: Vec<T> = x.to_vec::<T>().context(DeviceSnafu)?.into_iter().map(f).collect();
    Tensor::from_slice(x.shape(), &values).context(DeviceSnafu)
}

fn binary<T: Arith>(lhs: &Tensor, rhs: &Tensor, f: fn(T, T) -> T) -> Result<Tensor> {
    let shape = broadcast_shape(lhs.shape(), rhs.shape()).ok_or_else(|| {
        ExecutionSnafu { reason: format!("incompatible shapes {:?} and {:?}", lhs.shape(), rhs.shape()) }.build()
    })?;
    let l = lhs.to_vec::<T>().context(DeviceSnafu)?;
    let r = rhs.to_vec::<T>().context(DeviceSnafu)?;
    let n = shape.iter().product::<usize>();
    let pick = |values: &[T], i: usize| if values.len() == 1 { values[0] } else { values[i] };
    let values: Vec<T> = (0..n).map(|i| f(pick(&l, i), pick(&r, i))).collect();
    Tensor::from_slice(shape, &values).context(DeviceSnafu)
}

macro_rules! dispatch_arith {
    ($op:expr, $dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            DType::Int32 => {
                type $T = i32;
                $body
            }
            DType::Int64 => {
                type $T = i64;
                $body
            }
            DType::Float32 => {
                type $T = f32;
                $body
            }
            DType::Float64 => {
                type $T = f64;
                $body
            }
            other => ExecutionSnafu { reason: format!("{} does not support {other}", $op) }.fail(),
        }
    };
}

/// Evaluate one primitive over concrete tensors.
fn evaluate(op: Primitive, operands: &[&Tensor]) -> Result<Tensor, Error> {
    ensure!(
        operands.len() == op.arity(),
        ExecutionSnafu { reason: format!("{op} expects {} operands, got {}", op.arity(), operands.len()) }
    );
    let dtype = operands[0].dtype();
    if let [lhs, rhs] = operands {
        ensure!(
            lhs.dtype() == rhs.dtype(),
            ExecutionSnafu { reason: format!("{op} operand dtypes differ: {} vs {}", lhs.dtype(), rhs.dtype()) }
        );
    }

    match op {
        Primitive::Identity => Ok(operands[0].clone()),
        Primitive::Neg => dispatch_arith!(op, dtype, T => unary::<T>(operands[0], T::negate)),
        Primitive::Add => dispatch_arith!(op, dtype, T => binary::<T>(operands[0], operands[1], T::plus)),
        Primitive::Sub => dispatch_arith!(op, dtype, T => binary::<T>(operands[0], operands[1], T::minus)),
        Primitive::Mul => dispatch_arith!(op, dtype, T => binary::<T>(operands[0], operands[1], T::times)),
    }
}
