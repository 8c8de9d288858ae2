//! Contracts of the backend compiler and the executables it produces.

use std::fmt;
use std::sync::Arc;

use kiln_device::{DeviceMemoryAllocator, PlatformId, Shape, ShapedBuffer, Stream, Tensor};
use kiln_dtype::DType;

use crate::error::Result;
use crate::function::{FunctionLibraryDefinition, FunctionSpec};

/// Maps a logical shape to the shape a backend stores it in.
pub type ShapeRepresentationFn = Arc<dyn Fn(&[usize], DType) -> Shape + Send + Sync>;

/// Backend client: compiles clusters into executables for one platform.
pub trait LocalClient: Send + Sync + fmt::Debug {
    fn platform_id(&self) -> PlatformId;

    /// Real-buffer allocator of the backend.
    fn backend_allocator(&self) -> Arc<dyn DeviceMemoryAllocator>;

    fn compile(
        &self,
        options: &CompilerOptions,
        compile_options: &CompileOptions,
        function: &FunctionSpec,
        args: &[CompilerArgument],
    ) -> Result<(CompilationResult, Arc<dyn Executable>)>;
}

/// A compiled cluster ready to run.
pub trait Executable: Send + Sync + fmt::Debug {
    fn run(&self, args: &[ShapedBuffer], options: &RunOptions) -> Result<ExecutionOutput>;
}

/// Options fixed when a compilation cache is built.
#[derive(Clone)]
pub struct CompilerOptions {
    pub client: Arc<dyn LocalClient>,
    /// Ordinal of the stream's device, or -1 without a stream.
    pub device_ordinal: i32,
    pub device_type: String,
    pub flib_def: Arc<FunctionLibraryDefinition>,
    pub graph_def_version: i32,
    pub allow_cpu_custom_calls: bool,
    pub device_allocator: Arc<dyn DeviceMemoryAllocator>,
    pub shape_representation_fn: Option<ShapeRepresentationFn>,
}

impl fmt::Debug for CompilerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerOptions")
            .field("client", &self.client.platform_id())
            .field("device_ordinal", &self.device_ordinal)
            .field("device_type", &self.device_type)
            .field("graph_def_version", &self.graph_def_version)
            .field("allow_cpu_custom_calls", &self.allow_cpu_custom_calls)
            .field("device_allocator", &self.device_allocator.name())
            .field("shape_representation_fn", &self.shape_representation_fn.is_some())
            .finish()
    }
}

/// Per-call compile flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub is_entry_computation: bool,
    /// Fold constant arguments into the computation instead of passing them.
    pub resolve_compile_time_constants: bool,
    /// Wrap a single output in a 1-tuple.
    pub always_return_tuple: bool,
}

impl CompileOptions {
    /// Flags used by the launch and compile kernels.
    pub const fn entry() -> Self {
        Self { is_entry_computation: true, resolve_compile_time_constants: true, always_return_tuple: false }
    }
}

/// Description of one node input handed to the compiler.
#[derive(Debug, Clone)]
pub enum CompilerArgument {
    /// Value known at compile time.
    Constant(Tensor),
    Parameter { dtype: DType, shape: Shape },
    /// Resource variable; `shape` is `None` while uninitialized. `dtype` is
    /// `DType::Resource` when no variable exists yet, and then any update
    /// type is accepted.
    Resource { dtype: DType, shape: Option<Shape> },
}

impl CompilerArgument {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Constant(value) => value.dtype(),
            Self::Parameter { dtype, .. } | Self::Resource { dtype, .. } => *dtype,
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Resource { .. })
    }
}

/// How an output of the compiled cluster is produced.
#[derive(Debug, Clone)]
pub enum OutputDescription {
    /// Resolved at compile time; never transferred from the device.
    Constant(Tensor),
    /// Produced by the executable.
    Computed { dtype: DType, shape: Shape },
}

/// Resource variable written by the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUpdate {
    /// Node input index of the resource handle.
    pub input_index: usize,
    pub dtype: DType,
    pub shape: Shape,
}

/// Compiler's description of a compiled cluster.
///
/// The executable takes one buffer per `input_mapping` entry and returns the
/// computed outputs in order, followed by one buffer per resource update.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    /// Node input index of each executable argument, in argument order.
    pub input_mapping: Vec<usize>,
    pub outputs: Vec<OutputDescription>,
    pub resource_updates: Vec<ResourceUpdate>,
}

impl CompilationResult {
    /// Number of buffers the executable returns.
    pub fn num_result_buffers(&self) -> usize {
        self.outputs.iter().filter(|o| matches!(o, OutputDescription::Computed { .. })).count()
            + self.resource_updates.len()
    }
}

/// Configuration of a single executable run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub stream: Option<Arc<dyn Stream>>,
    pub allocator: Arc<dyn DeviceMemoryAllocator>,
    pub intra_op_threads: usize,
    pub rng_seed: u64,
    pub device_ordinal: i32,
}

/// Buffers returned by [`Executable::run`].
#[derive(Debug)]
pub enum ExecutionOutput {
    Single(ShapedBuffer),
    Tuple(Vec<ShapedBuffer>),
}

impl ExecutionOutput {
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Tuple(buffers) => buffers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_buffers(self) -> Vec<ShapedBuffer> {
        match self {
            Self::Single(buffer) => vec![buffer],
            Self::Tuple(buffers) => buffers,
        }
    }
}
