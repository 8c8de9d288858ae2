//! Compile core shared by the launch and compile kernels, and the run path
//! shared by the launch and run kernels.

use std::sync::Arc;
use std::time::Instant;

use kiln_device::PlatformId;
use kiln_dtype::DType;
use tracing::{debug, trace};

use crate::client::{CompileOptions, CompilerArgument, CompilerOptions, RunOptions};
use crate::compilation_cache::{CompilationCache, CompiledArtifact};
use crate::context::{KernelConstruction, OpKernelContext};
use crate::error::{AttributeSnafu, NoJitDeviceSnafu, Result};
use crate::function::FunctionSpec;
use crate::launch_context::LaunchContext;
use crate::platform::ClientOptions;
use crate::platform_info::PlatformInfo;
use crate::snapshot::ResourceSnapshots;

/// Input layout of a cluster node: `[constants..., args..., resources...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterInputs {
    pub constants: Vec<usize>,
    pub num_args: usize,
    pub resources: Vec<usize>,
    pub function: FunctionSpec,
}

impl ClusterInputs {
    /// Parse the `Tconstants`, `Targs`, `Nresources` and `function` attributes.
    pub fn from_construction(construction: &KernelConstruction<'_>) -> Result<Self> {
        let num_constants = construction.attr_dtype_list("Tconstants")?.len();
        let num_args = construction.attr_dtype_list("Targs")?.len();
        let num_resources = construction.attr_int("Nresources")?;
        let num_resources = usize::try_from(num_resources).map_err(|_| {
            AttributeSnafu { name: "Nresources", reason: format!("negative count {num_resources}") }.build()
        })?;
        let function = construction.attr_func("function")?.clone();

        let first_resource = num_constants + num_args;
        Ok(Self {
            constants: (0..num_constants).collect(),
            num_args,
            resources: (first_resource..first_resource + num_resources).collect(),
            function,
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.constants.len() + self.num_args + self.resources.len()
    }
}

/// Result of the compile core.
#[derive(Debug)]
pub struct CompiledCluster {
    pub artifact: Arc<CompiledArtifact>,
    pub snapshots: ResourceSnapshots,
}

/// Build the cache that lives in the device's default container.
fn build_compilation_cache(ctx: &OpKernelContext, platform_info: &PlatformInfo) -> Result<CompilationCache> {
    let runtime = ctx.runtime();
    let device_allocator = platform_info.allocator();
    let device_ordinal = ctx.stream().map_or(-1, |stream| stream.device_ordinal());

    let (client, device_type, shape_representation_fn) = match platform_info.metadata() {
        Some(metadata) => {
            (Arc::clone(&metadata.client), metadata.jit_device_type.clone(), metadata.shape_representation_fn.clone())
        }
        None => {
            let platforms = runtime.platforms();
            let platform = platforms.platform_with_id(platform_info.platform_id())?;
            let client = platforms.get_or_create_local_client(&ClientOptions {
                platform,
                intra_op_parallelism: ctx.device().worker_threads,
            })?;
            let device_kind = platform_info.device_kind().type_name();
            let registration = platforms
                .compilation_device(device_kind)
                .ok_or_else(|| NoJitDeviceSnafu { device_type: device_kind }.build())?;
            (client, registration.compilation_device_name, None)
        }
    };

    debug!(
        platform = %platform_info.platform_id(),
        device_type = %device_type,
        device_ordinal,
        allocator = device_allocator.name(),
        "building compilation cache"
    );
    Ok(CompilationCache::new(CompilerOptions {
        client,
        device_ordinal,
        device_type,
        flib_def: Arc::clone(ctx.function_library()),
        graph_def_version: ctx.graph_def_version(),
        allow_cpu_custom_calls: platform_info.platform_id() == PlatformId::HOST,
        device_allocator,
        shape_representation_fn,
    }))
}

/// Describe every node input to the compiler.
fn compiler_arguments(
    ctx: &OpKernelContext,
    inputs: &ClusterInputs,
    snapshots: &ResourceSnapshots,
) -> Result<Vec<CompilerArgument>> {
    (0..ctx.num_inputs())
        .map(|index| {
            if let Some(slot) = snapshots.get(index) {
                return Ok(CompilerArgument::Resource {
                    dtype: slot.dtype.unwrap_or(DType::Resource),
                    shape: slot.value.as_ref().map(|value| value.shape().into()),
                });
            }
            let tensor = ctx.input(index)?;
            Ok(if inputs.constants.contains(&index) {
                CompilerArgument::Constant(tensor.clone())
            } else {
                CompilerArgument::Parameter { dtype: tensor.dtype(), shape: tensor.shape().into() }
            })
        })
        .collect()
}

/// Snapshot the cluster's variables and resolve its compiled artifact.
///
/// The cache is looked up (or created) in the device's default container
/// under the configured name and kept alive for the duration of the call.
pub fn compile_to_local_executable(
    ctx: &OpKernelContext,
    platform_info: &PlatformInfo,
    inputs: &ClusterInputs,
) -> Result<CompiledCluster> {
    let mgr = ctx.resource_manager()?;
    let cache = mgr.lookup_or_create::<CompilationCache, _>(
        mgr.default_container(),
        &ctx.runtime().config().cache_name,
        || build_compilation_cache(ctx, platform_info),
    )?;

    let snapshots = ResourceSnapshots::capture(ctx, &inputs.resources)?;
    let args = compiler_arguments(ctx, inputs, &snapshots)?;
    let artifact = cache.compile(&CompileOptions::entry(), &inputs.function, &args)?;

    Ok(CompiledCluster { artifact, snapshots })
}

/// Feed `artifact` from the kernel inputs and `snapshots`, run it on the
/// device's stream, and publish its results.
pub fn run_compiled(
    ctx: &mut OpKernelContext,
    platform_info: &PlatformInfo,
    artifact: &CompiledArtifact,
    snapshots: &ResourceSnapshots,
    missing_ctx_input_prefix: usize,
) -> Result<()> {
    let launch_context = LaunchContext::builder()
        .client(Arc::clone(&artifact.client))
        .allocator(platform_info.allocator())
        .allocate_device_tensors(platform_info.is_on_accelerator_device())
        .use_multiple_streams(platform_info.use_multiple_streams())
        .maybe_shape_representation_fn(platform_info.shape_representation_fn().cloned())
        .build();

    let args =
        launch_context.populate_inputs(ctx, &artifact.compilation_result, snapshots, missing_ctx_input_prefix)?;

    let stream = ctx.stream().cloned();
    let run_options = RunOptions {
        device_ordinal: stream.as_ref().map_or(0, |stream| stream.device_ordinal()),
        stream,
        allocator: Arc::clone(launch_context.allocator()),
        intra_op_threads: ctx.device().worker_threads,
        rng_seed: ctx.runtime().next_rng_seed(),
    };

    let started = Instant::now();
    let output = artifact.executable.run(&args, &run_options)?;
    trace!(
        fingerprint = artifact.fingerprint,
        args = args.len(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "executable finished"
    );

    launch_context.populate_outputs(ctx, &artifact.compilation_result, output, snapshots)
}
