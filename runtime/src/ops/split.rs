use kiln_device::{AllocatorAttributes, Tensor};
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::closure_store::ExecutableClosure;
use crate::context::{KernelConstruction, OpKernelContext};
use crate::error::{DeviceSnafu, InvalidArgumentSnafu, Result};
use crate::kernel::OpKernel;
use crate::ops::compile::{ClusterInputs, compile_to_local_executable, run_compiled};
use crate::platform_info::PlatformInfo;

/// Compile half of the split path.
///
/// Every invocation stores a new closure, even on a cache hit, because the
/// snapshots belong to the invocation. Outputs are the closure key and a
/// `true` success flag, both host resident.
#[derive(Debug)]
pub struct CompileOp {
    name: String,
    platform_info: PlatformInfo,
    inputs: ClusterInputs,
}

impl CompileOp {
    pub fn new(construction: &KernelConstruction<'_>) -> Result<Self> {
        Ok(Self {
            name: construction.node.name.clone(),
            platform_info: PlatformInfo::from_device(construction.device)?,
            inputs: ClusterInputs::from_construction(construction)?,
        })
    }

    fn try_compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let compiled = compile_to_local_executable(ctx, &self.platform_info, &self.inputs)?;
        let closure = ExecutableClosure::new(compiled.artifact, compiled.snapshots, self.inputs.constants.len());
        let key = ctx.runtime().closures().produce(closure);
        debug!(node = %self.name, function = %self.inputs.function, key = %key, "cluster compiled for later run");

        let host = AllocatorAttributes::host_gpu_compatible();
        ctx.set_output(0, Tensor::string_scalar(key).with_attributes(host));
        ctx.set_output(1, Tensor::bool_scalar(true).with_attributes(host));
        Ok(())
    }
}

impl OpKernel for CompileOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, ctx: &mut OpKernelContext) {
        if let Err(error) = self.try_compute(ctx) {
            ctx.ctx_failure(error);
        }
    }
}

/// Run half of the split path. Inputs are `[args..., key]`.
#[derive(Debug)]
pub struct RunOp {
    name: String,
    platform_info: PlatformInfo,
}

impl RunOp {
    pub fn new(construction: &KernelConstruction<'_>) -> Result<Self> {
        Ok(Self {
            name: construction.node.name.clone(),
            platform_info: PlatformInfo::from_device(construction.device)?,
        })
    }

    fn try_compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let key_index = ctx.num_inputs().checked_sub(1);
        let key_index = key_index.ok_or_else(|| InvalidArgumentSnafu { message: "missing closure key input" }.build())?;
        let key = match ctx.input(key_index)?.strings().context(DeviceSnafu)? {
            [key] => key.clone(),
            keys => {
                let message = format!("closure key must be a scalar, got {} strings", keys.len());
                return InvalidArgumentSnafu { message }.fail();
            }
        };

        let closure = ctx.runtime().closures().consume(&key)?;
        let needs_more_args = closure
            .compilation_result()
            .input_mapping
            .iter()
            .filter(|&&index| !closure.snapshots().contains(index))
            .any(|&index| index >= closure.num_constant_args() + key_index);
        ensure!(
            !needs_more_args,
            InvalidArgumentSnafu { message: format!("closure {key} expects more than {key_index} arguments") }
        );
        debug!(node = %self.name, key = %key, "running compiled closure");

        run_compiled(ctx, &self.platform_info, closure.artifact(), closure.snapshots(), closure.num_constant_args())
    }
}

impl OpKernel for RunOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, ctx: &mut OpKernelContext) {
        if let Err(error) = self.try_compute(ctx) {
            ctx.ctx_failure(error);
        }
    }
}
