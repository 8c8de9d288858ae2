use tracing::debug;

use crate::context::{KernelConstruction, OpKernelContext};
use crate::error::Result;
use crate::kernel::OpKernel;
use crate::ops::compile::{ClusterInputs, compile_to_local_executable, run_compiled};
use crate::platform_info::PlatformInfo;

/// Compiles its cluster (through the cache) and runs it in one step.
#[derive(Debug)]
pub struct LaunchOp {
    name: String,
    platform_info: PlatformInfo,
    inputs: ClusterInputs,
}

impl LaunchOp {
    pub fn new(construction: &KernelConstruction<'_>) -> Result<Self> {
        Ok(Self {
            name: construction.node.name.clone(),
            platform_info: PlatformInfo::from_device(construction.device)?,
            inputs: ClusterInputs::from_construction(construction)?,
        })
    }

    pub fn platform_info(&self) -> &PlatformInfo {
        &self.platform_info
    }

    fn try_compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        debug!(node = %self.name, function = %self.inputs.function, "launching cluster");
        let compiled = compile_to_local_executable(ctx, &self.platform_info, &self.inputs)?;
        run_compiled(ctx, &self.platform_info, &compiled.artifact, &compiled.snapshots, 0)
    }
}

impl OpKernel for LaunchOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, ctx: &mut OpKernelContext) {
        if let Err(error) = self.try_compute(ctx) {
            ctx.ctx_failure(error);
        }
    }
}
