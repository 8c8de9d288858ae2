//! Kernel trait and the registration table of the JIT ops.

use std::fmt;
use std::str::FromStr;

use kiln_device::DeviceKind;
use tracing::debug;

use crate::context::{KernelConstruction, OpKernelContext};
use crate::error::{KernelNotFoundSnafu, Result};
use crate::ops::{CompileOp, LaunchOp, RunOp};

/// A node's compute routine, built once per node.
pub trait OpKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Run the kernel. Failures are recorded on `ctx`, never returned.
    fn compute(&self, ctx: &mut OpKernelContext);
}

/// The JIT ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter)]
pub enum JitOp {
    /// One-shot compile and run.
    #[strum(serialize = "JitLaunch")]
    Launch,
    /// Compile half of the split path; emits a closure key.
    #[strum(serialize = "_JitCompile")]
    Compile,
    /// Run half of the split path; consumes a closure key.
    #[strum(serialize = "_JitRun")]
    Run,
}

/// One kernel registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDef {
    pub op: JitOp,
    pub device_type: &'static str,
    /// Inputs kept in host memory even on accelerators.
    pub host_memory: &'static [&'static str],
}

impl KernelDef {
    pub fn is_host_memory(&self, input: &str) -> bool {
        self.host_memory.contains(&input)
    }
}

const KERNELS: &[KernelDef] = &[
    KernelDef { op: JitOp::Launch, device_type: "CPU", host_memory: &[] },
    KernelDef { op: JitOp::Launch, device_type: "GPU", host_memory: &["constants", "resources"] },
    KernelDef { op: JitOp::Compile, device_type: "CPU", host_memory: &[] },
    KernelDef { op: JitOp::Compile, device_type: "GPU", host_memory: &["constants", "resources"] },
    KernelDef { op: JitOp::Run, device_type: "CPU", host_memory: &[] },
    KernelDef { op: JitOp::Run, device_type: "GPU", host_memory: &["constants"] },
];

/// Every built-in registration.
pub fn registered_kernels() -> &'static [KernelDef] {
    KERNELS
}

/// Registration of `op` for a device kind.
///
/// Accelerator-device kinds register the JIT ops themselves with the GPU
/// memory placement, so they resolve to the GPU entry.
pub fn kernel_def(op: JitOp, device_kind: &DeviceKind) -> Option<&'static KernelDef> {
    let device_type = match device_kind {
        DeviceKind::Cpu => "CPU",
        DeviceKind::Gpu | DeviceKind::Accelerator(_) => "GPU",
    };
    KERNELS.iter().find(|def| def.op == op && def.device_type == device_type)
}

/// Build the kernel for `construction.node`.
pub fn create_kernel(construction: &KernelConstruction<'_>) -> Result<Box<dyn OpKernel>> {
    let node = construction.node;
    let op = JitOp::from_str(&node.op).map_err(|_| KernelNotFoundSnafu { op: &node.op }.build())?;
    debug!(node = %node.name, %op, device = %construction.device.name, "creating kernel");

    Ok(match op {
        JitOp::Launch => Box::new(LaunchOp::new(construction)?),
        JitOp::Compile => Box::new(CompileOp::new(construction)?),
        JitOp::Run => Box::new(RunOp::new(construction)?),
    })
}
