//! JIT kernels: the one-shot launch kernel and the split compile/run pair.

mod compile;
mod launch;
mod split;

pub use compile::{ClusterInputs, CompiledCluster, compile_to_local_executable, run_compiled};
pub use launch::LaunchOp;
pub use split::{CompileOp, RunOp};
