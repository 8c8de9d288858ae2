//! JIT cluster execution for the kiln dataflow runtime.
//!
//! A cluster of primitive tensor operations is compiled once per distinct
//! input signature and launched many times with real tensors.
//!
//! # Kernels
//!
//! - [`LaunchOp`] (`JitLaunch`): compile through the cache, then run.
//! - [`CompileOp`] (`_JitCompile`) and [`RunOp`] (`_JitRun`): the same work
//!   split over two dataflow nodes, connected by a closure key.
//!
//! # Pieces
//!
//! - [`PlatformInfo`]: the platform and real-buffer allocator of a kernel.
//! - [`ResourceSnapshots`]: variable values shared by compilation and launch.
//! - [`CompilationCache`]: at-most-one build per [`Signature`], stored in the
//!   device's resource manager.
//! - [`LaunchContext`]: tensors to executable buffers and back.
//! - [`ClosureStore`]: single-use handoff from compile to run.
//!
//! Everything hangs off an explicitly constructed [`JitRuntime`].

pub mod client;
pub mod closure_store;
pub mod compilation_cache;
pub mod config;
pub mod context;
pub mod error;
pub mod function;
pub mod interpreter;
pub mod jit_runtime;
pub mod kernel;
pub mod launch_context;
pub mod ops;
pub mod platform;
pub mod platform_info;
pub mod resource;
pub mod snapshot;


pub use client::{
    CompilationResult, CompileOptions, CompilerArgument, CompilerOptions, Executable, ExecutionOutput, LocalClient,
    OutputDescription, ResourceUpdate, RunOptions, ShapeRepresentationFn,
};
pub use closure_store::{ClosureStore, ExecutableClosure};
pub use compilation_cache::{CacheStats, CompilationCache, CompiledArtifact, Signature};
pub use config::JitConfig;
pub use context::{JitDevice, KernelConstruction, NodeDef, OpKernelContext};
pub use error::*;
pub use function::{AttrValue, FunctionDef, FunctionLibraryDefinition, FunctionSpec, Primitive, ValueRef};
pub use interpreter::{HostPlatform, InterpreterClient};
pub use jit_runtime::JitRuntime;
pub use kernel::{JitOp, KernelDef, OpKernel, create_kernel};
pub use launch_context::LaunchContext;
pub use ops::{CompileOp, LaunchOp, RunOp};
pub use platform::{ClientOptions, Platform, PlatformRegistry};
pub use platform_info::{DeviceMetadata, PlatformInfo};
pub use resource::{DEFAULT_CONTAINER, Resource, ResourceMgr, Var};
pub use snapshot::{ResourceSnapshots, VariableSnapshot};
