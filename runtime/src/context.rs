//! Executor-facing types: devices, node definitions, kernel construction and
//! the per-invocation kernel context.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_device::{Allocator, CpuAllocator, DeviceKind, Stream, Tensor};
use kiln_dtype::DType;
use tracing::debug;

use crate::error::{AttributeSnafu, Error, InvalidArgumentSnafu, NoResourceManagerSnafu, Result};
use crate::function::{AttrValue, FunctionLibraryDefinition, FunctionSpec};
use crate::jit_runtime::JitRuntime;
use crate::platform_info::DeviceMetadata;
use crate::resource::ResourceMgr;

/// Device a kernel is placed on.
#[derive(Debug, Clone)]
pub struct JitDevice {
    pub name: String,
    pub kind: DeviceKind,
    /// The device's ordinary tensor allocator.
    pub allocator: Arc<dyn Allocator>,
    pub stream: Option<Arc<dyn Stream>>,
    /// Present on accelerator-device kinds.
    pub metadata: Option<Arc<DeviceMetadata>>,
    pub resource_mgr: Option<Arc<ResourceMgr>>,
    pub worker_threads: usize,
}

impl JitDevice {
    fn new(name: impl Into<String>, kind: DeviceKind, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            name: name.into(),
            kind,
            allocator,
            stream: None,
            metadata: None,
            resource_mgr: Some(Arc::new(ResourceMgr::default())),
            worker_threads: 1,
        }
    }

    /// Host CPU device with system memory and a fresh resource manager.
    pub fn cpu() -> Self {
        Self::new("/device:CPU:0", DeviceKind::Cpu, Arc::new(CpuAllocator))
    }

    /// GPU device whose platform is resolved through `stream`.
    pub fn gpu(allocator: Arc<dyn Allocator>, stream: Arc<dyn Stream>) -> Self {
        let name = format!("/device:GPU:{}", stream.device_ordinal());
        Self { stream: Some(stream), ..Self::new(name, DeviceKind::Gpu, allocator) }
    }

    /// Accelerator device of kind `kind` exposing `metadata`.
    pub fn accelerator(kind: &str, metadata: DeviceMetadata, stream: Option<Arc<dyn Stream>>) -> Self {
        let kind = DeviceKind::Accelerator(kind.to_uppercase());
        let name = format!("/device:{kind}:0");
        Self { stream, metadata: Some(Arc::new(metadata)), ..Self::new(name, kind, Arc::new(CpuAllocator)) }
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_resource_mgr(mut self, mgr: Arc<ResourceMgr>) -> Self {
        self.resource_mgr = Some(mgr);
        self
    }

    pub fn without_resource_mgr(mut self) -> Self {
        self.resource_mgr = None;
        self
    }
}

/// A dataflow node: op name plus attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub name: String,
    pub op: String,
    pub attrs: BTreeMap<String, AttrValue>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self { name: name.into(), op: op.into(), attrs: BTreeMap::new() }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// What a kernel sees while being constructed.
#[derive(Debug, Clone, Copy)]
pub struct KernelConstruction<'a> {
    pub node: &'a NodeDef,
    pub device: &'a JitDevice,
}

impl<'a> KernelConstruction<'a> {
    pub fn new(node: &'a NodeDef, device: &'a JitDevice) -> Self {
        Self { node, device }
    }

    fn attr(&self, name: &str) -> Result<&'a AttrValue> {
        self.node
            .attrs
            .get(name)
            .ok_or_else(|| AttributeSnafu { name, reason: format!("missing on node {}", self.node.name) }.build())
    }

    fn mistyped(name: &str, expected: &str, actual: &AttrValue) -> Error {
        AttributeSnafu { name, reason: format!("expected {expected}, got {actual}") }.build()
    }

    pub fn attr_dtype_list(&self, name: &str) -> Result<&'a [DType]> {
        match self.attr(name)? {
            AttrValue::DTypeList(list) => Ok(list),
            other => Err(Self::mistyped(name, "list(dtype)", other)),
        }
    }

    pub fn attr_int(&self, name: &str) -> Result<i64> {
        match self.attr(name)? {
            AttrValue::Int(value) => Ok(*value),
            other => Err(Self::mistyped(name, "int", other)),
        }
    }

    pub fn attr_func(&self, name: &str) -> Result<&'a FunctionSpec> {
        match self.attr(name)? {
            AttrValue::Func(spec) => Ok(spec),
            other => Err(Self::mistyped(name, "func", other)),
        }
    }
}

/// Per-invocation context of a kernel's compute call.
///
/// Failures are recorded here instead of being returned; the executor reads
/// them through [`status`](Self::status).
#[derive(Debug)]
pub struct OpKernelContext {
    runtime: Arc<JitRuntime>,
    device: JitDevice,
    inputs: Vec<Tensor>,
    outputs: Vec<Option<Tensor>>,
    status: Option<Error>,
}

impl OpKernelContext {
    pub fn new(runtime: Arc<JitRuntime>, device: JitDevice, inputs: Vec<Tensor>) -> Self {
        Self { runtime, device, inputs, outputs: Vec::new(), status: None }
    }

    pub fn runtime(&self) -> &Arc<JitRuntime> {
        &self.runtime
    }

    pub fn device(&self) -> &JitDevice {
        &self.device
    }

    pub fn stream(&self) -> Option<&Arc<dyn Stream>> {
        self.device.stream.as_ref()
    }

    pub fn resource_manager(&self) -> Result<&Arc<ResourceMgr>> {
        self.device.resource_mgr.as_ref().ok_or_else(|| NoResourceManagerSnafu { device: &self.device.name }.build())
    }

    pub fn function_library(&self) -> &Arc<FunctionLibraryDefinition> {
        self.runtime.function_library()
    }

    pub fn graph_def_version(&self) -> i32 {
        self.runtime.graph_def_version()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&Tensor> {
        self.inputs.get(index).ok_or_else(|| {
            InvalidArgumentSnafu { message: format!("input {index} out of range ({} inputs)", self.inputs.len()) }
                .build()
        })
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn set_output(&mut self, index: usize, tensor: Tensor) {
        if self.outputs.len() <= index {
            self.outputs.resize(index + 1, None);
        }
        self.outputs[index] = Some(tensor);
    }

    pub fn output(&self, index: usize) -> Option<&Tensor> {
        self.outputs.get(index).and_then(Option::as_ref)
    }

    /// Number of output slots written so far (including gaps).
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Record `error` unless an earlier failure is already recorded.
    pub fn ctx_failure(&mut self, error: Error) {
        debug!(device = %self.device.name, %error, "kernel failed");
        if self.status.is_none() {
            self.status = Some(error);
        }
    }

    pub fn status(&self) -> Option<&Error> {
        self.status.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_none()
    }

    pub fn take_status(&mut self) -> Result<()> {
        match self.status.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
