//! Error types for JIT compilation and launch.

use kiln_device::{PlatformId, ResourceHandle};
use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [`Error`] surfaced to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ErrorKind {
    Construction,
    Internal,
    InvalidArgument,
    Compiler,
    Runtime,
    ShapeMismatch,
    NotFound,
}

/// Errors that can occur while compiling or launching a cluster.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Kernel placed on a device kind with no real-buffer allocator.
    #[snafu(display("unsupported device: {device}"))]
    UnsupportedDevice { device: String },

    /// Node attribute missing or of the wrong type.
    #[snafu(display("attribute '{name}': {reason}"))]
    Attribute { name: String, reason: String },

    #[snafu(display("No resource manager available on device {device}"))]
    NoResourceManager { device: String },

    #[snafu(display("internal error: {message}"))]
    Internal { message: String },

    #[snafu(display("no JIT device registered for device type {device_type}"))]
    NoJitDevice { device_type: String },

    #[snafu(display("uninitialized variable {handle} (input {index})"))]
    UninitializedVariable { handle: ResourceHandle, index: usize },

    #[snafu(display("unknown closure key '{key}'"))]
    UnknownClosureKey { key: String },

    #[snafu(display("invalid argument: {message}"))]
    InvalidArgument { message: String },

    /// Compiler rejected the cluster.
    #[snafu(display("compilation of {function} failed: {reason}"))]
    Compilation { function: String, reason: String },

    /// Executable failed while running.
    #[snafu(display("execution failed: {reason}"))]
    Execution { reason: String },

    #[snafu(display("shape mismatch for {what}: expected {expected:?}, got {actual:?}"))]
    OutputShapeMismatch { what: String, expected: Vec<usize>, actual: Vec<usize> },

    #[snafu(display("output count mismatch: expected {expected}, got {actual}"))]
    OutputCountMismatch { expected: usize, actual: usize },

    #[snafu(display("{kind} '{container}/{name}' not found"))]
    ResourceNotFound { kind: &'static str, container: String, name: String },

    #[snafu(display("{kind} '{container}/{name}' already exists"))]
    ResourceExists { kind: &'static str, container: String, name: String },

    #[snafu(display("platform {platform} is not registered"))]
    PlatformNotFound { platform: PlatformId },

    #[snafu(display("no kernel registered for op '{op}'"))]
    KernelNotFound { op: String },

    #[snafu(display("device error: {source}"))]
    Device { source: kiln_device::Error },
}

impl Error {
    /// The executor-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedDevice { .. } | Self::Attribute { .. } => ErrorKind::Construction,
            Self::NoResourceManager { .. } | Self::Internal { .. } | Self::UnknownClosureKey { .. } => {
                ErrorKind::Internal
            }
            Self::NoJitDevice { .. }
            | Self::UninitializedVariable { .. }
            | Self::InvalidArgument { .. }
            | Self::ResourceExists { .. } => ErrorKind::InvalidArgument,
            Self::Compilation { .. } => ErrorKind::Compiler,
            Self::Execution { .. } | Self::Device { .. } => ErrorKind::Runtime,
            Self::OutputShapeMismatch { .. } | Self::OutputCountMismatch { .. } => ErrorKind::ShapeMismatch,
            Self::ResourceNotFound { .. } | Self::PlatformNotFound { .. } | Self::KernelNotFound { .. } => {
                ErrorKind::NotFound
            }
        }
    }
}
