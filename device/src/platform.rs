//! Device kinds and accelerator platform identifiers.

use crate::error::{InvalidDeviceSnafu, Result};

/// Opaque identifier of an accelerator backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct PlatformId(pub &'static str);

impl PlatformId {
    /// The host (CPU) platform.
    pub const HOST: PlatformId = PlatformId("Host");
    pub const CUDA: PlatformId = PlatformId("CUDA");

    pub fn is_host(&self) -> bool {
        *self == Self::HOST
    }
}

/// Kind of device a kernel is placed on.
///
/// Anything other than `CPU` or `GPU` is an accelerator-device kind whose
/// tensors are opaque placeholders; it is usable only when the device also
/// exposes accelerator metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DeviceKind {
    #[display("CPU")]
    Cpu,
    #[display("GPU")]
    Gpu,
    #[display("{_0}")]
    Accelerator(String),
}

impl DeviceKind {
    /// Parse a device type string.
    ///
    /// Examples:
    /// - "CPU" -> DeviceKind::Cpu
    /// - "gpu" -> DeviceKind::Gpu
    /// - "JIT_GPU" -> DeviceKind::Accelerator("JIT_GPU")
    pub fn parse(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        match upper.as_str() {
            "" => InvalidDeviceSnafu { device: s.to_string() }.fail(),
            "CPU" => Ok(Self::Cpu),
            "GPU" => Ok(Self::Gpu),
            _ => Ok(Self::Accelerator(upper)),
        }
    }

    /// The registry name of this kind ("CPU", "GPU", ...).
    pub fn type_name(&self) -> &str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::Accelerator(name) => name,
        }
    }
}
