use kiln_dtype::DType;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Shape of target tensor does not match expected shape.
    #[snafu(display("shape mismatch: expected {expected:?}, got {actual:?}"))]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    #[snafu(display("dtype mismatch: expected {expected}, got {actual}"))]
    DTypeMismatch { expected: DType, actual: DType },

    /// Element type has no fixed width (strings, resource handles).
    #[snafu(display("dtype {dtype} is not a dense element type"))]
    NotDense { dtype: DType },

    /// Tensor storage does not hold the requested kind of data.
    #[snafu(display("tensor of dtype {dtype} does not hold {expected}"))]
    WrongStorage { dtype: DType, expected: &'static str },

    #[snafu(display("allocator '{allocator}' failed to allocate {size} bytes: {reason}"))]
    AllocationFailed { allocator: String, size: usize, reason: String },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("stream error: {message}"))]
    Stream { message: String },
}
