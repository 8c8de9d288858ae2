//! Element data types for kiln tensors.
//!
//! `DType` covers the dense numeric types the compiler can lower plus the two
//! opaque element kinds the runtime moves around without interpreting:
//! strings (closure keys) and resource handles (variables).


/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(derive_more::Display)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr)]
#[repr(u8)]
pub enum DType {
    #[display("bool")]
    Bool = 0,

    #[display("int8")]
    Int8 = 1,
    #[display("uint8")]
    UInt8 = 2,
    #[display("int16")]
    Int16 = 3,
    #[display("uint16")]
    UInt16 = 4,
    #[display("int32")]
    Int32 = 5,
    #[display("uint32")]
    UInt32 = 6,
    #[display("int64")]
    Int64 = 7,
    #[display("uint64")]
    UInt64 = 8,

    #[display("float16")]
    Float16 = 9,
    #[display("bfloat16")]
    BFloat16 = 10,
    #[display("float32")]
    Float32 = 11,
    #[display("float64")]
    Float64 = 12,

    /// Variable-length byte strings. Never transferred to a device.
    #[display("string")]
    String = 13,

    /// Handle to a resource living in a resource manager.
    #[display("resource")]
    Resource = 14,
}

impl DType {
    /// Width of one element in bytes, or `None` for non-dense kinds.
    pub const fn bytes(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => Some(1),
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::String | Self::Resource => None,
        }
    }

    /// Whether values of this type live in flat byte buffers.
    pub const fn is_dense(&self) -> bool {
        self.bytes().is_some()
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    pub const fn is_resource(&self) -> bool {
        matches!(self, Self::Resource)
    }

    /// Total byte size of a dense tensor with `num_elements` elements.
    pub fn byte_size(&self, num_elements: usize) -> Option<usize> {
        self.bytes().map(|width| width * num_elements)
    }

    /// The element type a host scalar `T` is stored as.
    pub const fn of<T: NativeType>() -> Self {
        T::DTYPE
    }
}

/// Host scalar types that can back a dense tensor without conversion.
///
/// The width of `Self` always equals `DTYPE.bytes()`; every impl checks it at
/// compile time.
pub trait NativeType: Copy + Send + Sync + 'static {
    const DTYPE: DType;
}

macro_rules! native_types {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl NativeType for $ty {
                const DTYPE: DType = DType::$dtype;
            }

            const _: () = assert!(matches!(DType::$dtype.bytes(), Some(width) if width == size_of::<$ty>()));
        )*
    };
}

native_types! {
    bool => Bool,
    i8 => Int8, u8 => UInt8,
    i16 => Int16, u16 => UInt16,
    i32 => Int32, u32 => UInt32,
    i64 => Int64, u64 => UInt64,
    f32 => Float32, f64 => Float64,
}
