//! Scalar constants passed to kernels by value.
//!
//! Constants are deduplicated by value. Floating-point values compare by bit pattern,
//! so `0.0` and `-0.0` are distinct constants while two NaNs with the same payload are
//! the same constant.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::ElementKind;

/// A primitive value bound to a kernel argument slot.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScalarValue {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl ScalarValue {
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Bool(_) => ElementKind::Bool,
            Self::Int8(_) => ElementKind::Int8,
            Self::UInt8(_) => ElementKind::UInt8,
            Self::Int16(_) => ElementKind::Int16,
            Self::UInt16(_) => ElementKind::UInt16,
            Self::Int32(_) => ElementKind::Int32,
            Self::UInt32(_) => ElementKind::UInt32,
            Self::Int64(_) => ElementKind::Int64,
            Self::UInt64(_) => ElementKind::UInt64,
            Self::Float32(_) => ElementKind::Float32,
            Self::Float64(_) => ElementKind::Float64,
        }
    }

    /// Raw bit pattern, zero-extended to 64 bits. Used for equality and hashing.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Self::Bool(v) => v as u64,
            Self::Int8(v) => v as u8 as u64,
            Self::UInt8(v) => v as u64,
            Self::Int16(v) => v as u16 as u64,
            Self::UInt16(v) => v as u64,
            Self::Int32(v) => v as u32 as u64,
            Self::UInt32(v) => v as u64,
            Self::Int64(v) => v as u64,
            Self::UInt64(v) => v,
            Self::Float32(v) => v.to_bits() as u64,
            Self::Float64(v) => v.to_bits(),
        }
    }

    /// Value as `i64`, or `None` for floating-point constants.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Bool(v) => Some(v as i64),
            Self::Int8(v) => Some(v as i64),
            Self::UInt8(v) => Some(v as i64),
            Self::Int16(v) => Some(v as i64),
            Self::UInt16(v) => Some(v as i64),
            Self::Int32(v) => Some(v as i64),
            Self::UInt32(v) => Some(v as i64),
            Self::Int64(v) => Some(v),
            Self::UInt64(v) => i64::try_from(v).ok(),
            Self::Float32(_) | Self::Float64(_) => None,
        }
    }

    /// Value widened to `f64`. Integers above 2^53 lose precision.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Float32(v) => v as f64,
            Self::Float64(v) => v,
            Self::UInt64(v) => v as f64,
            other => other.as_i64().map_or(0.0, |v| v as f64),
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.to_bits() == other.to_bits()
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.to_bits().hash(state);
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::UInt8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}f"),
            Self::Float64(v) => write!(f, "{v}d"),
        }?;
        write!(f, " ({})", self.kind())
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for ScalarValue {
            fn from(value: $ty) -> Self {
                Self::$variant(value)
            }
        })*
    };
}

impl_from_scalar! {
    bool => Bool,
    i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    u8 => UInt8, u16 => UInt16, u32 => UInt32, u64 => UInt64,
    f32 => Float32, f64 => Float64,
}
