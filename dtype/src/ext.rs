use super::*;

/// A primitive Rust type that can back a host array.
///
/// `bool` has no impl since it is not `Pod`. Boolean host arrays are stored as `u8`;
/// only boolean *constants* use [`ElementKind::Bool`].
pub trait Element: bytemuck::Pod + Send + Sync + 'static {
    const KIND: ElementKind;
}

macro_rules! impl_element {
    ($($ty:ty => $kind:expr),* $(,)?) => {
        $(impl Element for $ty { const KIND: ElementKind = $kind; })*
    };
}

impl_element! {
    i8 => ElementKind::Int8, i16 => ElementKind::Int16, i32 => ElementKind::Int32, i64 => ElementKind::Int64,
    u8 => ElementKind::UInt8, u16 => ElementKind::UInt16, u32 => ElementKind::UInt32, u64 => ElementKind::UInt64,
    f32 => ElementKind::Float32, f64 => ElementKind::Float64,
}
