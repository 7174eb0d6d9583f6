//! Host-resident arrays.
//!
//! A [`HostArray`] is the host copy of a dataflow object. Clones share storage and
//! identity; two arrays with equal contents are still distinct objects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use conduit_dtype::{Element, ElementKind};
use parking_lot::RwLock;
use snafu::{OptionExt, ensure};

use crate::error::{InvalidRangeSnafu, KindMismatchSnafu, Result, SizeMismatchSnafu};

/// Process-unique identity of a host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

pub(crate) fn check_range(offset: usize, len: usize, size: usize) -> Result<()> {
    ensure!(offset.checked_add(len).is_some_and(|end| end <= size), InvalidRangeSnafu { offset, len, size });
    Ok(())
}

/// Byte storage aligned for every [`Element`] type.
///
/// Backed by `u128` words so typed views can be taken with `bytemuck` without
/// alignment failures.
#[derive(Clone, Default)]
pub struct AlignedBytes {
    words: Box<[u128]>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        Self { words: vec![0u128; len.div_ceil(size_of::<u128>())].into_boxed_slice(), len }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut storage = Self::zeroed(bytes.len());
        storage.as_bytes_mut().copy_from_slice(bytes);
        storage
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u128, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u128, u8>(&mut self.words)[..len]
    }

    /// Typed view. The length must be a multiple of `size_of::<T>()`.
    pub fn as_slice<T: Element>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Typed mutable view. The length must be a multiple of `size_of::<T>()`.
    pub fn as_mut_slice<T: Element>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let size = self.len;
        self.as_bytes().get(offset..offset.saturating_add(len)).context(InvalidRangeSnafu { offset, len, size })
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let size = self.len;
        self.as_bytes_mut().get_mut(offset..offset.saturating_add(len)).context(InvalidRangeSnafu { offset, len, size })
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBytes").field("len", &self.len).finish()
    }
}

struct HostData {
    id: ObjectId,
    kind: ElementKind,
    len: usize,
    data: RwLock<AlignedBytes>,
}

/// A host array shared between the application and the engine.
#[derive(Clone)]
pub struct HostArray {
    inner: Arc<HostData>,
}

impl HostArray {
    fn with_storage(kind: ElementKind, len: usize, data: AlignedBytes) -> Self {
        Self { inner: Arc::new(HostData { id: ObjectId::next(), kind, len, data: RwLock::new(data) }) }
    }

    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        Self::with_storage(T::KIND, values.len(), AlignedBytes::from_bytes(bytemuck::cast_slice(values)))
    }

    pub fn zeroed<T: Element>(len: usize) -> Self {
        Self::zeroed_kind(T::KIND, len)
    }

    pub fn zeroed_kind(kind: ElementKind, len: usize) -> Self {
        Self::with_storage(kind, len, AlignedBytes::zeroed(len * kind.bytes()))
    }

    /// Wrap raw bytes. Boolean arrays use one byte per element.
    pub fn from_bytes(kind: ElementKind, bytes: &[u8]) -> Result<Self> {
        let len = kind
            .elements_in(bytes.len())
            .context(SizeMismatchSnafu { expected: bytes.len().next_multiple_of(kind.bytes()), actual: bytes.len() })?;
        Ok(Self::with_storage(kind, len, AlignedBytes::from_bytes(bytes)))
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn kind(&self) -> ElementKind {
        self.inner.kind
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.inner.len * self.inner.kind.bytes()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Raw storage, for drivers copying to and from device memory.
    pub fn data(&self) -> &RwLock<AlignedBytes> {
        &self.inner.data
    }

    fn check_kind<T: Element>(&self) -> Result<()> {
        ensure!(T::KIND == self.inner.kind, KindMismatchSnafu { expected: self.inner.kind, actual: T::KIND });
        Ok(())
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_kind::<T>()?;
        Ok(self.inner.data.read().as_slice::<T>().to_vec())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.data.read().as_bytes().to_vec()
    }

    pub fn read<T: Element, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        self.check_kind::<T>()?;
        Ok(f(self.inner.data.read().as_slice::<T>()))
    }

    /// Mutate the host copy in place.
    ///
    /// The engine does not observe this; callers holding an execution context must
    /// invalidate the object afterwards so device copies are refreshed.
    pub fn write<T: Element, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        self.check_kind::<T>()?;
        Ok(f(self.inner.data.write().as_mut_slice::<T>()))
    }

    pub fn copy_from_slice<T: Element>(&self, values: &[T]) -> Result<()> {
        self.check_kind::<T>()?;
        ensure!(values.len() == self.inner.len, SizeMismatchSnafu { expected: self.inner.len, actual: values.len() });
        self.inner.data.write().as_mut_slice::<T>().copy_from_slice(values);
        Ok(())
    }

    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        check_range(offset, len, self.byte_len())
    }
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("len", &self.inner.len)
            .finish()
    }
}
