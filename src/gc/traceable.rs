//! Payload memory reporting.
//!
//! A mirrored object is charged to its context's ledger for its own size
//! plus whatever its payload reports here. Payloads that own other lifecycle
//! objects report nothing for them: each object is charged through its own
//! mirror.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::object::{LifecycleObject, WeakObject};

/// Payload types that can report the native memory they hold.
///
/// [`LifecycleObject::new_tracked`] charges [`GcTraceable::external_charge`]
/// on top of the object's base size once it is mirrored.
///
/// # Example
///
/// ```ignore
/// #[derive(GcTraceable)]
/// struct Frame {
///     #[gc(track)]
///     pixels: Vec<u8>,
///     // Not counted
///     width: u32,
/// }
///
/// let frame = LifecycleObject::new_tracked(Frame { pixels: vec![0; 4096], width: 64 });
/// ```
pub trait GcTraceable {
    /// Bytes of heap memory held by this value, not counting `self`.
    fn external_memory_size(&self) -> usize;

    /// The same size as a ledger delta.
    fn external_charge(&self) -> i64 {
        i64::try_from(self.external_memory_size()).unwrap_or(i64::MAX)
    }
}

macro_rules! impl_by_capacity {
    ($($ty:ty),* $(,)?) => {
        $(
            impl GcTraceable for $ty {
                fn external_memory_size(&self) -> usize {
                    self.capacity()
                }
            }
        )*
    };
}

impl_by_capacity!(Vec<u8>, String, bytes::BytesMut);

impl GcTraceable for bytes::Bytes {
    fn external_memory_size(&self) -> usize {
        // Storage may be shared with other handles
        self.len()
    }
}

impl<T: GcTraceable> GcTraceable for Option<T> {
    fn external_memory_size(&self) -> usize {
        self.as_ref().map_or(0, GcTraceable::external_memory_size)
    }
}

impl<T: GcTraceable> GcTraceable for Box<T> {
    fn external_memory_size(&self) -> usize {
        size_of::<T>() + T::external_memory_size(self)
    }
}

impl<T: GcTraceable> GcTraceable for Arc<T> {
    fn external_memory_size(&self) -> usize {
        // Charged to whoever holds the last handle
        match Arc::strong_count(self) {
            1 => size_of::<T>() + T::external_memory_size(self),
            _ => 0,
        }
    }
}

fn sequence_size<'a, T: GcTraceable + 'a>(capacity: usize, items: impl Iterator<Item = &'a T>) -> usize {
    capacity * size_of::<T>() + items.map(GcTraceable::external_memory_size).sum::<usize>()
}

impl<T: GcTraceable> GcTraceable for Vec<T> {
    fn external_memory_size(&self) -> usize {
        sequence_size(self.capacity(), self.iter())
    }
}

impl<T: GcTraceable> GcTraceable for VecDeque<T> {
    fn external_memory_size(&self) -> usize {
        sequence_size(self.capacity(), self.iter())
    }
}

impl<T: Send + Sync + 'static> GcTraceable for LifecycleObject<T> {
    fn external_memory_size(&self) -> usize {
        0
    }
}

impl<T: Send + Sync + 'static> GcTraceable for WeakObject<T> {
    fn external_memory_size(&self) -> usize {
        0
    }
}
