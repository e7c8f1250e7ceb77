//! Heap cell type and root tracing
//!
//! Everything the collector manages is a [`HeapCell`]. Values hold
//! [`GcRef`] handles into the heap; roots are the register arena, saved
//! frames and the runtime's intrinsics, reported through
//! [`tern_vm_gc::RootProvider`].

use tern_vm_gc::{GcRef, Heap, RootProvider, Trace, Tracer};

use crate::code::CodeInstance;
use crate::object::JsObject;

/// A heap-allocated VM structure
#[derive(Debug)]
pub enum HeapCell {
    /// Script-visible object
    Object(JsObject),
    /// Code instance
    Code(CodeInstance),
}

impl HeapCell {
    /// Approximate footprint charged to the heap
    pub fn size_hint(&self) -> usize {
        match self {
            HeapCell::Object(object) => object.size_hint(),
            HeapCell::Code(code) => code.size_hint(),
        }
    }
}

impl Trace for HeapCell {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        match self {
            HeapCell::Object(object) => object.trace(tracer),
            HeapCell::Code(code) => code.trace(tracer),
        }
    }
}

/// The VM heap
pub type VmHeap = Heap<HeapCell>;

/// Handles pinned by the host; a handle pinned twice needs two unpins
#[derive(Debug, Default)]
pub struct PinnedRoots {
    refs: Vec<GcRef>,
}

impl PinnedRoots {
    /// Keep a handle alive until [`Self::unpin`]
    pub fn pin(&mut self, handle: GcRef) {
        self.refs.push(handle);
    }

    /// Release one pin of a handle
    pub fn unpin(&mut self, handle: GcRef) {
        if let Some(index) = self.refs.iter().rposition(|&r| r == handle) {
            self.refs.swap_remove(index);
        }
    }

    /// Number of pinned handles
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Whether nothing is pinned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for PinnedRoots {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        for &handle in &self.refs {
            tracer.mark(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_pin_needs_its_own_unpin() {
        let handle = GcRef::default();
        let mut pinned = PinnedRoots::default();
        pinned.pin(handle);
        pinned.pin(handle);
        pinned.unpin(handle);
        assert_eq!(pinned.len(), 1);
        pinned.unpin(handle);
        assert!(pinned.is_empty());
        pinned.unpin(handle);
        assert!(pinned.is_empty());
    }
}
