//! Tracing interface
//!
//! Heap values implement [`Trace`] to report the handles they hold; the host
//! implements [`RootProvider`] to report everything reachable from outside
//! the heap (registers, frames, globals).

use crate::handle::GcRef;
use crate::page::MarkBits;

/// A value that may hold heap handles
pub trait Trace {
    /// Report every handle held by this value
    fn trace(&self, tracer: &mut Tracer<'_>);
}

/// Supplies the root set for a collection
pub trait RootProvider {
    /// Report every root handle
    fn trace_roots(&self, tracer: &mut Tracer<'_>);
}

impl<A: RootProvider + ?Sized, B: RootProvider + ?Sized> RootProvider for (&A, &B) {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        self.0.trace_roots(tracer);
        self.1.trace_roots(tracer);
    }
}

/// Lets the tracer reject handles to cells that no longer exist
pub(crate) trait CellIndex {
    fn contains(&self, handle: GcRef) -> bool;
}

/// Bounded stack of marked-but-unscanned cells.
///
/// A push onto a full stack drops the handle and records the overflow; the
/// collector then rescans marked cells until a pass completes cleanly.
#[derive(Debug)]
pub(crate) struct MarkStack {
    entries: Vec<GcRef>,
    capacity: usize,
    overflowed: bool,
    overflow_count: u64,
}

impl MarkStack {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            overflowed: false,
            overflow_count: 0,
        }
    }

    #[inline]
    fn push(&mut self, handle: GcRef) {
        if self.entries.len() < self.capacity {
            self.entries.push(handle);
        } else {
            self.overflowed = true;
            self.overflow_count += 1;
        }
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<GcRef> {
        self.entries.pop()
    }

    /// Clear the overflow flag, returning whether it was set
    pub(crate) fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    pub(crate) fn overflow_count(&self) -> u64 {
        self.overflow_count
    }
}

/// Marks cells reachable from the handles it is given
pub struct Tracer<'a> {
    pub(crate) cells: &'a dyn CellIndex,
    pub(crate) marks: &'a mut [MarkBits],
    pub(crate) stack: &'a mut MarkStack,
    pub(crate) marked: usize,
}

impl Tracer<'_> {
    /// Mark a handle; unknown or stale handles are ignored
    #[inline]
    pub fn mark(&mut self, handle: GcRef) {
        if !self.cells.contains(handle) {
            return;
        }
        if let Some(bits) = self.marks.get_mut(handle.page as usize)
            && bits.mark(handle.unit)
        {
            self.marked += 1;
            self.stack.push(handle);
        }
    }

    /// Mark an optional handle
    #[inline]
    pub fn mark_opt(&mut self, handle: Option<GcRef>) {
        if let Some(handle) = handle {
            self.mark(handle);
        }
    }

    /// Trace every element of an iterator
    pub fn trace_all<'t, T: Trace + 't>(&mut self, values: impl IntoIterator<Item = &'t T>) {
        for value in values {
            value.trace(self);
        }
    }
}
