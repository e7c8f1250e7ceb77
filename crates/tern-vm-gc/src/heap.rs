//! The collected heap

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::UNIT_BYTES;
use crate::error::{GcError, GcResult};
use crate::freelist::FreeLists;
use crate::handle::GcRef;
use crate::page::{Cell, FreeRun, MarkBits, Page, PageKind};
use crate::trace::{CellIndex, MarkStack, RootProvider, Trace, Tracer};

/// GC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Units per small page (default: 4096, i.e. 64KB)
    pub page_units: u32,
    /// Free runs shorter than this many units go on quicklists (default: 32)
    pub quick_cutoff_units: u32,
    /// Objects above this size get a dedicated page (default: 8KB)
    pub large_object_bytes: usize,
    /// Collect when live bytes exceed this multiple of the last surviving size (default: 2.0)
    pub load_factor: f64,
    /// Lower factor used when the host is idle (default: 1.25)
    pub offline_load_factor: f64,
    /// Never schedule a collection below this many live bytes (default: 1MB)
    pub min_limit_bytes: usize,
    /// Mark stack entries before overflow handling kicks in (default: 16384)
    pub mark_stack_capacity: usize,
    /// Hard ceiling on live bytes; allocation beyond it fails (default: 1GB)
    pub max_heap_bytes: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            page_units: 4096,
            quick_cutoff_units: 32,
            large_object_bytes: 8 * 1024,
            load_factor: 2.0,
            offline_load_factor: 1.25,
            min_limit_bytes: 1024 * 1024,
            mark_stack_capacity: 16 * 1024,
            max_heap_bytes: 1024 * 1024 * 1024,
        }
    }
}

impl GcConfig {
    /// Set the hard heap ceiling
    pub fn max_heap_bytes(mut self, bytes: usize) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// Set the mark stack capacity
    pub fn mark_stack_capacity(mut self, entries: usize) -> Self {
        self.mark_stack_capacity = entries;
        self
    }

    /// Set the minimum collection limit
    pub fn min_limit_bytes(mut self, bytes: usize) -> Self {
        self.min_limit_bytes = bytes;
        self
    }
}

/// Collection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of collections
    pub collections: u64,
    /// Total time spent in GC (nanoseconds)
    pub total_time_ns: u64,
    /// Bytes reclaimed in last collection
    pub last_reclaimed: usize,
    /// Objects marked in last collection
    pub last_marked: usize,
    /// Mark stack overflows since the heap was created
    pub mark_stack_overflows: u64,
    /// Bytes currently allocated to live cells
    pub live_bytes: usize,
    /// Cells currently allocated
    pub live_objects: usize,
    /// Small pages in use
    pub small_pages: usize,
    /// Large pages in use
    pub large_pages: usize,
    /// Large pages released since the heap was created
    pub released_pages: usize,
}

struct PagesIndex<'a, T>(&'a [Page<T>]);

impl<T> CellIndex for PagesIndex<'_, T> {
    fn contains(&self, handle: GcRef) -> bool {
        self.0
            .get(handle.page as usize)
            .is_some_and(|page| page.cell(handle.unit, handle.generation).is_some())
    }
}

/// Page-based mark-sweep heap holding values of type `T`
pub struct Heap<T> {
    config: GcConfig,
    pages: Vec<Page<T>>,
    marks: Vec<MarkBits>,
    /// Indices of released large pages, reused before `pages` grows
    vacant_pages: Vec<u32>,
    free: FreeLists,
    mark_stack: MarkStack,
    next_generation: u32,
    live_bytes: usize,
    live_objects: usize,
    limit: usize,
    offline_limit: usize,
    stats: GcStats,
}

impl<T: Trace> Heap<T> {
    /// Create a heap
    pub fn new(config: GcConfig) -> Self {
        let limit = config.min_limit_bytes;
        Self {
            free: FreeLists::new(config.quick_cutoff_units),
            mark_stack: MarkStack::new(config.mark_stack_capacity),
            pages: Vec::new(),
            marks: Vec::new(),
            vacant_pages: Vec::new(),
            next_generation: 1,
            live_bytes: 0,
            live_objects: 0,
            limit,
            offline_limit: limit,
            stats: GcStats::default(),
            config,
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    fn units_for(size: usize) -> u32 {
        size.div_ceil(UNIT_BYTES).max(1) as u32
    }

    /// Stale handles into a reused index stay dead: generations are never
    /// handed out twice.
    fn push_page(&mut self, kind: PageKind, capacity: u32) -> u32 {
        match kind {
            PageKind::Small => self.stats.small_pages += 1,
            PageKind::Large => self.stats.large_pages += 1,
        }
        if let Some(index) = self.vacant_pages.pop() {
            self.pages[index as usize] = Page::new(kind, capacity);
            self.marks[index as usize] = MarkBits::new(capacity);
            return index;
        }
        self.pages.push(Page::new(kind, capacity));
        self.marks.push(MarkBits::new(capacity));
        (self.pages.len() - 1) as u32
    }

    /// Allocate `size` bytes holding `value`.
    ///
    /// Does not collect: callers decide when it is safe to run
    /// [`Self::maybe_collect`].
    pub fn allocate(&mut self, size: usize, value: T) -> GcResult<GcRef> {
        let units = Self::units_for(size);
        let bytes = units as usize * UNIT_BYTES;
        if self.live_bytes.saturating_add(bytes) > self.config.max_heap_bytes {
            return Err(GcError::OutOfMemory {
                requested: bytes,
                live: self.live_bytes,
                limit: self.config.max_heap_bytes,
            });
        }

        let large = size > self.config.large_object_bytes || units > self.config.page_units;
        let run = if large {
            let page = self.push_page(PageKind::Large, units);
            FreeRun {
                page,
                start: 0,
                units,
            }
        } else if let Some(run) = self.free.take(units) {
            run
        } else {
            let page = self.push_page(PageKind::Small, self.config.page_units);
            self.free.insert(FreeRun {
                page,
                start: 0,
                units: self.config.page_units,
            });
            self.free.take(units).ok_or(GcError::OutOfMemory {
                requested: bytes,
                live: self.live_bytes,
                limit: self.config.max_heap_bytes,
            })?
        };

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let page = &mut self.pages[run.page as usize];
        let slot = if page.kind == PageKind::Large { 0 } else { run.start as usize };
        debug_assert!(page.cells[slot].is_none(), "allocation over a live cell");
        page.cells[slot] = Some(Box::new(Cell {
            generation,
            units,
            value,
        }));
        self.live_bytes += bytes;
        self.live_objects += 1;
        Ok(GcRef {
            page: run.page,
            unit: run.start,
            generation,
        })
    }

    /// Value behind a handle, or `None` if it was collected
    #[inline]
    pub fn get(&self, handle: GcRef) -> Option<&T> {
        self.pages
            .get(handle.page as usize)?
            .cell(handle.unit, handle.generation)
            .map(|cell| &cell.value)
    }

    /// Mutable value behind a handle, or `None` if it was collected
    #[inline]
    pub fn get_mut(&mut self, handle: GcRef) -> Option<&mut T> {
        self.pages
            .get_mut(handle.page as usize)?
            .cell_mut(handle.unit, handle.generation)
            .map(|cell| &mut cell.value)
    }

    /// Whether the handle still names a live cell
    #[inline]
    pub fn is_live(&self, handle: GcRef) -> bool {
        self.get(handle).is_some()
    }

    /// Bytes currently allocated to cells
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Cells currently allocated
    pub fn len(&self) -> usize {
        self.live_objects
    }

    /// Whether no cells are allocated
    pub fn is_empty(&self) -> bool {
        self.live_objects == 0
    }

    /// Live-byte threshold that triggers [`Self::maybe_collect`]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Statistics snapshot
    pub fn stats(&self) -> GcStats {
        GcStats {
            live_bytes: self.live_bytes,
            live_objects: self.live_objects,
            mark_stack_overflows: self.mark_stack.overflow_count(),
            ..self.stats
        }
    }

    /// Free units on quicklists and the freelist
    pub fn free_bytes(&self) -> usize {
        self.free.free_units() * UNIT_BYTES
    }

    /// Handles of every allocated cell
    pub fn handles(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, page)| !page.released)
            .flat_map(|(index, page)| page.handles(index as u32))
    }

    /// Whether live bytes have passed the collection limit
    pub fn should_collect(&self) -> bool {
        self.live_bytes >= self.limit
    }

    /// Collect if live bytes have passed the load-factor limit.
    ///
    /// Returns bytes reclaimed, or `None` if no collection ran.
    pub fn maybe_collect(&mut self, roots: &dyn RootProvider) -> Option<usize> {
        self.should_collect().then(|| self.force_collect(roots))
    }

    /// Like [`Self::maybe_collect`] with the lower idle-time limit
    pub fn maybe_collect_offline(&mut self, roots: &dyn RootProvider) -> Option<usize> {
        (self.live_bytes >= self.offline_limit).then(|| self.force_collect(roots))
    }

    /// Run a full collection; returns bytes reclaimed
    pub fn force_collect(&mut self, roots: &dyn RootProvider) -> usize {
        let start = Instant::now();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "tern::gc",
            heap_bytes = self.live_bytes,
            objects = self.live_objects,
            pages = self.pages.len(),
            "GC cycle starting"
        );

        let marked = self.mark(roots);
        let reclaimed = self.sweep();

        let survivors = self.live_bytes as f64;
        let floor = self.config.min_limit_bytes;
        self.limit = floor.max((survivors * self.config.load_factor) as usize);
        self.offline_limit = floor.max((survivors * self.config.offline_load_factor) as usize);

        let elapsed = start.elapsed();
        self.stats.collections += 1;
        self.stats.total_time_ns += elapsed.as_nanos() as u64;
        self.stats.last_reclaimed = reclaimed;
        self.stats.last_marked = marked;

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "tern::gc",
            collection = self.stats.collections,
            reclaimed_bytes = reclaimed,
            marked,
            pause_us = elapsed.as_micros() as u64,
            live_bytes = self.live_bytes,
            next_limit = self.limit,
            "GC cycle complete"
        );

        reclaimed
    }

    fn mark(&mut self, roots: &dyn RootProvider) -> usize {
        self.marks.iter_mut().for_each(MarkBits::clear);
        let Heap {
            pages,
            marks,
            mark_stack,
            ..
        } = self;
        let index = PagesIndex(pages.as_slice());
        let mut tracer = Tracer {
            cells: &index,
            marks: marks.as_mut_slice(),
            stack: mark_stack,
            marked: 0,
        };

        roots.trace_roots(&mut tracer);
        drain(pages, &mut tracer);

        while tracer.stack.take_overflow() {
            #[cfg(feature = "gc_logging")]
            tracing::debug!(target: "tern::gc", "mark stack overflow, rescanning marked cells");

            for (page_index, page) in pages.iter().enumerate() {
                if page.released {
                    continue;
                }
                for (unit, cell) in page.cells.iter().enumerate() {
                    let Some(cell) = cell else { continue };
                    if tracer.marks[page_index].is_marked(unit as u32) {
                        cell.value.trace(&mut tracer);
                        drain(pages, &mut tracer);
                    }
                }
            }
        }
        tracer.marked
    }

    fn sweep(&mut self) -> usize {
        let mut reclaimed = 0;
        for (page_index, page) in self.pages.iter_mut().enumerate() {
            if page.released {
                continue;
            }
            let marks = &mut self.marks[page_index];
            for (unit, slot) in page.cells.iter_mut().enumerate() {
                if !marks.is_marked(unit as u32)
                    && let Some(cell) = slot.take()
                {
                    reclaimed += cell.units as usize * UNIT_BYTES;
                    self.live_objects -= 1;
                }
            }
            if page.kind == PageKind::Large && page.is_empty() {
                page.released = true;
                page.cells = Vec::new();
                marks.release();
                self.vacant_pages.push(page_index as u32);
                self.stats.large_pages -= 1;
                self.stats.released_pages += 1;
            }
        }
        self.live_bytes -= reclaimed;

        self.free.clear();
        for (page_index, page) in self.pages.iter().enumerate() {
            if page.kind == PageKind::Small {
                for run in page.free_runs(page_index as u32) {
                    self.free.insert(run);
                }
            }
        }
        reclaimed
    }
}

fn drain<T: Trace>(pages: &[Page<T>], tracer: &mut Tracer<'_>) {
    while let Some(handle) = tracer.stack.pop() {
        if let Some(cell) = pages
            .get(handle.page as usize)
            .and_then(|page| page.cell(handle.unit, handle.generation))
        {
            cell.value.trace(tracer);
        }
    }
}

impl<T> std::fmt::Debug for Heap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pages", &self.pages.len())
            .field("live_bytes", &self.live_bytes)
            .field("live_objects", &self.live_objects)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node(Vec<GcRef>);

    impl Trace for Node {
        fn trace(&self, tracer: &mut Tracer<'_>) {
            for &child in &self.0 {
                tracer.mark(child);
            }
        }
    }

    struct Roots(Vec<GcRef>);

    impl RootProvider for Roots {
        fn trace_roots(&self, tracer: &mut Tracer<'_>) {
            for &root in &self.0 {
                tracer.mark(root);
            }
        }
    }

    #[test]
    fn test_unreachable_cells_are_swept() {
        let mut heap = Heap::new(GcConfig::default());
        let kept = heap.allocate(32, Node(vec![])).unwrap();
        let dropped = heap.allocate(32, Node(vec![])).unwrap();
        let reclaimed = heap.force_collect(&Roots(vec![kept]));
        assert_eq!(reclaimed, 32);
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_freed_space_is_reused_with_new_generation() {
        let mut heap = Heap::new(GcConfig::default());
        let first = heap.allocate(48, Node(vec![])).unwrap();
        heap.force_collect(&Roots(vec![]));
        let second = heap.allocate(48, Node(vec![])).unwrap();
        assert_eq!((first.page(), first.unit()), (second.page(), second.unit()));
        assert_ne!(first.generation(), second.generation());
        assert!(heap.get(first).is_none());
        assert!(heap.get(second).is_some());
    }

    #[test]
    fn test_released_large_page_index_is_recycled() {
        let mut heap = Heap::new(GcConfig::default());
        let big = heap.allocate(64 * 1024, Node(vec![])).unwrap();
        assert_eq!(heap.stats().large_pages, 1);
        heap.force_collect(&Roots(vec![]));
        let stats = heap.stats();
        assert_eq!(stats.large_pages, 0);
        assert_eq!(stats.released_pages, 1);
        let again = heap.allocate(64 * 1024, Node(vec![])).unwrap();
        assert_eq!(big.page(), again.page());
        assert!(!heap.is_live(big));
        assert!(heap.is_live(again));
    }

    #[test]
    fn test_large_allocation_churn_keeps_page_table_bounded() {
        let mut heap = Heap::new(GcConfig::default());
        let keep = heap.allocate(16, Node(vec![])).unwrap();
        for _ in 0..50 {
            heap.allocate(64 * 1024, Node(vec![])).unwrap();
            heap.allocate(32 * 1024, Node(vec![])).unwrap();
            heap.force_collect(&Roots(vec![keep]));
        }
        // One small page plus the two large slots reused every round
        assert_eq!(heap.pages.len(), 3);
        assert_eq!(heap.stats().released_pages, 100);
        assert!(heap.is_live(keep));
    }

    #[test]
    fn test_adjacent_free_runs_coalesce() {
        let mut heap = Heap::new(GcConfig {
            page_units: 64,
            quick_cutoff_units: 8,
            ..GcConfig::default()
        });
        let a = heap.allocate(16, Node(vec![])).unwrap();
        let _b = heap.allocate(16, Node(vec![])).unwrap();
        let c = heap.allocate(16, Node(vec![])).unwrap();
        heap.force_collect(&Roots(vec![a, c]));
        // b and the page tail are split by c; once c dies all three merge.
        heap.force_collect(&Roots(vec![a]));
        assert_eq!(heap.free_bytes(), 63 * UNIT_BYTES);
        let wide = heap.allocate(62 * UNIT_BYTES, Node(vec![])).unwrap();
        assert_eq!((wide.page(), wide.unit()), (a.page(), 1));
    }

    #[test]
    fn test_mark_stack_overflow_still_marks_everything() {
        let mut heap = Heap::new(GcConfig::default().mark_stack_capacity(2));
        let leaves: Vec<_> = (0..50)
            .map(|_| heap.allocate(16, Node(vec![])).unwrap())
            .collect();
        let mut chain = heap.allocate(16, Node(leaves.clone())).unwrap();
        for _ in 0..20 {
            chain = heap.allocate(16, Node(vec![chain])).unwrap();
        }
        let garbage = heap.allocate(16, Node(vec![])).unwrap();
        heap.force_collect(&Roots(vec![chain]));
        assert!(heap.stats().mark_stack_overflows > 0);
        assert!(leaves.iter().all(|&leaf| heap.is_live(leaf)));
        assert!(!heap.is_live(garbage));
        assert_eq!(heap.len(), 50 + 21);
    }

    #[test]
    fn test_heap_ceiling_is_enforced() {
        let mut heap = Heap::new(GcConfig::default().max_heap_bytes(1024));
        assert!(heap.allocate(1000, Node(vec![])).is_ok());
        assert!(matches!(
            heap.allocate(64, Node(vec![])),
            Err(GcError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_limit_tracks_survivors() {
        let mut heap = Heap::new(GcConfig::default().min_limit_bytes(64));
        let roots: Vec<_> = (0..10)
            .map(|_| heap.allocate(160, Node(vec![])).unwrap())
            .collect();
        assert!(heap.should_collect());
        assert_eq!(heap.maybe_collect(&Roots(roots.clone())), Some(0));
        assert_eq!(heap.limit(), 3200);
        assert_eq!(heap.maybe_collect(&Roots(roots)), None);
    }
}
