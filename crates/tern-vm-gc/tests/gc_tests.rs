//! Heap behaviour under mixed allocation and collection

use proptest::prelude::*;
use tern_vm_gc::{GcConfig, GcRef, Heap, RootProvider, Trace, Tracer, UNIT_BYTES};

struct Blob {
    size: usize,
    children: Vec<GcRef>,
}

impl Trace for Blob {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        for &child in &self.children {
            tracer.mark(child);
        }
    }
}

struct Roots<'a>(&'a [GcRef]);

impl RootProvider for Roots<'_> {
    fn trace_roots(&self, tracer: &mut Tracer<'_>) {
        for &root in self.0 {
            tracer.mark(root);
        }
    }
}

fn small_heap() -> Heap<Blob> {
    Heap::new(GcConfig {
        page_units: 256,
        quick_cutoff_units: 16,
        large_object_bytes: 1024,
        ..GcConfig::default()
    })
}

fn assert_no_overlap(heap: &Heap<Blob>, cells: &[GcRef]) {
    let mut spans: Vec<(u32, u32, u32)> = cells
        .iter()
        .filter_map(|&cell| {
            let blob = heap.get(cell)?;
            let units = blob.size.div_ceil(UNIT_BYTES).max(1) as u32;
            Some((cell.page(), cell.unit(), cell.unit() + units))
        })
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.0 == b.0 {
            assert!(a.2 <= b.1, "cells overlap: {a:?} {b:?}");
        }
    }
}

#[test]
fn test_children_survive_through_parents() {
    let mut heap = small_heap();
    let leaf = heap
        .allocate(16, Blob { size: 16, children: vec![] })
        .unwrap();
    let parent = heap
        .allocate(32, Blob { size: 32, children: vec![leaf] })
        .unwrap();
    let orphan = heap
        .allocate(16, Blob { size: 16, children: vec![leaf] })
        .unwrap();
    heap.force_collect(&Roots(&[parent]));
    assert!(heap.is_live(leaf));
    assert!(heap.is_live(parent));
    assert!(!heap.is_live(orphan));
    assert_eq!(heap.stats().last_marked, 2);
}

#[test]
fn test_large_and_small_mix() {
    let mut heap = small_heap();
    let big = heap
        .allocate(4000, Blob { size: 4000, children: vec![] })
        .unwrap();
    let small = heap
        .allocate(64, Blob { size: 64, children: vec![big] })
        .unwrap();
    heap.force_collect(&Roots(&[small]));
    assert!(heap.is_live(big));
    assert_eq!(heap.stats().large_pages, 1);
    heap.force_collect(&Roots(&[]));
    assert!(heap.is_empty());
    assert_eq!(heap.stats().large_pages, 0);
    assert_eq!(heap.live_bytes(), 0);
}

proptest! {
    #[test]
    fn prop_rooted_cells_survive_and_never_overlap(
        rounds in prop::collection::vec(
            (prop::collection::vec(1usize..2048, 1..40), prop::collection::vec(any::<bool>(), 40)),
            1..6,
        )
    ) {
        let mut heap = small_heap();
        let mut rooted: Vec<GcRef> = Vec::new();
        for (sizes, keep) in rounds {
            let mut fresh = Vec::new();
            for size in sizes {
                fresh.push(heap.allocate(size, Blob { size, children: vec![] }).unwrap());
            }
            let mut all = rooted.clone();
            all.extend(&fresh);
            assert_no_overlap(&heap, &all);

            let (kept, dropped): (Vec<_>, Vec<_>) = fresh
                .iter()
                .enumerate()
                .partition(|(i, _)| keep[*i % keep.len()]);
            rooted.extend(kept.into_iter().map(|(_, &cell)| cell));
            heap.force_collect(&Roots(&rooted));

            for &cell in &rooted {
                prop_assert!(heap.is_live(cell));
            }
            for (_, &cell) in dropped {
                prop_assert!(!heap.is_live(cell));
            }
            prop_assert_eq!(heap.len(), rooted.len());
        }
    }
}
