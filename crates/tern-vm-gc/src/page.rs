//! Heap pages

use crate::handle::GcRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageKind {
    Small,
    Large,
}

#[derive(Debug)]
pub(crate) struct Cell<T> {
    pub(crate) generation: u32,
    pub(crate) units: u32,
    pub(crate) value: T,
}

/// A run of free units inside one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeRun {
    pub(crate) page: u32,
    pub(crate) start: u32,
    pub(crate) units: u32,
}

#[derive(Debug)]
pub(crate) struct Page<T> {
    pub(crate) kind: PageKind,
    pub(crate) capacity: u32,
    /// Indexed by unit offset; only cell starts are `Some`
    pub(crate) cells: Vec<Option<Box<Cell<T>>>>,
    pub(crate) released: bool,
}

impl<T> Page<T> {
    pub(crate) fn new(kind: PageKind, capacity: u32) -> Self {
        let slots = match kind {
            PageKind::Small => capacity as usize,
            PageKind::Large => 1,
        };
        let mut cells = Vec::with_capacity(slots);
        cells.resize_with(slots, || None);
        Self {
            kind,
            capacity,
            cells,
            released: false,
        }
    }

    #[inline]
    pub(crate) fn cell(&self, unit: u32, generation: u32) -> Option<&Cell<T>> {
        self.cells
            .get(unit as usize)?
            .as_deref()
            .filter(|cell| cell.generation == generation)
    }

    #[inline]
    pub(crate) fn cell_mut(&mut self, unit: u32, generation: u32) -> Option<&mut Cell<T>> {
        self.cells
            .get_mut(unit as usize)?
            .as_deref_mut()
            .filter(|cell| cell.generation == generation)
    }

    /// Handles of every live cell in the page
    pub(crate) fn handles(&self, page: u32) -> impl Iterator<Item = GcRef> + '_ {
        self.cells.iter().enumerate().filter_map(move |(unit, cell)| {
            cell.as_ref().map(|cell| GcRef {
                page,
                unit: unit as u32,
                generation: cell.generation,
            })
        })
    }

    /// Coalesced runs of units not covered by any cell
    pub(crate) fn free_runs(&self, page: u32) -> Vec<FreeRun> {
        let mut runs = Vec::new();
        let mut unit = 0u32;
        let mut run_start = None;
        while unit < self.capacity {
            match &self.cells[unit as usize] {
                Some(cell) => {
                    if let Some(start) = run_start.take() {
                        runs.push(FreeRun {
                            page,
                            start,
                            units: unit - start,
                        });
                    }
                    unit += cell.units;
                }
                None => {
                    run_start.get_or_insert(unit);
                    unit += 1;
                }
            }
        }
        if let Some(start) = run_start {
            runs.push(FreeRun {
                page,
                start,
                units: self.capacity - start,
            });
        }
        runs
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cells.iter().all(Option::is_none)
    }
}

/// Mark bits for one page, one bit per unit offset
#[derive(Debug, Default)]
pub(crate) struct MarkBits {
    words: Vec<u64>,
}

impl MarkBits {
    pub(crate) fn new(units: u32) -> Self {
        Self {
            words: vec![0; (units as usize).div_ceil(64)],
        }
    }

    #[inline]
    pub(crate) fn is_marked(&self, unit: u32) -> bool {
        let (word, bit) = (unit as usize / 64, unit % 64);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Set the bit; returns `false` if it was already set
    #[inline]
    pub(crate) fn mark(&mut self, unit: u32) -> bool {
        let (word, bit) = (unit as usize / 64, unit % 64);
        match self.words.get_mut(word) {
            Some(w) if *w & (1 << bit) == 0 => {
                *w |= 1 << bit;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.words.fill(0);
    }

    pub(crate) fn release(&mut self) {
        self.words = Vec::new();
    }
}
