//! Quicklists and the general freelist

use crate::page::FreeRun;

/// Free runs indexed for allocation.
///
/// Runs shorter than the cutoff live in `quick[units]`; `non_empty` has bit
/// `n` set exactly when `quick[n]` has an entry. Longer runs go to
/// `general`, searched first-fit.
#[derive(Debug)]
pub(crate) struct FreeLists {
    quick: Vec<Vec<FreeRun>>,
    non_empty: Vec<u64>,
    general: Vec<FreeRun>,
    cutoff: u32,
}

impl FreeLists {
    pub(crate) fn new(cutoff: u32) -> Self {
        let cutoff = cutoff.max(1);
        Self {
            quick: vec![Vec::new(); cutoff as usize],
            non_empty: vec![0; (cutoff as usize).div_ceil(64)],
            general: Vec::new(),
            cutoff,
        }
    }

    fn set_bit(&mut self, units: u32, set: bool) {
        let (word, bit) = (units as usize / 64, units % 64);
        if set {
            self.non_empty[word] |= 1 << bit;
        } else {
            self.non_empty[word] &= !(1 << bit);
        }
    }

    /// Smallest non-empty quicklist class at or above `units`
    fn next_quick_class(&self, units: u32) -> Option<u32> {
        let mut word = units as usize / 64;
        let mut mask = !0u64 << (units % 64);
        while word < self.non_empty.len() {
            let bits = self.non_empty[word] & mask;
            if bits != 0 {
                return Some(word as u32 * 64 + bits.trailing_zeros());
            }
            word += 1;
            mask = !0;
        }
        None
    }

    pub(crate) fn insert(&mut self, run: FreeRun) {
        if run.units == 0 {
            return;
        }
        if run.units < self.cutoff {
            self.quick[run.units as usize].push(run);
            self.set_bit(run.units, true);
        } else {
            self.general.push(run);
        }
    }

    fn pop_quick(&mut self, class: u32) -> Option<FreeRun> {
        let list = &mut self.quick[class as usize];
        let run = list.pop();
        if list.is_empty() {
            self.set_bit(class, false);
        }
        run
    }

    /// Carve `units` from the front of a suitable run; the rest is requeued
    pub(crate) fn take(&mut self, units: u32) -> Option<FreeRun> {
        let found = if units < self.cutoff {
            self.next_quick_class(units)
                .and_then(|class| self.pop_quick(class))
        } else {
            None
        };
        let run = match found {
            Some(run) => run,
            None => {
                let index = self.general.iter().position(|run| run.units >= units)?;
                self.general.swap_remove(index)
            }
        };
        if run.units > units {
            self.insert(FreeRun {
                page: run.page,
                start: run.start + units,
                units: run.units - units,
            });
        }
        Some(FreeRun { units, ..run })
    }

    pub(crate) fn clear(&mut self) {
        self.quick.iter_mut().for_each(Vec::clear);
        self.non_empty.fill(0);
        self.general.clear();
    }

    pub(crate) fn free_units(&self) -> usize {
        self.quick
            .iter()
            .flatten()
            .chain(self.general.iter())
            .map(|run| run.units as usize)
            .sum()
    }
}
