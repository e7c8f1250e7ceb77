//! Growable block stack
//!
//! A LIFO arena of slots split over blocks of increasing size. A new window
//! may overlap the top of the previous one, which is how a callee's frame
//! shares the caller's argument slots without copying. When a window does
//! not fit in the current block it starts a fresh block and the overlapped
//! prefix is copied forward; freeing it copies the requested prefix back.
//!
//! Register windows and the saved-frame stack are both block stacks.

use crate::error::{VmError, VmResult};

/// A contiguous run of slots inside one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    /// Block index
    pub block: usize,
    /// First slot within the block
    pub start: usize,
    /// Number of slots
    pub len: usize,
}

#[derive(Debug)]
struct Block<T> {
    slots: Vec<T>,
    used: usize,
}

/// LIFO slot arena made of blocks
#[derive(Debug)]
pub struct BlockStack<T> {
    blocks: Vec<Block<T>>,
    current: usize,
    first_capacity: usize,
    growth_ratio: usize,
    max_slots: usize,
    reserved: usize,
    used: usize,
}

impl<T: Clone + Default> BlockStack<T> {
    /// Create an empty stack; no memory is reserved until the first allocation
    pub fn new(first_capacity: usize, growth_ratio: usize, max_slots: usize) -> Self {
        Self {
            blocks: Vec::new(),
            current: 0,
            first_capacity: first_capacity.max(1),
            growth_ratio: growth_ratio.max(1),
            max_slots,
            reserved: 0,
            used: 0,
        }
    }

    fn new_block(&mut self, capacity: usize) -> VmResult<Block<T>> {
        if self.reserved.saturating_add(capacity) > self.max_slots {
            return Err(VmError::OutOfMemory);
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| VmError::OutOfMemory)?;
        slots.resize(capacity, T::default());
        self.reserved += capacity;
        Ok(Block { slots, used: 0 })
    }

    /// Allocate `size` slots whose first `overlap` slots alias the top of the
    /// current window.
    ///
    /// If the window has to start a new block, the first `copy` overlapped
    /// slots are copied into it. Returns the window and whether it is the
    /// first window of a fresh block; both must be handed back to
    /// [`Self::free`].
    pub fn allocate(&mut self, size: usize, overlap: usize, copy: usize) -> VmResult<(Window, bool)> {
        debug_assert!(copy <= overlap && overlap <= size);
        if self.blocks.is_empty() {
            let block = self.new_block(self.first_capacity.max(size))?;
            self.blocks.push(block);
        }

        let current = self.current;
        let block = &mut self.blocks[current];
        debug_assert!(overlap <= block.used);
        let start = block.used - overlap;
        if start + size <= block.slots.len() {
            block.used = start + size;
            self.used += size - overlap;
            return Ok((
                Window {
                    block: current,
                    start,
                    len: size,
                },
                false,
            ));
        }

        let next = current + 1;
        if next < self.blocks.len() && self.blocks[next].slots.len() < size {
            let dropped: usize = self.blocks.drain(next..).map(|b| b.slots.len()).sum();
            self.reserved -= dropped;
        }
        if next == self.blocks.len() {
            let grown = self.blocks[current]
                .slots
                .len()
                .saturating_mul(self.growth_ratio);
            let budget = self.max_slots.saturating_sub(self.reserved);
            let capacity = grown.min(budget).max(size);
            let block = self.new_block(capacity)?;
            self.blocks.push(block);
        }

        let (before, after) = self.blocks.split_at_mut(next);
        let source = &before[current];
        let target = &mut after[0];
        target.slots[..copy].clone_from_slice(&source.slots[start..start + copy]);
        target.used = size;
        self.current = next;
        self.used += size;
        Ok((
            Window {
                block: next,
                start: 0,
                len: size,
            },
            true,
        ))
    }

    /// Release the topmost window.
    ///
    /// The arguments must match the [`Self::allocate`] call that produced
    /// `window`. For a first-in-block window the `copy` slots carried
    /// forward are copied back over the previous block, so the caller sees
    /// them exactly as it would had the window stayed in its block.
    pub fn free(&mut self, window: Window, overlap: usize, copy: usize, first_in_block: bool) {
        debug_assert_eq!(window.block, self.current);
        let size = window.len;
        if !first_in_block {
            let block = &mut self.blocks[self.current];
            debug_assert_eq!(window.start + size, block.used);
            let keep = window.start + overlap;
            block.slots[keep..window.start + size].fill(T::default());
            block.used = keep;
            self.used -= size - overlap;
            return;
        }

        let previous = self.current - 1;
        let (before, after) = self.blocks.split_at_mut(self.current);
        let source = &mut after[0];
        let target = &mut before[previous];
        let dest = target.used - overlap;
        target.slots[dest..dest + copy].clone_from_slice(&source.slots[..copy]);
        source.slots[..size].fill(T::default());
        source.used = 0;
        self.current = previous;
        self.used -= size;
    }

    /// Slots of a window
    #[inline]
    pub fn slots(&self, window: Window) -> &[T] {
        if window.len == 0 {
            return &[];
        }
        &self.blocks[window.block].slots[window.start..window.start + window.len]
    }

    /// Mutable slots of a window
    #[inline]
    pub fn slots_mut(&mut self, window: Window) -> &mut [T] {
        if window.len == 0 {
            return &mut [];
        }
        &mut self.blocks[window.block].slots[window.start..window.start + window.len]
    }

    /// The topmost `len` slots as a window, with its first-in-block flag
    pub fn top_window(&self, len: usize) -> Option<(Window, bool)> {
        let block = self.blocks.get(self.current)?;
        let start = block.used.checked_sub(len)?;
        let window = Window {
            block: self.current,
            start,
            len,
        };
        Some((window, start == 0 && self.current > 0))
    }

    /// End of the current block, in slots
    pub fn limit(&self) -> usize {
        self.blocks
            .get(self.current)
            .map(|block| block.slots.len())
            .unwrap_or(0)
    }

    /// Slots in use across all blocks
    pub fn used(&self) -> usize {
        self.used
    }

    /// Slots reserved across all blocks
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Number of blocks allocated so far
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Every slot in use, bottom to top
    pub fn live(&self) -> impl Iterator<Item = &T> {
        let end = if self.blocks.is_empty() { 0 } else { self.current + 1 };
        self.blocks[..end]
            .iter()
            .flat_map(|block| block.slots[..block.used].iter())
    }

    /// Every slot in use, top to bottom
    pub fn live_rev(&self) -> impl Iterator<Item = &T> {
        let end = if self.blocks.is_empty() { 0 } else { self.current + 1 };
        self.blocks[..end]
            .iter()
            .rev()
            .flat_map(|block| block.slots[..block.used].iter().rev())
    }

    /// Mutable access to the `n`th used slot counting down from the top
    pub fn nth_from_top_mut(&mut self, n: usize) -> Option<&mut T> {
        let end = if self.blocks.is_empty() { 0 } else { self.current + 1 };
        self.blocks[..end]
            .iter_mut()
            .rev()
            .flat_map(|block| block.slots[..block.used].iter_mut().rev())
            .nth(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_overlap_shares_slots() {
        let mut stack: BlockStack<u32> = BlockStack::new(16, 2, 1024);
        let (caller, first) = stack.allocate(6, 0, 0).unwrap();
        // Block 0 has no previous block to copy back into
        assert!(!first);
        stack.slots_mut(caller).copy_from_slice(&[0, 1, 2, 3, 10, 11]);
        let (callee, first) = stack.allocate(5, 2, 2).unwrap();
        assert!(!first);
        assert_eq!(&stack.slots(callee)[..2], &[10, 11]);
        stack.slots_mut(callee)[0] = 99;
        stack.free(callee, 2, 2, false);
        assert_eq!(stack.slots(caller)[4], 99);
        assert_eq!(stack.used(), 6);
    }

    #[test]
    fn test_block_switch_copies_both_ways() {
        let mut stack: BlockStack<u32> = BlockStack::new(8, 2, 1024);
        let (caller, _) = stack.allocate(8, 0, 0).unwrap();
        stack.slots_mut(caller).copy_from_slice(&[0, 0, 0, 0, 0, 7, 8, 9]);
        let (callee, first) = stack.allocate(6, 3, 3).unwrap();
        assert!(first);
        assert_eq!(callee.block, 1);
        assert_eq!(&stack.slots(callee)[..3], &[7, 8, 9]);
        assert!(stack.limit() >= 16);
        stack.slots_mut(callee)[0] = 42;
        stack.slots_mut(callee)[2] = 43;
        stack.free(callee, 3, 3, true);
        assert_eq!(&stack.slots(caller)[5..], &[42, 8, 43]);
        assert_eq!(stack.used(), 8);
    }

    #[test]
    fn test_max_slots_is_enforced() {
        let mut stack: BlockStack<u32> = BlockStack::new(8, 2, 24);
        stack.allocate(8, 0, 0).unwrap();
        stack.allocate(16, 0, 0).unwrap();
        assert!(matches!(stack.allocate(4, 0, 0), Err(VmError::OutOfMemory)));
    }

    #[test]
    fn test_blocks_are_reused() {
        let mut stack: BlockStack<u32> = BlockStack::new(4, 2, 1024);
        let (a, _) = stack.allocate(4, 0, 0).unwrap();
        let (b, first) = stack.allocate(4, 0, 0).unwrap();
        assert!(first);
        stack.free(b, 0, 0, first);
        let (c, first) = stack.allocate(3, 0, 0).unwrap();
        assert!(first);
        assert_eq!(c.block, 1);
        assert_eq!(stack.block_count(), 2);
        stack.free(c, 0, 0, first);
        stack.free(a, 0, 0, false);
        assert_eq!(stack.used(), 0);
    }

    proptest! {
        #[test]
        fn prop_nested_windows_restore_caller_state(
            frames in prop::collection::vec((1usize..12, 0usize..4), 1..40)
        ) {
            let mut stack: BlockStack<u64> = BlockStack::new(8, 2, 1 << 16);
            let (root, root_first) = stack.allocate(4, 0, 0).unwrap();
            // (window, overlap, first_in_block, used before, limit before)
            let mut live = vec![(root, 0usize, root_first, 0usize, 0usize)];
            let mut expected: Vec<Vec<u64>> = vec![vec![0; 4]];

            for (depth, &(extra, overlap)) in frames.iter().enumerate() {
                let top = live.last().unwrap().0;
                let overlap = overlap.min(top.len);
                let size = overlap + extra;
                let (used, limit) = (stack.used(), stack.limit());
                let (window, first) = stack.allocate(size, overlap, overlap).unwrap();
                prop_assert_eq!(
                    stack.slots(window)[..overlap].to_vec(),
                    stack.slots(top)[top.len - overlap..].to_vec()
                );
                // A fresh block holds its own copy of the overlapped slots
                let added = if first { size } else { size - overlap };
                prop_assert_eq!(stack.used(), used + added);
                stack.slots_mut(window).fill(depth as u64 + 1);
                if !first {
                    // Shared slots change under the caller immediately
                    let caller = expected.last_mut().unwrap();
                    let len = caller.len();
                    caller[len - overlap..].fill(depth as u64 + 1);
                }
                expected.push(stack.slots(window).to_vec());
                live.push((window, overlap, first, used, limit));
            }

            while live.len() > 1 {
                let (window, overlap, first, used, limit) = live.pop().unwrap();
                let shared = stack.slots(window)[..overlap].to_vec();
                expected.pop();
                stack.free(window, overlap, overlap, first);
                prop_assert_eq!(stack.used(), used);
                prop_assert_eq!(stack.limit(), limit);

                let caller = live.last().unwrap().0;
                let last = expected.last_mut().unwrap();
                let len = last.len();
                last[len - overlap..].copy_from_slice(&shared);
                prop_assert_eq!(stack.slots(caller).to_vec(), last.clone());
            }
            prop_assert_eq!(stack.used(), 4);
        }
    }
}
