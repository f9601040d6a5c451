//! Temporary hardware register allocator.
//!
//! A bitmask of free registers plus an [`LruPool`] of allocated ones. The
//! allocator never spills by itself: `alloc` returns `None` when the range is
//! exhausted and the caller evicts [`TempRegAlloc::least_recently_used`].

use crate::lru::{LruHandle, LruPool};

/// Inclusive register index range.
pub type RegRange = (u8, u8);

/// Bits `first..=last` set.
pub const fn bit_mask32(range: RegRange) -> u32 {
    let (first, last) = range;
    let width = (last - first + 1) as u32;
    let ones = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    ones << first
}

/// Allocator over one or two disjoint ranges of a 32-register class.
#[derive(Debug)]
pub struct TempRegAlloc {
    avail: u32,
    lru: LruPool<u8>,
    slots: [Option<LruHandle>; 32],
}

impl TempRegAlloc {
    /// Manages the registers in `range`.
    pub fn new(range: RegRange) -> Self {
        Self {
            avail: bit_mask32(range),
            lru: LruPool::with_capacity((range.1 - range.0 + 1) as usize),
            slots: [None; 32],
        }
    }

    /// Manages the union of two ranges.
    pub fn with_two_ranges(first: RegRange, second: RegRange) -> Self {
        let count = (first.1 - first.0 + 1) as usize + (second.1 - second.0 + 1) as usize;
        Self {
            avail: bit_mask32(first) | bit_mask32(second),
            lru: LruPool::with_capacity(count),
            slots: [None; 32],
        }
    }

    /// Allocates `preferred` when it is free, otherwise the lowest free
    /// register. `None` when every register is taken.
    pub fn alloc(&mut self, preferred: Option<u8>) -> Option<u8> {
        if self.avail == 0 {
            return None;
        }
        let index = match preferred {
            Some(p) if p < 32 && self.avail & (1 << p) != 0 => p,
            _ => self.avail.trailing_zeros() as u8,
        };
        self.avail &= !(1 << index);
        debug_assert!(self.slots[index as usize].is_none(), "tmpreg already tracked");
        self.slots[index as usize] = Some(self.lru.add(index));
        Some(index)
    }

    /// Marks an allocated register as most recently used. Ignored for free
    /// registers.
    pub fn use_reg(&mut self, index: u8) {
        if let Some(handle) = self.slots.get(index as usize).copied().flatten() {
            self.lru.mark_used(handle);
        }
    }

    /// Returns a register to the pool.
    pub fn free(&mut self, index: u8) {
        debug_assert!(self.is_allocated(index), "freeing unallocated tmpreg {index}");
        if let Some(handle) = self.slots[index as usize].take() {
            self.lru.remove(handle);
            self.avail |= 1 << index;
        }
    }

    /// Whether `index` is managed here and currently allocated.
    pub fn is_allocated(&self, index: u8) -> bool {
        index < 32 && self.slots[index as usize].is_some()
    }

    /// Whether `index` is managed here and currently free.
    pub fn is_free(&self, index: u8) -> bool {
        index < 32 && self.avail & (1 << index) != 0
    }

    /// Eviction candidate. Requires at least one allocated register.
    pub fn least_recently_used(&self) -> u8 {
        let lru = self.lru.least_recent().copied();
        debug_assert!(lru.is_some(), "no allocated tmpreg");
        lru.unwrap_or_default()
    }

    /// Number of allocated registers.
    pub fn allocated_count(&self) -> usize {
        self.lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(bit_mask32((0, 15)), 0x0000_FFFF);
        assert_eq!(bit_mask32((16, 31)), 0xFFFF_0000);
        assert_eq!(bit_mask32((0, 31)), u32::MAX);
        assert_eq!(bit_mask32((3, 3)), 0b1000);
    }

    #[test]
    fn lowest_free_unless_preferred() {
        let mut ra = TempRegAlloc::new((0, 3));
        assert_eq!(ra.alloc(None), Some(0));
        assert_eq!(ra.alloc(Some(2)), Some(2));
        // Taken preference falls back to the lowest free register.
        assert_eq!(ra.alloc(Some(2)), Some(1));
        // Out-of-range preference is ignored.
        assert_eq!(ra.alloc(Some(9)), Some(3));
        assert_eq!(ra.alloc(None), None);

        ra.free(1);
        assert!(ra.is_free(1));
        assert!(!ra.is_allocated(1));
        assert_eq!(ra.alloc(None), Some(1));
    }

    #[test]
    fn eviction_order() {
        let mut ra = TempRegAlloc::new((0, 2));
        ra.alloc(None);
        ra.alloc(None);
        ra.alloc(None);
        assert_eq!(ra.least_recently_used(), 0);
        ra.use_reg(0);
        assert_eq!(ra.least_recently_used(), 1);
        ra.free(1);
        assert_eq!(ra.least_recently_used(), 2);
        // Using a free register changes nothing.
        ra.use_reg(1);
        assert_eq!(ra.least_recently_used(), 2);
        assert_eq!(ra.allocated_count(), 2);
    }

    #[test]
    fn split_ranges_skip_the_gap() {
        let mut ra = TempRegAlloc::with_two_ranges((0, 1), (16, 17));
        let got: Vec<_> = (0..4).filter_map(|_| ra.alloc(None)).collect();
        assert_eq!(got, vec![0, 1, 16, 17]);
        assert_eq!(ra.alloc(Some(5)), None);
        assert!(!ra.is_free(5));
    }
}
