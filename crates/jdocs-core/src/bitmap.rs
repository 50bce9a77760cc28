//! First-fit index allocator backed by 64-bit words.
//!
//! Used by the send buffer table: bit = 1 means the index is checked out.
//! `used()` always equals the number of set bits.

/// Number of bits per block
const BITS_PER_BLOCK: usize = 64;

#[derive(Debug, Clone)]
pub struct IndexBitmap {
    blocks: Box<[u64]>,
    capacity: u32,
    used: u32,
}

impl IndexBitmap {
    /// All indices free.
    pub fn new(capacity: u32) -> Self {
        let num_blocks = (capacity as usize + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        Self {
            blocks: vec![0u64; num_blocks].into_boxed_slice(),
            capacity,
            used: 0,
        }
    }

    /// All indices checked out.
    pub fn new_full(capacity: u32) -> Self {
        let mut map = Self::new(capacity);
        map.set_range(0, capacity);
        map
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn used(&self) -> u32 {
        self.used
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }

    #[inline]
    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (block, bit) = Self::locate(index);
        self.blocks[block] & (1u64 << bit) != 0
    }

    /// Check out the lowest free index, or `None` if every index is taken.
    pub fn acquire(&mut self) -> Option<u32> {
        for (block_idx, block) in self.blocks.iter_mut().enumerate() {
            if *block == u64::MAX {
                continue;
            }
            let bit = (!*block).trailing_zeros() as usize;
            let index = block_idx * BITS_PER_BLOCK + bit;
            if index >= self.capacity as usize {
                return None;
            }
            *block |= 1u64 << bit;
            self.used += 1;
            return Some(index as u32);
        }
        None
    }

    /// Mark `index` checked out. False if out of range or already set.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (block, bit) = Self::locate(index);
        let mask = 1u64 << bit;
        if self.blocks[block] & mask != 0 {
            return false;
        }
        self.blocks[block] |= mask;
        self.used += 1;
        true
    }

    /// Return `index`. False if out of range or not set.
    pub fn remove(&mut self, index: u32) -> bool {
        if index >= self.capacity {
            return false;
        }
        let (block, bit) = Self::locate(index);
        let mask = 1u64 << bit;
        if self.blocks[block] & mask == 0 {
            return false;
        }
        self.blocks[block] &= !mask;
        self.used -= 1;
        true
    }

    /// Set `[start, start + len)`, clamped to capacity.
    pub fn set_range(&mut self, start: u32, len: u32) {
        self.for_each_span(start, len, |block, mask, used| {
            *used += (!*block & mask).count_ones();
            *block |= mask;
        });
    }

    /// Clear `[start, start + len)`, clamped to capacity.
    pub fn remove_range(&mut self, start: u32, len: u32) {
        self.for_each_span(start, len, |block, mask, used| {
            *used -= (*block & mask).count_ones();
            *block &= !mask;
        });
    }

    pub fn clear(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = 0);
        self.used = 0;
    }

    #[inline]
    fn locate(index: u32) -> (usize, usize) {
        let idx = index as usize;
        (idx / BITS_PER_BLOCK, idx % BITS_PER_BLOCK)
    }

    fn for_each_span<F>(&mut self, start: u32, len: u32, mut f: F)
    where
        F: FnMut(&mut u64, u64, &mut u32),
    {
        let start = start.min(self.capacity) as usize;
        let end = (start + len as usize).min(self.capacity as usize);
        let mut pos = start;
        while pos < end {
            let block = pos / BITS_PER_BLOCK;
            let lo = pos % BITS_PER_BLOCK;
            let hi = (end - block * BITS_PER_BLOCK).min(BITS_PER_BLOCK);
            let width = hi - lo;
            let mask = if width == BITS_PER_BLOCK {
                u64::MAX
            } else {
                ((1u64 << width) - 1) << lo
            };
            f(&mut self.blocks[block], mask, &mut self.used);
            pos = (block + 1) * BITS_PER_BLOCK;
        }
    }
}
