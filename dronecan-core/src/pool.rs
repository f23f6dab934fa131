//! Fixed-size pool allocator: the sole memory source for RX state records,
//! TX queue nodes and payload buffer blocks.
//!
//! The C original partitions a caller-provided arena into same-size blocks
//! and threads a LIFO free list through them with raw pointers recast via a
//! union. Here the arena is a caller-provided `&mut [Slot<H, B>]` slice and
//! cross-references are `Option<u16>` arena indices rather than pointers —
//! the arena-index handle the design notes call out as a pointer-free way
//! to keep the one-pool invariant.

use crate::rx::{BufferBlock, RxState};
use crate::tx::TxQueueNode;

/// One arena element: free, or occupied by exactly one of the three record
/// kinds the engine allocates. All three record kinds share this single
/// pool, exactly as the block class they're carved from is sized to the
/// max of the three.
pub enum Slot<const H: usize, const B: usize> {
    Free(Option<u16>),
    Rx(RxState<H>),
    Tx(TxQueueNode),
    Buf(BufferBlock<B>),
}

impl<const H: usize, const B: usize> Default for Slot<H, B> {
    fn default() -> Self {
        Slot::Free(None)
    }
}

/// Usage snapshot: `current + free_list_length == capacity` always holds,
/// and `peak` is monotone non-decreasing for the life of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStatistics {
    pub capacity_blocks: u16,
    pub current_usage_blocks: u16,
    pub peak_usage_blocks: u16,
}

pub struct Pool<'a, const H: usize, const B: usize> {
    slots: &'a mut [Slot<H, B>],
    free_head: Option<u16>,
    current_usage: u16,
    peak_usage: u16,
}

impl<'a, const H: usize, const B: usize> Pool<'a, H, B> {
    /// Threads a free list through the given arena. Every element is reset
    /// to `Free`, discarding whatever it held before.
    pub fn new(slots: &'a mut [Slot<H, B>]) -> Self {
        let capacity = slots.len();
        debug_assert!(capacity <= u16::MAX as usize, "pool capacity must fit a u16 index");

        for (i, slot) in slots.iter_mut().enumerate() {
            let next = if i + 1 < capacity { Some((i + 1) as u16) } else { None };
            *slot = Slot::Free(next);
        }

        Self {
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            current_usage: 0,
            peak_usage: 0,
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        PoolStatistics {
            capacity_blocks: self.slots.len() as u16,
            current_usage_blocks: self.current_usage,
            peak_usage_blocks: self.peak_usage,
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        let idx = self.free_head?;
        let next = match &self.slots[idx as usize] {
            Slot::Free(n) => *n,
            _ => unreachable!("free list pointed at an occupied slot"),
        };
        self.free_head = next;
        self.current_usage += 1;
        if self.current_usage > self.peak_usage {
            self.peak_usage = self.current_usage;
        }
        Some(idx)
    }

    fn release(&mut self, idx: u16) {
        self.slots[idx as usize] = Slot::Free(self.free_head);
        self.free_head = Some(idx);
        self.current_usage -= 1;
    }

    pub(crate) fn alloc_rx(&mut self, state: RxState<H>) -> Option<u16> {
        let idx = self.allocate()?;
        self.slots[idx as usize] = Slot::Rx(state);
        Some(idx)
    }

    pub(crate) fn alloc_tx(&mut self, node: TxQueueNode) -> Option<u16> {
        let idx = self.allocate()?;
        self.slots[idx as usize] = Slot::Tx(node);
        Some(idx)
    }

    pub(crate) fn alloc_buf(&mut self, block: BufferBlock<B>) -> Option<u16> {
        let idx = self.allocate()?;
        self.slots[idx as usize] = Slot::Buf(block);
        Some(idx)
    }

    pub(crate) fn free_rx(&mut self, idx: u16) {
        self.release(idx);
    }

    pub(crate) fn free_tx(&mut self, idx: u16) {
        self.release(idx);
    }

    pub(crate) fn free_buf(&mut self, idx: u16) {
        self.release(idx);
    }

    pub(crate) fn rx(&self, idx: u16) -> &RxState<H> {
        match &self.slots[idx as usize] {
            Slot::Rx(s) => s,
            _ => unreachable!("index does not refer to an rx state"),
        }
    }

    pub(crate) fn rx_mut(&mut self, idx: u16) -> &mut RxState<H> {
        match &mut self.slots[idx as usize] {
            Slot::Rx(s) => s,
            _ => unreachable!("index does not refer to an rx state"),
        }
    }

    pub(crate) fn tx(&self, idx: u16) -> &TxQueueNode {
        match &self.slots[idx as usize] {
            Slot::Tx(n) => n,
            _ => unreachable!("index does not refer to a tx node"),
        }
    }

    pub(crate) fn tx_mut(&mut self, idx: u16) -> &mut TxQueueNode {
        match &mut self.slots[idx as usize] {
            Slot::Tx(n) => n,
            _ => unreachable!("index does not refer to a tx node"),
        }
    }

    pub(crate) fn buf(&self, idx: u16) -> &BufferBlock<B> {
        match &self.slots[idx as usize] {
            Slot::Buf(b) => b,
            _ => unreachable!("index does not refer to a buffer block"),
        }
    }

    pub(crate) fn buf_mut(&mut self, idx: u16) -> &mut BufferBlock<B> {
        match &mut self.slots[idx as usize] {
            Slot::Buf(b) => b,
            _ => unreachable!("index does not refer to a buffer block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena<const H: usize, const B: usize, const N: usize>() -> [Slot<H, B>; N] {
        core::array::from_fn(|_| Slot::Free(None))
    }

    #[test]
    fn usage_and_peak_track_allocations() {
        let mut slots = arena::<6, 32, 4>();
        let mut pool = Pool::new(&mut slots);

        let a = pool.alloc_rx(RxState::new(1)).unwrap();
        let b = pool.alloc_rx(RxState::new(2)).unwrap();
        assert_eq!(pool.statistics().current_usage_blocks, 2);
        assert_eq!(pool.statistics().peak_usage_blocks, 2);

        pool.free_rx(a);
        assert_eq!(pool.statistics().current_usage_blocks, 1);
        assert_eq!(pool.statistics().peak_usage_blocks, 2, "peak must not decrease");

        pool.free_rx(b);
        assert_eq!(pool.statistics().current_usage_blocks, 0);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mut slots = arena::<6, 32, 2>();
        let mut pool = Pool::new(&mut slots);

        assert!(pool.alloc_rx(RxState::new(1)).is_some());
        assert!(pool.alloc_rx(RxState::new(2)).is_some());
        assert!(pool.alloc_rx(RxState::new(3)).is_none());
    }

    #[test]
    fn capacity_equals_current_plus_free_list() {
        let mut slots = arena::<6, 32, 5>();
        let mut pool = Pool::new(&mut slots);

        for i in 0..3u32 {
            pool.alloc_rx(RxState::new(i)).unwrap();
        }
        let stats = pool.statistics();
        assert_eq!(stats.current_usage_blocks, 3);
        assert_eq!(stats.capacity_blocks, 5);
    }
}
