//! Per-context allocation table
//!
//! Maps allocation indices to their records: a deferred device address and a
//! byte size. Records live in a dense slot arena indexed directly by the
//! allocation-index field of a virtual pointer; the arena grows on demand up
//! to the fixed index capacity and reuses freed slots through a circular
//! cursor, so index values wrap and recycle the way callers expect.

use std::sync::Arc;

use crate::stream::{AddrCell, AddrState, SizeCell};
use crate::vptr::{VirtualPtr, INDEX_CAPACITY};

/// One allocation: deferred address plus size
///
/// The cells are shared with pending stream calls, which is how an
/// asynchronous acknowledgment lands in the record without re-entering the
/// table lock. Cloning the record clones the *sharing*, not the state.
#[derive(Debug, Clone)]
pub struct AllocRecord {
    /// Backing device address; unresolved until the device reports it
    pub addr: Arc<AddrCell>,
    /// Allocation size in bytes
    pub size: Arc<SizeCell>,
}

impl AllocRecord {
    fn new(size: u64) -> Self {
        Self {
            addr: Arc::new(AddrCell::new()),
            size: Arc::new(SizeCell::new(size)),
        }
    }

    /// Current resolution state of the backing address
    pub fn addr_state(&self) -> AddrState {
        self.addr.state()
    }

    /// Allocation size in bytes
    pub fn size(&self) -> u64 {
        self.size.get()
    }
}

/// Arena of allocation records, private to one context
#[derive(Debug)]
pub struct AllocTable {
    /// Slot `i` holds the record for index `i`; slot 0 stays empty
    slots: Vec<Option<AllocRecord>>,
    /// Next index the free search starts from
    cursor: u32,
    live: u32,
    /// One-shot externally-produced pointer adopted by the next reserve
    override_ptr: Option<VirtualPtr>,
}

impl Default for AllocTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            cursor: 1,
            live: 0,
            override_ptr: None,
        }
    }

    /// Advance the cursor circularly through 1..=INDEX_CAPACITY, skipping 0
    fn advance(&mut self) {
        self.cursor = self.cursor % INDEX_CAPACITY + 1;
    }

    /// Reserve the next free index and insert an unresolved record of `size`
    /// bytes. Returns `None` when every index is in use, which the context
    /// reports as out-of-memory, distinct from device-memory exhaustion.
    pub fn reserve(&mut self, size: u64) -> Option<(u16, AllocRecord)> {
        if self.live == INDEX_CAPACITY {
            return None;
        }
        while self.get(self.cursor as u16).is_some() {
            self.advance();
        }
        let index = self.cursor as u16;
        if self.slots.len() <= index as usize {
            self.slots.resize(index as usize + 1, None);
        }
        let record = AllocRecord::new(size);
        self.slots[index as usize] = Some(record.clone());
        self.live += 1;
        self.advance();
        Some((index, record))
    }

    /// Record at `index`, if any
    pub fn get(&self, index: u16) -> Option<&AllocRecord> {
        self.slots.get(index as usize)?.as_ref()
    }

    /// Remove and return the record at `index`
    pub fn remove(&mut self, index: u16) -> Option<AllocRecord> {
        let record = self.slots.get_mut(index as usize)?.take()?;
        self.live -= 1;
        Some(record)
    }

    /// Exchange the contents of two records without touching device memory
    ///
    /// Returns false if either index has no record.
    pub fn swap(&mut self, a: u16, b: u16) -> bool {
        if a == b {
            return self.get(a).is_some();
        }
        if self.get(a).is_none() || self.get(b).is_none() {
            return false;
        }
        self.slots.swap(a as usize, b as usize);
        true
    }

    /// Live records, in index order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &AllocRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (i as u16, r)))
    }

    /// Number of live records
    pub fn live(&self) -> u32 {
        self.live
    }

    /// Drop every record; used by context teardown
    pub fn clear(&mut self) {
        self.slots.clear();
        self.cursor = 1;
        self.live = 0;
        self.override_ptr = None;
    }

    pub fn set_override(&mut self, ptr: Option<VirtualPtr>) {
        self.override_ptr = ptr;
    }

    pub fn override_pending(&self) -> bool {
        self.override_ptr.is_some()
    }

    /// Consume the one-shot override
    pub fn take_override(&mut self) -> Option<VirtualPtr> {
        self.override_ptr.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_skips_zero_and_counts_up() {
        let mut table = AllocTable::new();
        let (first, _) = table.reserve(8).unwrap();
        let (second, _) = table.reserve(8).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_freed_index_is_reused() {
        let mut table = AllocTable::new();
        let (a, _) = table.reserve(8).unwrap();
        let (b, _) = table.reserve(8).unwrap();
        assert!(table.remove(a).is_some());

        // The cursor walks forward and wraps before it finds the hole again.
        let mut seen = Vec::new();
        for _ in 0..INDEX_CAPACITY - 1 {
            let (idx, _) = table.reserve(8).unwrap();
            seen.push(idx);
        }
        assert!(seen.contains(&a), "freed index must come back into rotation");
        assert!(!seen.contains(&b), "live index must never be handed out");
    }

    #[test]
    fn test_exhaustion() {
        let mut table = AllocTable::new();
        for _ in 0..INDEX_CAPACITY {
            assert!(table.reserve(0).is_some());
        }
        assert!(table.reserve(0).is_none());

        // Freeing one slot makes exactly one reserve possible again.
        assert!(table.remove(17).is_some());
        let (idx, _) = table.reserve(0).unwrap();
        assert_eq!(idx, 17);
        assert!(table.reserve(0).is_none());
    }

    #[test]
    fn test_swap_exchanges_records() {
        let mut table = AllocTable::new();
        let (a, ra) = table.reserve(100).unwrap();
        let (b, rb) = table.reserve(200).unwrap();
        ra.addr.fill(0x1000);
        rb.addr.fill(0x2000);

        assert!(table.swap(a, b));
        assert_eq!(table.get(a).unwrap().addr_state(), AddrState::Resolved(0x2000));
        assert_eq!(table.get(a).unwrap().size(), 200);
        assert_eq!(table.get(b).unwrap().addr_state(), AddrState::Resolved(0x1000));
        assert_eq!(table.get(b).unwrap().size(), 100);
    }

    #[test]
    fn test_swap_requires_both_records() {
        let mut table = AllocTable::new();
        let (a, _) = table.reserve(1).unwrap();
        assert!(!table.swap(a, 99));
    }
}
