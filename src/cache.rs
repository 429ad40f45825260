//! PPN->MPN fast-path cache (§3.5): a small, fixed-size, direct-mapped
//! cache of {firstPPN, lastPPN} -> machine address + flags, used as a fast
//! path for DMA setup (`phys_to_mach_range`). Any PFrame mutation for PPN
//! `p` must invalidate entries for `p` and `p-1`, since a cached mapping
//! may span two guest pages.

use crate::ids::{Mpn, Ppn};

#[derive(Debug, Clone, Copy)]
pub struct CacheEntry {
    pub first_ppn: Ppn,
    pub last_ppn: Ppn,
    pub mpn_base: Mpn,
    pub read_only: bool,
    /// Number of times this range has been served "hot" (copy count),
    /// reported back to the caller for statistics; has no effect on
    /// eviction policy.
    pub hot_copy_count: u32,
}

pub struct FastPathCache {
    slots: Vec<Option<CacheEntry>>,
}

impl FastPathCache {
    pub fn new(capacity: usize) -> Self { FastPathCache { slots: vec![None; capacity.max(1)] } }

    fn slot_for(&self, ppn: Ppn) -> usize { (ppn.0 as usize) % self.slots.len() }

    pub fn lookup(&mut self, ppn: Ppn) -> Option<CacheEntry> {
        let idx = self.slot_for(ppn);
        match self.slots[idx] {
            Some(e) if ppn.0 >= e.first_ppn.0 && ppn.0 <= e.last_ppn.0 => {
                self.slots[idx].as_mut().unwrap().hot_copy_count += 1;
                Some(e)
            }
            _ => None,
        }
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        let idx = self.slot_for(entry.first_ppn);
        self.slots[idx] = Some(entry);
    }

    /// Invalidate any entry covering `ppn` (a PFrame just mutated at `ppn`
    /// may also invalidate a mapping covering `ppn - 1`, since a cached
    /// range can span two pages -- see module docs).
    pub fn invalidate(&mut self, ppn: Ppn) {
        for slot in self.slots.iter_mut() {
            if let Some(e) = slot {
                if ppn.0 >= e.first_ppn.0 && ppn.0 <= e.last_ppn.0 {
                    *slot = None;
                }
            }
        }
        if ppn.0 > 0 {
            let prev = Ppn(ppn.0 - 1);
            for slot in self.slots.iter_mut() {
                if let Some(e) = slot {
                    if prev.0 >= e.first_ppn.0 && prev.0 <= e.last_ppn.0 {
                        *slot = None;
                    }
                }
            }
        }
    }

    /// True if any entry overlaps `ppn` -- used by the COW `share` path to
    /// refuse sharing a page currently pinned into a DMA mapping (§4.2).
    pub fn contains(&self, ppn: Ppn) -> bool {
        self.slots.iter().flatten().any(|e| ppn.0 >= e.first_ppn.0 && ppn.0 <= e.last_ppn.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_clears_spanning_and_adjacent_entry() {
        let mut cache = FastPathCache::new(8);
        cache.insert(CacheEntry {
            first_ppn: Ppn(10),
            last_ppn: Ppn(11),
            mpn_base: Mpn(100),
            read_only: false,
            hot_copy_count: 0,
        });
        assert!(cache.lookup(Ppn(10)).is_some());
        cache.invalidate(Ppn(11));
        assert!(cache.lookup(Ppn(10)).is_none());
    }

    #[test]
    fn invalidate_of_p_also_clears_p_minus_1_span() {
        let mut cache = FastPathCache::new(8);
        cache.insert(CacheEntry {
            first_ppn: Ppn(5),
            last_ppn: Ppn(6),
            mpn_base: Mpn(1),
            read_only: true,
            hot_copy_count: 0,
        });
        // mutating ppn 7 should also invalidate a range ending at ppn 6 (7-1)
        cache.invalidate(Ppn(7));
        assert!(cache.lookup(Ppn(5)).is_none());
    }
}
