//! Per-file bitmap slot allocator (§3.6, §4.3 "Slot allocator"). One
//! `SwapFile` owns a fixed array of page-sized slots, a free/used bitmap
//! split into blocks (`slots_per_block`, §3.6), and an optional sanity
//! record per slot. Everything here is guarded by the single per-file
//! lock from §5's tier 1 -- bitmap mutation and the per-file counters are
//! always updated together.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::ids::VmId;

/// A plain bit-packed free/used map, one bit per slot (0 = free).
struct Bitmap {
    words: Vec<u64>,
    len: u32,
}

impl Bitmap {
    fn new(len: u32) -> Self {
        Bitmap { words: vec![0u64; (len as usize).div_ceil(64)], len }
    }

    fn get(&self, i: u32) -> bool {
        let w = self.words[(i / 64) as usize];
        (w >> (i % 64)) & 1 == 1
    }

    fn set(&mut self, i: u32, v: bool) {
        let w = &mut self.words[(i / 64) as usize];
        if v {
            *w |= 1 << (i % 64);
        } else {
            *w &= !(1 << (i % 64));
        }
    }
}

/// Find a free run of up to `max` contiguous slots starting anywhere in
/// `[0, block_len)` of `bitmap` (offsets relative to `block_start`).
/// §4.3: "(a) a fast byte-at-a-time scan rounded to multiples of 8 slots,
/// falling back to (b) a bit-by-bit slow scan taking the first usable
/// run."
fn find_free_run(bitmap: &Bitmap, block_start: u32, block_len: u32, max: u32) -> Option<(u32, u32)> {
    let is_free_run = |off: u32, len: u32| (0..len).all(|d| !bitmap.get(block_start + off + d));

    let max = max.min(block_len);
    let aligned_max = (max / 8) * 8;
    let mut try_len = aligned_max;
    while try_len >= 8 {
        let mut off = 0;
        while off + try_len <= block_len {
            if is_free_run(off, try_len) {
                return Some((off, try_len));
            }
            off += 8;
        }
        try_len -= 8;
    }

    let mut off = 0;
    while off < block_len {
        if !bitmap.get(block_start + off) {
            let mut len = 0;
            while len < max && off + len < block_len && !bitmap.get(block_start + off + len) {
                len += 1;
            }
            if len > 0 {
                return Some((off, len));
            }
            off += len.max(1);
        } else {
            off += 1;
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct SanityRecord {
    pub owner: VmId,
    pub ppn: crate::ids::Ppn,
    pub key: Fingerprint,
}

struct Inner {
    bitmap: Bitmap,
    block_free: Vec<u32>,
    last_block: usize,
    free_slots: u32,
    sanity: Option<HashMap<u32, SanityRecord>>,
}

pub struct SwapFile {
    index: u8,
    slots_per_block: u32,
    total_slots: u32,
    inner: Mutex<Inner>,
}

impl SwapFile {
    pub fn new(index: u8, total_slots: u32, slots_per_block: u32) -> Self {
        let num_blocks = (total_slots as usize).div_ceil(slots_per_block as usize).max(1);
        let block_free = (0..num_blocks)
            .map(|b| {
                let start = b as u32 * slots_per_block;
                slots_per_block.min(total_slots.saturating_sub(start))
            })
            .collect();
        SwapFile {
            index,
            slots_per_block,
            total_slots,
            inner: Mutex::new(Inner {
                bitmap: Bitmap::new(total_slots),
                block_free,
                last_block: 0,
                free_slots: total_slots,
                sanity: None,
            }),
        }
    }

    pub fn index(&self) -> u8 { self.index }

    pub fn total_slots(&self) -> u32 { self.total_slots }

    pub fn free_slots(&self) -> u32 { self.inner.lock().unwrap().free_slots }

    /// Claim up to `requested` contiguous slots. Picks a block round-robin
    /// biased toward the last block used (§4.3: "biased to last-used"),
    /// skipping exhausted blocks, and returns whatever run it could find
    /// even if shorter than requested (caller decays and retries, §4.3
    /// step 4).
    pub fn claim(&self, requested: u32) -> Option<(u32, u32)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free_slots == 0 || requested == 0 {
            return None;
        }
        let num_blocks = inner.block_free.len();
        for step in 0..num_blocks {
            let b = (inner.last_block + step) % num_blocks;
            if inner.block_free[b] == 0 {
                continue;
            }
            let block_start = b as u32 * self.slots_per_block;
            let block_len = self.slots_per_block.min(self.total_slots - block_start);
            let max = requested.min(inner.block_free[b]);
            if let Some((off, len)) = find_free_run(&inner.bitmap, block_start, block_len, max) {
                for d in 0..len {
                    inner.bitmap.set(block_start + off + d, true);
                }
                inner.block_free[b] -= len;
                inner.free_slots -= len;
                inner.last_block = b;
                return Some((block_start + off, len));
            }
        }
        None
    }

    /// Return `count` slots starting at `start` to the free pool.
    pub fn release(&self, start: u32, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        for s in start..start + count {
            inner.bitmap.set(s, false);
            let b = (s / self.slots_per_block) as usize;
            inner.block_free[b] += 1;
            if let Some(table) = inner.sanity.as_mut() {
                table.remove(&s);
            }
        }
        inner.free_slots += count;
    }

    pub fn is_allocated(&self, slot: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        slot < self.total_slots && inner.bitmap.get(slot)
    }

    /// Enable the sanity DB. §4.3: only valid to call when no VM currently
    /// reserves swap; the caller (the swap engine) is responsible for
    /// checking that precondition across every VM before calling this.
    pub fn set_sanity_enabled(&self, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if enabled {
            inner.sanity.get_or_insert_with(HashMap::new);
        } else {
            inner.sanity = None;
        }
        Ok(())
    }

    pub fn record_sanity(&self, slot: u32, record: SanityRecord) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(table) = inner.sanity.as_mut() {
            table.insert(slot, record);
        }
    }

    /// Verify a read against the sanity DB, if enabled. Returns `Ok(())`
    /// when sanity is disabled (nothing to check) or the record matches;
    /// `Err(Error::BadSlot)` on mismatch.
    pub fn verify_sanity(&self, slot: u32, owner: VmId, ppn: crate::ids::Ppn, key: Fingerprint) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if let Some(table) = inner.sanity.as_ref() {
            match table.get(&slot) {
                Some(rec) if rec.owner == owner && rec.ppn == ppn && rec.key == key => Ok(()),
                Some(_) => Err(Error::fatal(owner, format!("sanity mismatch at slot {slot}"))),
                None => Err(Error::BadSlot),
            }
        } else {
            Ok(())
        }
    }
}
