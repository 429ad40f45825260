//! The swap engine (§2 components C & G): per-file bitmap slot store
//! (`file`), and the out-path/in-path driver (`engine`) built on top of a
//! `PageStore` collaborator that performs the actual page I/O.

pub mod engine;
pub mod file;

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::ids::{SlotRef, SWAP_FILE_CHECKPOINT, SWAP_FILE_REMOTE_MIGRATION};

use file::SwapFile;

/// The full set of registered swap files (≤ `Config::max_swap_files`,
/// capped at 14 real entries since indices 14/15 are reserved, §3.1). Owns
/// the tier-2 "global free-slot lock" from §5: the aggregate free count
/// doubles as a wait-queue for `get_slots` when every file is full.
pub struct SwapFileTable {
    files: Mutex<Vec<Arc<SwapFile>>>,
    max_files: u8,
    cursor: Mutex<usize>,
    free_gate: Mutex<u64>,
    free_cond: Condvar,
}

fn is_reserved_index(index: u8) -> bool {
    index == SWAP_FILE_CHECKPOINT || index == SWAP_FILE_REMOTE_MIGRATION
}

impl SwapFileTable {
    pub fn new(max_files: u8) -> Self {
        SwapFileTable {
            files: Mutex::new(Vec::new()),
            max_files,
            cursor: Mutex::new(0),
            free_gate: Mutex::new(0),
            free_cond: Condvar::new(),
        }
    }

    /// Register a new swap file at `index`. Refuses the two reserved
    /// pseudo-file indices (§3.1) and refuses exceeding `max_files` real
    /// files or re-registering an index already in use.
    pub fn register_file(&self, index: u8, total_slots: u32, slots_per_block: u32) -> Result<()> {
        if is_reserved_index(index) {
            return Err(Error::BadParam);
        }
        let mut files = self.files.lock().unwrap();
        if files.len() as u8 >= self.max_files || files.iter().any(|f| f.index() == index) {
            return Err(Error::BadParam);
        }
        let file = SwapFile::new(index, total_slots, slots_per_block);
        *self.free_gate.lock().unwrap() += file.free_slots() as u64;
        files.push(Arc::new(file));
        Ok(())
    }

    fn file_by_index(&self, index: u8) -> Option<Arc<SwapFile>> {
        self.files.lock().unwrap().iter().find(|f| f.index() == index).cloned()
    }

    /// `get_slots(requestedCluster)`: round-robin across registered files,
    /// returning the first (possibly decayed) run any file can offer. When
    /// every file is completely exhausted: a blocking caller sleeps on the
    /// free-slot gate until a `release` wakes it and retries; a
    /// non-blocking caller observes `would-block`.
    pub fn get_slots(&self, requested: u32, blocking: bool) -> Result<(SlotRef, u32)> {
        loop {
            {
                let files = self.files.lock().unwrap();
                if files.is_empty() {
                    return Err(Error::NotEnoughSlots);
                }
                let mut cursor = self.cursor.lock().unwrap();
                for step in 0..files.len() {
                    let idx = (*cursor + step) % files.len();
                    if let Some((start, count)) = files[idx].claim(requested) {
                        *cursor = (idx + 1) % files.len();
                        *self.free_gate.lock().unwrap() -= count as u64;
                        return Ok((SlotRef::new(files[idx].index(), start), count));
                    }
                }
            }
            if !blocking {
                return Err(Error::WouldBlock);
            }
            let gate = self.free_gate.lock().unwrap();
            if *gate > 0 {
                continue;
            }
            let _ = self
                .free_cond
                .wait_timeout(gate, std::time::Duration::from_millis(50))
                .unwrap();
        }
    }

    /// Return a previously claimed range to its file and wake any waiters
    /// blocked in `get_slots`.
    pub fn release_slots(&self, slot: SlotRef, count: u32) {
        if let Some(file) = self.file_by_index(slot.file_index()) {
            file.release(slot.slot_number(), count);
            *self.free_gate.lock().unwrap() += count as u64;
            self.free_cond.notify_all();
        }
    }

    pub fn is_allocated(&self, slot: SlotRef) -> bool {
        self.file_by_index(slot.file_index())
            .map(|f| f.is_allocated(slot.slot_number()))
            .unwrap_or(false)
    }

    pub fn file(&self, index: u8) -> Option<Arc<SwapFile>> { self.file_by_index(index) }

    pub fn total_free_slots(&self) -> u64 { *self.free_gate.lock().unwrap() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_indices_are_refused() {
        let table = SwapFileTable::new(8);
        assert_eq!(table.register_file(SWAP_FILE_CHECKPOINT, 16, 16), Err(Error::BadParam));
        assert_eq!(table.register_file(SWAP_FILE_REMOTE_MIGRATION, 16, 16), Err(Error::BadParam));
    }

    #[test]
    fn get_slots_round_robins_and_release_replenishes() {
        let table = SwapFileTable::new(8);
        table.register_file(0, 4, 4).unwrap();
        table.register_file(1, 4, 4).unwrap();
        assert_eq!(table.total_free_slots(), 8);
        let (slot_a, count_a) = table.get_slots(4, false).unwrap();
        assert_eq!(slot_a.file_index(), 0);
        assert_eq!(count_a, 4);
        let (slot_b, count_b) = table.get_slots(4, false).unwrap();
        assert_eq!(slot_b.file_index(), 1);
        assert_eq!(count_b, 4);
        assert_eq!(table.get_slots(1, false), Err(Error::WouldBlock));
        table.release_slots(slot_a, count_a);
        assert_eq!(table.total_free_slots(), 4);
        let (slot_c, count_c) = table.get_slots(4, false).unwrap();
        assert_eq!(slot_c.file_index(), 0);
        assert_eq!(count_c, 4);
    }
}
