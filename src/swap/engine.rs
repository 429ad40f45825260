//! Swap driver building blocks (§4.3 out-path/in-path). This module holds
//! the pure, VM-agnostic mechanics -- candidate preparation, decaying
//! cluster writes, retrying reads, the async-IO token gate -- that
//! `crate::vm` wires up against a specific VM's PFrame directory. Keeping
//! these as free functions over `&SwapFileTable`/`&dyn PageStore` (rather
//! than a god-object that also knows about PFrame state) mirrors the
//! teacher's habit of keeping `mem.rs`'s allocation routines ignorant of
//! `services.rs`'s process bookkeeping.

use std::sync::{Condvar, Mutex};

use crate::cache::FastPathCache;
use crate::config::RetryBackoff;
use crate::error::Result;
use crate::hooks::PageStore;
use crate::ids::{Ppn, SlotRef};
use crate::pframe::{PFrame, PFrameState};

use super::SwapFileTable;

/// Tier-4 lock (§5): caps concurrently in-flight async writes/reads.
pub struct AsyncIoTokens {
    count: Mutex<usize>,
    cap: usize,
    cond: Condvar,
}

impl AsyncIoTokens {
    pub fn new(cap: usize) -> Self { AsyncIoTokens { count: Mutex::new(0), cap: cap.max(1), cond: Condvar::new() } }

    /// Block until a token is available, then hold it until the guard
    /// drops.
    pub fn acquire(&self) -> AsyncIoTokenGuard<'_> {
        let mut count = self.count.lock().unwrap();
        while *count >= self.cap {
            count = self.cond.wait(count).unwrap();
        }
        *count += 1;
        AsyncIoTokenGuard { tokens: self }
    }

    pub fn in_flight(&self) -> usize { *self.count.lock().unwrap() }
}

pub struct AsyncIoTokenGuard<'a> {
    tokens: &'a AsyncIoTokens,
}

impl Drop for AsyncIoTokenGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.tokens.count.lock().unwrap();
        *count -= 1;
        self.tokens.cond.notify_one();
    }
}

/// §4.3 out-path step 3: "sorted, deduplicated". A plain sort+dedup over
/// the monitor's candidate batch, which may itself contain duplicates.
pub fn prepare_candidates(mut candidates: Vec<Ppn>) -> Vec<Ppn> {
    candidates.sort_by_key(|p| p.0);
    candidates.dedup();
    candidates
}

/// §4.1 tie-break / §4.3 step 3: whether `frame` is a legal swap-out
/// candidate right now -- valid, unpinned, not already mid-swap, and not
/// present in the fast-path DMA cache.
pub fn can_swap(frame: &PFrame, cache: &FastPathCache, ppn: Ppn) -> bool {
    frame.is_valid()
        && !frame.is_pinned()
        && matches!(frame.state(), PFrameState::Regular | PFrameState::Cow | PFrameState::CowHint)
        && !cache.contains(ppn)
}

pub struct ClusterWriteOutcome {
    pub written: Vec<(Ppn, SlotRef)>,
    pub failed: Vec<Ppn>,
}

/// §4.3 step 4: "`cluster_write` loops issuing async writes whose size
/// decays by halves on partial slot-allocation". `pages` is already
/// content-captured (the caller snapshots each page's bytes before
/// calling, since the write happens after the per-VM lock is dropped).
pub fn cluster_write(
    table: &SwapFileTable,
    tokens: &AsyncIoTokens,
    store: &dyn PageStore,
    pages: Vec<(Ppn, Vec<u8>)>,
    max_cluster: u32,
) -> ClusterWriteOutcome {
    let mut remaining = pages;
    let mut written = Vec::new();
    let mut failed = Vec::new();
    let mut cluster = max_cluster.max(1);

    while !remaining.is_empty() {
        let want = cluster.min(remaining.len() as u32).max(1);
        match table.get_slots(want, false) {
            Ok((slot, count)) => {
                let take = count as usize;
                for (i, (ppn, data)) in remaining.drain(..take).enumerate() {
                    let this_slot = SlotRef::new(slot.file_index(), slot.slot_number() + i as u32);
                    let _token = tokens.acquire();
                    match store.write_slot(this_slot, &data) {
                        Ok(()) => written.push((ppn, this_slot)),
                        Err(_) => {
                            table.release_slots(this_slot, 1);
                            failed.push(ppn);
                        }
                    }
                }
                if count < want {
                    cluster = (want + 1) / 2;
                    log::debug!("partial slot allocation ({count}/{want}), cluster size decays to {cluster}");
                }
            }
            Err(_) => {
                if want <= 1 {
                    failed.extend(remaining.drain(..).map(|(p, _)| p));
                    break;
                }
                cluster = (want + 1) / 2;
            }
        }
    }

    ClusterWriteOutcome { written, failed }
}

/// §4.3 in-path, sync variant: read `slot` into `buf`, retrying transient
/// failures with the configured backoff. After `backoff.max_retries` the
/// caller (which knows the owning `VmId`) is expected to turn the final
/// error into `Error::fatal`.
pub fn read_slot_with_retry(store: &dyn PageStore, slot: SlotRef, buf: &mut [u8], backoff: &RetryBackoff) -> Result<()> {
    let mut attempt = 0;
    loop {
        match store.read_slot(slot, buf) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if attempt >= backoff.max_retries {
                    return Err(e);
                }
                std::thread::sleep(backoff.delay_for(attempt));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex as StdMutex;

    struct FlakyStore {
        fail_writes_for: StdMutex<std::collections::HashSet<u32>>,
        fail_reads_until_attempt: StdMutex<u32>,
    }

    impl PageStore for FlakyStore {
        fn write_slot(&self, slot: SlotRef, _data: &[u8]) -> Result<()> {
            if self.fail_writes_for.lock().unwrap().contains(&slot.slot_number()) {
                Err(Error::BadSlot)
            } else {
                Ok(())
            }
        }

        fn read_slot(&self, _slot: SlotRef, _buf: &mut [u8]) -> Result<()> {
            let mut left = self.fail_reads_until_attempt.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                Err(Error::WouldBlock)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn prepare_candidates_sorts_and_dedups() {
        let out = prepare_candidates(vec![Ppn(5), Ppn(1), Ppn(5), Ppn(3)]);
        assert_eq!(out, vec![Ppn(1), Ppn(3), Ppn(5)]);
    }

    #[test]
    fn cluster_write_decays_on_partial_allocation() {
        let table = SwapFileTable::new(8);
        table.register_file(0, 6, 6).unwrap();
        let tokens = AsyncIoTokens::new(4);
        let store = FlakyStore {
            fail_writes_for: StdMutex::new(std::collections::HashSet::new()),
            fail_reads_until_attempt: StdMutex::new(0),
        };
        let pages: Vec<_> = (0..6).map(|i| (Ppn(i), vec![0u8; 16])).collect();
        let outcome = cluster_write(&table, &tokens, &store, pages, 16);
        assert_eq!(outcome.written.len(), 6);
        assert!(outcome.failed.is_empty());
        assert_eq!(table.total_free_slots(), 0);
    }

    #[test]
    fn read_with_retry_succeeds_within_budget() {
        let store = FlakyStore {
            fail_writes_for: StdMutex::new(std::collections::HashSet::new()),
            fail_reads_until_attempt: StdMutex::new(2),
        };
        let backoff = RetryBackoff { base: std::time::Duration::from_millis(1), cap: std::time::Duration::from_millis(2), max_retries: 5 };
        let mut buf = [0u8; 16];
        assert!(read_slot_with_retry(&store, SlotRef::new(0, 0), &mut buf, &backoff).is_ok());
    }

    #[test]
    fn read_with_retry_escalates_after_budget_exhausted() {
        let store = FlakyStore {
            fail_writes_for: StdMutex::new(std::collections::HashSet::new()),
            fail_reads_until_attempt: StdMutex::new(100),
        };
        let backoff = RetryBackoff { base: std::time::Duration::from_millis(1), cap: std::time::Duration::from_millis(1), max_retries: 2 };
        let mut buf = [0u8; 16];
        assert!(read_slot_with_retry(&store, SlotRef::new(0, 0), &mut buf, &backoff).is_err());
    }
}
