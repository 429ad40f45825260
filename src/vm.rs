//! Per-VM state bundle. §5 tier 3, the "alloc lock", guards the PFrame
//! directory, the PShare-adjacent rings, the fast-path cache, and the
//! anon-list head together -- so they live behind one `Mutex` here,
//! reached through the teacher's `with`/`with_mut` closure-scoped access
//! pattern (`kernel/src/mem.rs`'s `MemoryManager::with`) rather than a
//! public field a caller could forget to lock.

use std::sync::Mutex;

use crate::cache::FastPathCache;
use crate::config::Config;
use crate::directory::PFrameDirectory;
use crate::ids::{Bpn, Mpn, Ppn, VmId};
use crate::ring::Ring;

/// §3.7: a deferred COW-refcount-drop entry, queued until the monitor
/// acknowledges it has stopped reading `mpn` at guest address `bpn`.
#[derive(Debug, Clone, Copy)]
pub struct P2mUpdate {
    pub bpn: Bpn,
    pub mpn: Mpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintUpdateKind {
    /// The hint at `ppn` was promoted into a content entry; this VM's
    /// private copy must transition to COW and adopt the shared MPN.
    Match,
    /// The hint at `ppn` no longer matches its recorded content; drop it.
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct HintUpdate {
    pub ppn: Ppn,
    pub kind: HintUpdateKind,
}

/// §4.3 step 6: the per-VM swap state machine driving the out-path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapState {
    Inactive,
    ListReq,
    Swapping,
    SwapAsync,
    SwapDone,
}

pub struct VmState {
    pub directory: PFrameDirectory,
    pub cache: FastPathCache,
    pub p2m_ring: Ring<P2mUpdate>,
    pub hint_ring: Ring<HintUpdate>,
    pub anon_head: Option<Mpn>,
    pub swap_state: SwapState,
    /// Set while a cartel-wide checkpoint save is active and this VM
    /// participates (§4.4). The current write-window is tracked alongside
    /// it so out-of-window faults can be answered with `busy`.
    pub checkpoint_window: Option<std::ops::Range<u32>>,
    /// Recycled scratch MPNs (§4.1 case 8, §4.4) a COW/SWAPPED read during
    /// checkpoint bounces through instead of touching the live page.
    /// Populated by `remap::begin_checkpoint_window`, drained back to the
    /// allocator by `remap::end_checkpoint`.
    pub checkpoint_scratch: Vec<Mpn>,
    checkpoint_scratch_cursor: usize,
}

impl VmState {
    /// Installs a freshly allocated scratch pool and resets the cursor.
    pub fn set_checkpoint_scratch(&mut self, scratch: Vec<Mpn>) {
        self.checkpoint_scratch = scratch;
        self.checkpoint_scratch_cursor = 0;
    }

    /// Cycle through the checkpoint scratch pool, reusing slots once every
    /// entry has been handed out once. `None` means the pool is empty or
    /// was never populated; the caller falls back to a fresh allocation.
    pub fn next_checkpoint_scratch(&mut self) -> Option<Mpn> {
        if self.checkpoint_scratch.is_empty() {
            return None;
        }
        let mpn = self.checkpoint_scratch[self.checkpoint_scratch_cursor % self.checkpoint_scratch.len()];
        self.checkpoint_scratch_cursor = self.checkpoint_scratch_cursor.wrapping_add(1);
        Some(mpn)
    }
}

pub struct Vm {
    pub id: VmId,
    pub num_phys_pages: u32,
    state: Mutex<VmState>,
}

impl Vm {
    pub fn new(id: VmId, num_phys_pages: u32, config: &Config) -> Self {
        Vm {
            id,
            num_phys_pages,
            state: Mutex::new(VmState {
                directory: PFrameDirectory::new(num_phys_pages),
                cache: FastPathCache::new(config.fast_path_cache_size),
                p2m_ring: Ring::new(config.ring_capacity),
                hint_ring: Ring::new(config.ring_capacity),
                anon_head: None,
                swap_state: SwapState::Inactive,
                checkpoint_window: None,
                checkpoint_scratch: Vec::new(),
                checkpoint_scratch_cursor: 0,
            }),
        }
    }

    /// Run `f` with the alloc lock held for reading. Mirrors the
    /// teacher's `MemoryManager::with`.
    pub fn with_state<R>(&self, f: impl FnOnce(&VmState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    /// Run `f` with the alloc lock held for writing.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut VmState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vm_state_is_inactive_and_empty() {
        let vm = Vm::new(VmId(1), 4096, &Config::default());
        vm.with_state(|s| {
            assert_eq!(s.swap_state, SwapState::Inactive);
            assert!(s.anon_head.is_none());
            assert!(s.p2m_ring.is_empty());
        });
    }
}
