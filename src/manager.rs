//! `Gpmm`: the top-level handle tying every component together (§6
//! "External interfaces"). One instance per host; one `Vm` per cartel
//! member. Lock ordering across a single call always respects §5's four
//! tiers -- swap file, then global free-slot, then per-VM alloc, then
//! async-IO tokens -- since each component already enforces its own tier
//! internally and `Gpmm`'s methods never hold two VMs' alloc locks at
//! once (the one exception, `lookup_and_share`'s hint notification
//! delivery, always finishes with the *calling* VM's lock before taking
//! the hint owner's).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::alloc::{AllocKind, PageAllocator};
use crate::anon::AnonSideTable;
use crate::config::Config;
use crate::cow::{self, ShareOutcome};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::hooks::{PageContent, PageStore, SchedulerHooks};
use crate::ids::{Bpn, Mpn, Ppn, VmId};
use crate::pframe::PFrameState;
use crate::pshare::PShareIndex;
use crate::remap::{self, RemapTarget};
use crate::resolver::{self, ResolveDeps, Source};
use crate::swap::{engine, SwapFileTable};
use crate::vm::{HintUpdate, SwapState, Vm};

/// Outcome of one [`Gpmm::swap_out_round`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapOutSummary {
    pub attempted: usize,
    pub written: usize,
    pub failed: usize,
}

pub struct Gpmm {
    vms: Mutex<HashMap<VmId, Arc<Vm>>>,
    pshare: PShareIndex,
    alloc: PageAllocator,
    swap: SwapFileTable,
    tokens: engine::AsyncIoTokens,
    anon: AnonSideTable,
    config: Config,
    store: Box<dyn PageStore>,
    content: Box<dyn PageContent>,
    hooks: Box<dyn SchedulerHooks>,
}

impl Gpmm {
    pub fn new(
        config: Config,
        free_pages: impl IntoIterator<Item = Mpn>,
        node_of: impl Fn(Mpn) -> u8,
        low_mem_boundary: Mpn,
        store: Box<dyn PageStore>,
        content: Box<dyn PageContent>,
        hooks: Box<dyn SchedulerHooks>,
    ) -> Self {
        let swap = SwapFileTable::new(config.max_swap_files);
        let tokens = engine::AsyncIoTokens::new(config.max_async_io_tokens);
        let alloc = PageAllocator::new(free_pages, node_of, low_mem_boundary);
        Gpmm { vms: Mutex::new(HashMap::new()), pshare: PShareIndex::new(), alloc, swap, tokens, anon: AnonSideTable::new(), config, store, content, hooks }
    }

    pub fn register_vm(&self, id: VmId, num_phys_pages: u32) -> Arc<Vm> {
        let vm = Arc::new(Vm::new(id, num_phys_pages, &self.config));
        self.vms.lock().unwrap().insert(id, vm.clone());
        vm
    }

    pub fn teardown_vm(&self, id: VmId) { self.vms.lock().unwrap().remove(&id); }

    fn get_vm(&self, id: VmId) -> Result<Arc<Vm>> {
        self.vms.lock().unwrap().get(&id).cloned().ok_or(Error::BadParam)
    }

    pub fn register_swap_file(&self, index: u8, total_slots: u32) -> Result<()> {
        self.swap.register_file(index, total_slots, self.config.slots_per_block)
    }

    fn deps(&self) -> ResolveDeps<'_> {
        ResolveDeps {
            pshare: &self.pshare,
            alloc: &self.alloc,
            swap: &self.swap,
            tokens: &self.tokens,
            store: self.store.as_ref(),
            content: self.content.as_ref(),
            hooks: self.hooks.as_ref(),
            config: &self.config,
        }
    }

    /// §6 `resolve`.
    pub fn resolve(&self, vm: VmId, ppn: Ppn, writeable: bool, blocking: bool, source: Source) -> Result<Mpn> {
        let vm = self.get_vm(vm)?;
        resolver::resolve(&vm, &self.deps(), ppn, writeable, blocking, source)
    }

    /// §6 `touch_pages`: fault in every PPN named by `ppns` (e.g. ahead of
    /// a migration transfer).
    pub fn touch_pages(&self, vm: VmId, ppns: impl IntoIterator<Item = Ppn>) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        for ppn in ppns {
            resolver::resolve(&vm_ref, &self.deps(), ppn, false, true, Source::Kernel)?;
        }
        Ok(())
    }

    /// §6 `phys_to_mach_range`: resolve a run of PPNs and report the
    /// longest contiguous MPN range found, caching it for next time.
    pub fn phys_to_mach_range(&self, vm: VmId, first_ppn: Ppn, len: u32, writeable: bool) -> Result<(Mpn, u32)> {
        let vm_ref = self.get_vm(vm)?;
        if let Some(hit) = vm_ref.with_state_mut(|s| s.cache.lookup(first_ppn)) {
            if !writeable || !hit.read_only {
                return Ok((hit.mpn_base, hit.last_ppn.0 - hit.first_ppn.0 + 1));
            }
        }
        let base = resolver::resolve(&vm_ref, &self.deps(), first_ppn, writeable, true, Source::Kernel)?;
        let mut count = 1u32;
        for i in 1..len {
            let ppn = Ppn(first_ppn.0 + i);
            let mpn = resolver::resolve(&vm_ref, &self.deps(), ppn, writeable, true, Source::Kernel)?;
            if mpn.0 != base.0 + i as u64 {
                break;
            }
            count += 1;
        }
        vm_ref.with_state_mut(|s| {
            s.cache.insert(crate::cache::CacheEntry {
                first_ppn,
                last_ppn: Ppn(first_ppn.0 + count - 1),
                mpn_base: base,
                read_only: !writeable,
                hot_copy_count: 0,
            })
        });
        Ok((base, count))
    }

    /// §6 `can_balloon`.
    pub fn can_balloon(&self, vm: VmId, ppn: Ppn) -> bool {
        self.get_vm(vm)
            .ok()
            .map(|vm| {
                vm.with_state(|s| {
                    s.directory.get(ppn).is_some_and(|f| {
                        f.is_valid()
                            && !f.is_pinned()
                            && matches!(f.state(), PFrameState::Regular | PFrameState::Cow | PFrameState::CowHint | PFrameState::Overhead)
                    })
                })
            })
            .unwrap_or(false)
    }

    /// §6 `balloon_release`. §8 invariant 5.
    pub fn balloon_release(&self, vm: VmId, ppn: Ppn) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        vm_ref.with_state_mut(|state| {
            let frame = state.directory.get_mut(ppn).ok_or(Error::BadParam)?;
            if frame.is_pinned() {
                return Err(Error::Busy);
            }
            match frame.state() {
                PFrameState::SwapOut | PFrameState::SwapIn | PFrameState::Swapped => return Err(Error::Busy),
                PFrameState::Unmapped => {}
                PFrameState::CowHint => {
                    let mpn = frame.mpn().ok_or(Error::BadParam)?;
                    self.pshare.remove_hint(mpn);
                    self.alloc.free(mpn, false);
                    frame.clear();
                }
                PFrameState::Cow => {
                    let mpn = frame.mpn().ok_or(Error::BadParam)?;
                    let key = Fingerprint::of_page(&self.content.read_page(mpn));
                    if self.pshare.remove(key, mpn) == 0 {
                        self.alloc.free(mpn, false);
                    }
                    frame.clear();
                }
                PFrameState::Regular | PFrameState::Overhead => {
                    let mpn = frame.mpn().ok_or(Error::BadParam)?;
                    if !frame.shared_area() {
                        self.alloc.free(mpn, false);
                    }
                    frame.clear();
                }
            }
            state.cache.invalidate(ppn);
            Ok(())
        })
    }

    /// §6 `pin` / `unpin`.
    pub fn pin(&self, vm: VmId, ppns: impl IntoIterator<Item = Ppn>) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        vm_ref.with_state_mut(|state| {
            for ppn in ppns {
                state.directory.get_or_insert_mut(ppn).pin();
            }
        });
        Ok(())
    }

    pub fn unpin(&self, vm: VmId, ppns: impl IntoIterator<Item = Ppn>) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        vm_ref.with_state_mut(|state| {
            for ppn in ppns {
                if let Some(frame) = state.directory.get_mut(ppn) {
                    frame.unpin();
                }
            }
        });
        Ok(())
    }

    /// §6 `lookup_and_share`: monitor-only batch share. Delivers any hint
    /// MATCH/STALE notification to the owning VM's hint ring and posts
    /// the corresponding hook.
    pub fn lookup_and_share(&self, vm: VmId, ppns: &[Ppn]) -> Result<Vec<Result<(Mpn, bool)>>> {
        let vm_ref = self.get_vm(vm)?;
        let mut out = Vec::with_capacity(ppns.len());
        for &ppn in ppns {
            let result = cow::share(&vm_ref, &self.pshare, self.content.as_ref(), ppn);
            match result {
                Ok((outcome, pending)) => {
                    if let Some(note) = pending {
                        if let Ok(target_vm) = self.get_vm(note.target) {
                            target_vm.with_state_mut(|s| {
                                s.hint_ring.push(HintUpdate { ppn: note.ppn, kind: note.kind });
                            });
                            self.hooks.post_hint_update(note.target);
                        }
                    }
                    match outcome {
                        ShareOutcome::Shared { mpn, .. } => out.push(Ok((mpn, false))),
                        ShareOutcome::InstalledAsHint => out.push(Ok((Mpn(0), true))),
                    }
                }
                Err(e) => out.push(Err(e)),
            }
        }
        Ok(out)
    }

    /// §6 `break_cow`: monitor-driven unshare of the page backing `bpn`.
    pub fn break_cow(&self, vm: VmId, bpn: Bpn) -> Result<Mpn> {
        let vm_ref = self.get_vm(vm)?;
        let ppn = bpn.to_ppn(vm_ref.num_phys_pages).ok_or(Error::BadParam)?;
        cow::unshare(&vm_ref, &self.pshare, &self.alloc, self.content.as_ref(), self.hooks.as_ref(), ppn, true)
    }

    /// §6 `ack_p2m` / `poll_p2m`.
    pub fn ack_p2m(&self, vm: VmId) -> Result<Option<Bpn>> {
        let vm_ref = self.get_vm(vm)?;
        Ok(cow::ack_p2m(&vm_ref, &self.pshare, &self.alloc))
    }

    pub fn poll_p2m(&self, vm: VmId) -> Result<Vec<crate::vm::P2mUpdate>> {
        let vm_ref = self.get_vm(vm)?;
        Ok(cow::poll_p2m(&vm_ref))
    }

    /// §6 `remap`.
    pub fn remap(&self, vm: VmId, ppn: Ppn, target: RemapTarget) -> Result<Mpn> {
        let vm_ref = self.get_vm(vm)?;
        remap::remap(&vm_ref, &self.pshare, &self.alloc, self.content.as_ref(), self.hooks.as_ref(), ppn, target)
    }

    /// §6 `alloc_anon` / `free_anon`.
    pub fn alloc_anon(&self, vm: VmId, low: bool, tag: u32) -> Result<Mpn> {
        let vm_ref = self.get_vm(vm)?;
        let kind = if low { AllocKind::Low } else { AllocKind::Anon };
        let mpn = self.alloc.alloc(kind)?;
        vm_ref.with_state_mut(|state| {
            state.anon_head = Some(self.anon.insert(state.anon_head, mpn, vm, tag));
        });
        Ok(mpn)
    }

    pub fn free_anon(&self, vm: VmId, mpn: Mpn) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        vm_ref.with_state_mut(|state| -> Result<()> {
            state.anon_head = self.anon.remove(state.anon_head, mpn, vm)?;
            Ok(())
        })?;
        self.alloc.free(mpn, true);
        Ok(())
    }

    /// §6 `checkpoint_io`: on the save path, open or advance the write
    /// window (`resume_slots = None`); on the resume path, mark `ppns`
    /// SWAPPED against the checkpoint file for lazy loading.
    pub fn checkpoint_io(
        &self,
        vm: VmId,
        ppns: impl IntoIterator<Item = Ppn>,
        window: std::ops::Range<u32>,
        resume_start_slot: Option<u32>,
    ) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        match resume_start_slot {
            Some(start) => remap::mark_lazy_resume(&vm_ref, ppns, start),
            None => remap::advance_checkpoint_window(&vm_ref, window),
        }
        Ok(())
    }

    pub fn begin_checkpoint(&self, vm: VmId, window: std::ops::Range<u32>) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        remap::begin_checkpoint_window(&vm_ref, &self.alloc, &self.config, window)
    }

    pub fn end_checkpoint(&self, vm: VmId) -> Result<()> {
        let vm_ref = self.get_vm(vm)?;
        remap::end_checkpoint(&vm_ref, &self.alloc);
        Ok(())
    }

    /// §4.3 "Out-path": one round of the scheduler-driven swap-out state
    /// machine, advancing `swap_state` through
    /// `Inactive -> ListReq -> Swapping -> {SwapAsync, SwapDone}`. Step 6's
    /// "transition back to LIST_REQ and post another monitor action" is the
    /// caller's responsibility -- the scheduler decides whether another
    /// round is warranted and calls this again.
    pub fn swap_out_round(&self, vm: VmId) -> Result<SwapOutSummary> {
        let vm_ref = self.get_vm(vm)?;
        vm_ref.with_state_mut(|s| s.swap_state = SwapState::ListReq);
        let batch = self.hooks.request_swap_candidates(vm, self.config.max_swap_batch);
        let candidates = engine::prepare_candidates(batch);
        vm_ref.with_state_mut(|s| s.swap_state = SwapState::Swapping);

        // §4.3 step 3: filter to legal candidates, breaking COW sharing and
        // dropping hints along the way (with monitor credentials, so any
        // COW refcount drop happens immediately rather than through the
        // P2M ring).
        let mut selected = Vec::new();
        for ppn in candidates {
            let classify = vm_ref.with_state(|state| {
                state.directory.get(ppn).map(|f| (f.state(), engine::can_swap(f, &state.cache, ppn)))
            });
            let state = match classify {
                Some((state, true)) => state,
                _ => continue,
            };
            match state {
                PFrameState::Cow => {
                    if cow::unshare(&vm_ref, &self.pshare, &self.alloc, self.content.as_ref(), self.hooks.as_ref(), ppn, true).is_ok() {
                        selected.push(ppn);
                    }
                }
                PFrameState::CowHint => {
                    vm_ref.with_state_mut(|s| {
                        if let Some(mpn) = s.directory.get_mut(ppn).and_then(|f| f.mpn()) {
                            self.pshare.remove_hint(mpn);
                        }
                    });
                    selected.push(ppn);
                }
                PFrameState::Regular => selected.push(ppn),
                _ => {}
            }
        }

        // Mark SWAP_OUT, strip from the fast-path cache, and snapshot
        // content before dropping the lock for the actual writes.
        let mut pages = Vec::new();
        for &ppn in &selected {
            let mpn = vm_ref.with_state_mut(|state| -> Option<Mpn> {
                let frame = state.directory.get_mut(ppn)?;
                let mpn = frame.mpn()?;
                frame.set_swap_out(mpn);
                state.cache.invalidate(ppn);
                Some(mpn)
            });
            if let Some(mpn) = mpn {
                pages.push((ppn, self.content.read_page(mpn)));
            }
        }

        let outcome = engine::cluster_write(&self.swap, &self.tokens, self.store.as_ref(), pages, self.config.max_swap_cluster);

        let mut written = 0usize;
        for (ppn, slot) in &outcome.written {
            vm_ref.with_state_mut(|state| {
                if let Some(frame) = state.directory.get_mut(*ppn) {
                    // §4.3 step 5: if the frame raced back to non-SWAP_OUT
                    // (refaulted, unpinned and rewritten), the slot just
                    // written is stale and must not be adopted.
                    if frame.state() == PFrameState::SwapOut {
                        if let Some(mpn) = frame.mpn() {
                            self.alloc.free(mpn, false);
                        }
                        frame.set_swapped(*slot);
                        written += 1;
                    } else {
                        self.swap.release_slots(*slot, 1);
                    }
                }
            });
        }
        for ppn in &outcome.failed {
            vm_ref.with_state_mut(|state| {
                if let Some(frame) = state.directory.get_mut(*ppn) {
                    if frame.state() == PFrameState::SwapOut {
                        if let Some(mpn) = frame.mpn() {
                            frame.set_regular(mpn);
                        }
                    }
                }
            });
        }

        vm_ref.with_state_mut(|s| {
            s.swap_state = if outcome.failed.is_empty() { SwapState::SwapDone } else { SwapState::SwapAsync };
        });

        Ok(SwapOutSummary { attempted: selected.len(), written, failed: outcome.failed.len() })
    }

    pub fn pshare_stats(&self) -> crate::pshare::PShareStats { self.pshare.stats() }

    pub fn alloc_stats(&self) -> crate::alloc::AllocStats { self.alloc.stats() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PAGE_SIZE;
    use std::collections::HashMap as StdHashMap;

    struct MemHost {
        pages: Mutex<StdHashMap<Mpn, Vec<u8>>>,
        slots: Mutex<StdHashMap<(u8, u32), Vec<u8>>>,
    }
    impl MemHost {
        fn new() -> Self { MemHost { pages: Mutex::new(StdHashMap::new()), slots: Mutex::new(StdHashMap::new()) } }
    }
    impl PageContent for MemHost {
        fn read_page(&self, mpn: Mpn) -> Vec<u8> { self.pages.lock().unwrap().get(&mpn).cloned().unwrap_or_else(|| vec![0u8; PAGE_SIZE]) }
        fn write_page(&self, mpn: Mpn, data: &[u8]) { self.pages.lock().unwrap().insert(mpn, data.to_vec()); }
        fn zero_page(&self) -> Mpn { Mpn(u64::MAX) }
    }
    impl PageStore for MemHost {
        fn write_slot(&self, slot: crate::ids::SlotRef, data: &[u8]) -> Result<()> {
            self.slots.lock().unwrap().insert((slot.file_index(), slot.slot_number()), data.to_vec());
            Ok(())
        }
        fn read_slot(&self, slot: crate::ids::SlotRef, buf: &mut [u8]) -> Result<()> {
            let slots = self.slots.lock().unwrap();
            let data = slots.get(&(slot.file_index(), slot.slot_number())).ok_or(Error::BadSlot)?;
            buf.copy_from_slice(data);
            Ok(())
        }
    }
    struct NoopHooks;
    impl SchedulerHooks for NoopHooks {
        fn request_swap_candidates(&self, _vm: VmId, _max_batch: usize) -> Vec<Ppn> { Vec::new() }
        fn post_p2m_update(&self, _vm: VmId) {}
        fn post_hint_update(&self, _vm: VmId) {}
        fn post_remap_pickup(&self, _vm: VmId) {}
        fn on_vm_death(&self, _vm: VmId, _reason: &str) {}
        fn wait_memory_low(&self) {}
    }

    fn new_gpmm() -> Gpmm {
        Gpmm::new(
            Config::default(),
            (0..64).map(Mpn),
            |_| 0,
            Mpn(0),
            Box::new(MemHost::new()),
            Box::new(MemHost::new()),
            Box::new(NoopHooks),
        )
    }

    #[test]
    fn balloon_release_of_regular_page_frees_mpn_and_invalidates() {
        let gpmm = new_gpmm();
        gpmm.register_vm(VmId(1), 4096);
        let mpn = gpmm.resolve(VmId(1), Ppn(0), false, true, Source::Kernel).unwrap();
        assert!(gpmm.alloc_stats().used_pages >= 1);
        gpmm.balloon_release(VmId(1), Ppn(0)).unwrap();
        let stats_before = gpmm.alloc_stats().used_pages;
        let mpn2 = gpmm.resolve(VmId(1), Ppn(1), false, true, Source::Kernel).unwrap();
        assert_eq!(mpn2, mpn, "freed mpn should be recycled");
        assert_eq!(gpmm.alloc_stats().used_pages, stats_before + 1);
    }

    #[test]
    fn pin_then_balloon_release_is_refused() {
        let gpmm = new_gpmm();
        gpmm.register_vm(VmId(1), 4096);
        gpmm.resolve(VmId(1), Ppn(0), false, true, Source::Kernel).unwrap();
        gpmm.pin(VmId(1), [Ppn(0)]).unwrap();
        assert_eq!(gpmm.balloon_release(VmId(1), Ppn(0)), Err(Error::Busy));
        gpmm.unpin(VmId(1), [Ppn(0)]).unwrap();
        assert!(gpmm.balloon_release(VmId(1), Ppn(0)).is_ok());
    }

    #[test]
    fn anon_alloc_and_free_round_trip() {
        let gpmm = new_gpmm();
        gpmm.register_vm(VmId(1), 4096);
        let mpn = gpmm.alloc_anon(VmId(1), false, 7).unwrap();
        assert_eq!(gpmm.alloc_stats().anon_pages, 1);
        gpmm.free_anon(VmId(1), mpn).unwrap();
        assert_eq!(gpmm.alloc_stats().anon_pages, 0);
    }
}
