//! The COW engine (§2 component F, §4.2): share, unshare/copy, hint
//! handling, the P2M update ring, and the debug consistency check. Kept
//! as free functions over `&Vm`/`&PShareIndex`/`&dyn PageContent` rather
//! than a stateful object -- there is no COW-engine-specific state beyond
//! what `Vm` and `PShareIndex` already hold.

use crate::alloc::{AllocKind, PageAllocator};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::hooks::{PageContent, SchedulerHooks};
use crate::ids::{Bpn, Mpn, Ppn, VmId};
use crate::pframe::PFrameState;
use crate::pshare::{AddIfSharedOutcome, PShareIndex};
use crate::vm::{HintUpdateKind, P2mUpdate, Vm};

#[derive(Debug, Clone, Copy)]
pub enum ShareOutcome {
    /// Now COW at `mpn` with the content entry's refcount after this
    /// share. `freed_private_mpn` is `Some` when the caller's own MPN
    /// turned out to differ from the canonical shared one and must be
    /// returned to the allocator.
    Shared { mpn: Mpn, refcount: u32, freed_private_mpn: Option<Mpn> },
    /// No content entry or hint existed (or a stale hint was evicted);
    /// this PPN is now advertised as a hint itself.
    InstalledAsHint,
}

/// A hint MATCH/STALE notification that must be delivered to `target`'s
/// own hint ring and then posted via `SchedulerHooks::post_hint_update`.
/// Kept as data rather than performed inline since `cow::share` only has
/// a handle to the *calling* VM, not a registry of every VM.
#[derive(Debug, Clone, Copy)]
pub struct PendingHintNotification {
    pub target: VmId,
    pub ppn: Ppn,
    pub kind: HintUpdateKind,
}

/// §4.2 "Share". Refuses a pinned page, a page present in the fast-path
/// cache, a page mid-swap, or a page already COW.
pub fn share(
    vm: &Vm,
    pshare: &PShareIndex,
    content: &dyn PageContent,
    ppn: Ppn,
) -> Result<(ShareOutcome, Option<PendingHintNotification>)> {
    vm.with_state_mut(|state| {
        if state.cache.contains(ppn) {
            return Err(Error::Busy);
        }
        let frame = state.directory.get_mut(ppn).ok_or(Error::BadParam)?;
        if frame.is_pinned() {
            return Err(Error::Busy);
        }
        let mpn = match frame.state() {
            PFrameState::Regular => frame.mpn().ok_or(Error::BadParam)?,
            PFrameState::CowHint => {
                let m = frame.mpn().ok_or(Error::BadParam)?;
                pshare.remove_hint(m);
                m
            }
            PFrameState::Cow => return Err(Error::Shared),
            _ => return Err(Error::Busy),
        };

        let data = content.read_page(mpn);
        let key = Fingerprint::of_page(&data);
        let outcome = pshare.add_if_shared(key, mpn, |candidate| content.read_page(candidate) == data);

        match outcome {
            AddIfSharedOutcome::Matched { shared_mpn, refcount } => {
                frame.set_cow(shared_mpn);
                let freed_private_mpn = if shared_mpn != mpn { Some(mpn) } else { None };
                Ok((ShareOutcome::Shared { mpn: shared_mpn, refcount, freed_private_mpn }, None))
            }
            AddIfSharedOutcome::PromotedFromHint { hint_owner, hint_owner_ppn } => {
                pshare.add(key, mpn, 2);
                frame.set_cow(mpn);
                let pending = PendingHintNotification { target: hint_owner, ppn: hint_owner_ppn, kind: HintUpdateKind::Match };
                Ok((ShareOutcome::Shared { mpn, refcount: 2, freed_private_mpn: None }, Some(pending)))
            }
            AddIfSharedOutcome::StaleHintEvicted { stale_owner, stale_owner_ppn } => {
                log::debug!("stale hint at {ppn} (was owned by {stale_owner}) evicted on share");
                pshare.add_hint(key, mpn, vm.id, ppn);
                frame.set_cow_hint(mpn);
                let pending = PendingHintNotification { target: stale_owner, ppn: stale_owner_ppn, kind: HintUpdateKind::Stale };
                Ok((ShareOutcome::InstalledAsHint, Some(pending)))
            }
            AddIfSharedOutcome::NoMatch => {
                pshare.add_hint(key, mpn, vm.id, ppn);
                frame.set_cow_hint(mpn);
                Ok((ShareOutcome::InstalledAsHint, None))
            }
        }
    })
}

/// §4.2 "Unshare/copy". On success, returns the MPN the PPN now resolves
/// to (REGULAR). When `from_monitor` is `false`, the old MPN's refcount
/// is *not* dropped yet -- an entry is queued on the VM's own P2M ring and
/// the P2M-update monitor action is posted (§4.2 step 3, §6 "events posted
/// to external collaborators"), to be drained later by [`ack_p2m`] once the
/// in-guest monitor confirms it has stopped using the old mapping.
pub fn unshare(
    vm: &Vm,
    pshare: &PShareIndex,
    alloc: &PageAllocator,
    content: &dyn PageContent,
    hooks: &dyn SchedulerHooks,
    ppn: Ppn,
    from_monitor: bool,
) -> Result<Mpn> {
    let (new_mpn, old_mpn, key, queued) = vm.with_state_mut(|state| {
        let frame = state.directory.get_mut(ppn).ok_or(Error::BadParam)?;
        if frame.state() != PFrameState::Cow {
            return Err(Error::NotShared);
        }
        let old_mpn = frame.mpn().ok_or(Error::BadParam)?;
        let data = content.read_page(old_mpn);
        let key = Fingerprint::of_page(&data);

        if pshare.remove_if_unshared(key, old_mpn) {
            frame.set_regular(old_mpn);
            return Ok((old_mpn, None, key, false));
        }

        let new_mpn = alloc.alloc(AllocKind::Any)?;
        content.write_page(new_mpn, &data);
        frame.set_regular(new_mpn);

        if from_monitor {
            Ok((new_mpn, Some(old_mpn), key, false))
        } else {
            state.p2m_ring.push(P2mUpdate { bpn: Bpn::from_ppn(ppn), mpn: old_mpn });
            Ok((new_mpn, None, key, true))
        }
    })?;

    if queued {
        hooks.post_p2m_update(vm.id);
    }

    if let Some(old_mpn) = old_mpn {
        if pshare.remove(key, old_mpn) == 0 {
            alloc.free(old_mpn, false);
        }
    }
    Ok(new_mpn)
}

/// Drain one entry from the VM's P2M ring, permanently dropping the
/// refcount on the old MPN it names (§4.2 step 3, §6 `ack_p2m`). Returns
/// the acknowledged BPN so the caller can report it upstream.
pub fn ack_p2m(vm: &Vm, pshare: &PShareIndex, alloc: &PageAllocator) -> Option<Bpn> {
    let entry = vm.with_state_mut(|state| state.p2m_ring.pop())?;
    if let Some((key, _)) = pshare.lookup_by_mpn(entry.mpn) {
        if pshare.remove(key, entry.mpn) == 0 {
            alloc.free(entry.mpn, false);
        }
    }
    Some(entry.bpn)
}

/// Non-destructive peek at the pending P2M ring (§6 `poll_p2m`).
pub fn poll_p2m(vm: &Vm) -> Vec<P2mUpdate> { vm.with_state(|state| state.p2m_ring.iter().copied().collect()) }

/// §4.2 "Consistency check (debug)": every COW PFrame must resolve to a
/// PShare entry whose recorded key matches the page's actual content.
pub fn consistency_check(vm: &Vm, pshare: &PShareIndex, content: &dyn PageContent) -> Result<()> {
    vm.with_state(|state| {
        for (ppn, frame) in state.directory.iter() {
            if frame.state() != PFrameState::Cow {
                continue;
            }
            let mpn = frame.mpn().ok_or_else(|| Error::fatal(vm.id, format!("COW frame at {ppn} has no MPN")))?;
            let (key, _refcount) = pshare
                .lookup_by_mpn(mpn)
                .ok_or_else(|| Error::fatal(vm.id, format!("COW frame at {ppn} has no PShare entry")))?;
            let actual = Fingerprint::of_page(&content.read_page(mpn));
            if actual != key {
                return Err(Error::fatal(vm.id, format!("COW frame at {ppn} fingerprint mismatch")));
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ids::VmId;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MemContent {
        pages: Mutex<HashMap<Mpn, Vec<u8>>>,
    }

    impl MemContent {
        fn new() -> Self { MemContent { pages: Mutex::new(HashMap::new()) } }
        fn set(&self, mpn: Mpn, data: Vec<u8>) { self.pages.lock().unwrap().insert(mpn, data); }
    }

    impl PageContent for MemContent {
        fn read_page(&self, mpn: Mpn) -> Vec<u8> { self.pages.lock().unwrap().get(&mpn).cloned().unwrap_or_else(|| vec![0u8; 16]) }
        fn write_page(&self, mpn: Mpn, data: &[u8]) { self.pages.lock().unwrap().insert(mpn, data.to_vec()); }
        fn zero_page(&self) -> Mpn { Mpn(0) }
    }

    #[derive(Default)]
    struct CountingHooks {
        p2m_updates_posted: AtomicUsize,
    }

    impl SchedulerHooks for CountingHooks {
        fn request_swap_candidates(&self, _vm: VmId, _max_batch: usize) -> Vec<Ppn> { Vec::new() }
        fn post_p2m_update(&self, _vm: VmId) { self.p2m_updates_posted.fetch_add(1, Ordering::SeqCst); }
        fn post_hint_update(&self, _vm: VmId) {}
        fn post_remap_pickup(&self, _vm: VmId) {}
        fn on_vm_death(&self, _vm: VmId, _reason: &str) {}
        fn wait_memory_low(&self) {}
    }

    fn vm_with_regular_page(id: u32, ppn: u32, mpn: u64) -> Vm {
        let vm = Vm::new(VmId(id), 4096, &Config::default());
        vm.with_state_mut(|s| s.directory.get_or_insert_mut(Ppn(ppn)).set_regular(Mpn(mpn)));
        vm
    }

    #[test]
    fn two_vms_sharing_zero_page_end_with_refcount_two() {
        let pshare = PShareIndex::new();
        let content = MemContent::new();
        content.set(Mpn(1), vec![0u8; 16]);
        content.set(Mpn(2), vec![0u8; 16]);

        let vm1 = vm_with_regular_page(1, 0, 1);
        let vm2 = vm_with_regular_page(2, 0, 2);

        let (outcome1, note1) = share(&vm1, &pshare, &content, Ppn(0)).unwrap();
        assert!(matches!(outcome1, ShareOutcome::InstalledAsHint));
        assert!(note1.is_none());

        let (outcome2, note2) = share(&vm2, &pshare, &content, Ppn(0)).unwrap();
        match outcome2 {
            ShareOutcome::Shared { mpn, refcount, .. } => {
                assert_eq!(mpn, Mpn(2));
                assert_eq!(refcount, 2);
            }
            _ => panic!("expected second share to promote the hint"),
        }
        let note2 = note2.unwrap();
        assert_eq!(note2.target, VmId(1));
        assert_eq!(note2.ppn, Ppn(0));
        assert_eq!(note2.kind, HintUpdateKind::Match);

        vm1.with_state_mut(|s| s.directory.get_mut(Ppn(0)).unwrap().set_cow(Mpn(1)));
        assert_eq!(pshare.lookup_by_mpn(Mpn(2)), Some((Fingerprint::of_page(&[0u8; 16]), 2)));
    }

    #[test]
    fn unshare_from_outside_monitor_defers_refcount_drop() {
        let pshare = PShareIndex::new();
        let alloc = PageAllocator::new((0..8).map(Mpn), |_| 0, Mpn(0));
        let content = MemContent::new();
        content.set(Mpn(1), vec![0xABu8; 16]);

        let key = Fingerprint::of_page(&[0xABu8; 16]);
        pshare.add(key, Mpn(1), 2);

        let vm = Vm::new(VmId(1), 4096, &Config::default());
        vm.with_state_mut(|s| s.directory.get_or_insert_mut(Ppn(0)).set_cow(Mpn(1)));

        let hooks = CountingHooks::default();
        let new_mpn = unshare(&vm, &pshare, &alloc, &content, &hooks, Ppn(0), false).unwrap();
        assert_ne!(new_mpn, Mpn(1));
        assert_eq!(pshare.lookup_by_mpn(Mpn(1)).unwrap().1, 2, "refcount not yet dropped");
        assert!(!poll_p2m(&vm).is_empty());
        assert_eq!(hooks.p2m_updates_posted.load(Ordering::SeqCst), 1, "P2M-update action must be posted (§4.2 step 3)");

        let bpn = ack_p2m(&vm, &pshare, &alloc).unwrap();
        assert_eq!(bpn, Bpn::from_ppn(Ppn(0)));
        assert_eq!(pshare.lookup_by_mpn(Mpn(1)).unwrap().1, 1, "refcount dropped after ack");
    }

    #[test]
    fn unshare_of_non_cow_frame_is_not_shared_error() {
        let pshare = PShareIndex::new();
        let alloc = PageAllocator::new((0..4).map(Mpn), |_| 0, Mpn(0));
        let content = MemContent::new();
        let hooks = CountingHooks::default();
        let vm = vm_with_regular_page(1, 0, 5);
        assert_eq!(unshare(&vm, &pshare, &alloc, &content, &hooks, Ppn(0), true), Err(Error::NotShared));
    }

    #[test]
    fn unshare_from_monitor_does_not_post_p2m_update() {
        let pshare = PShareIndex::new();
        let alloc = PageAllocator::new((0..8).map(Mpn), |_| 0, Mpn(0));
        let content = MemContent::new();
        content.set(Mpn(1), vec![0xCDu8; 16]);
        let key = Fingerprint::of_page(&[0xCDu8; 16]);
        pshare.add(key, Mpn(1), 2);

        let vm = Vm::new(VmId(1), 4096, &Config::default());
        vm.with_state_mut(|s| s.directory.get_or_insert_mut(Ppn(0)).set_cow(Mpn(1)));

        let hooks = CountingHooks::default();
        unshare(&vm, &pshare, &alloc, &content, &hooks, Ppn(0), true).unwrap();
        assert_eq!(hooks.p2m_updates_posted.load(Ordering::SeqCst), 0, "monitor-initiated unshare drops the refcount immediately, no ring entry to post");
        assert!(poll_p2m(&vm).is_empty());
    }
}
