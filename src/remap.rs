//! Remap and checkpoint scaffolding (§2 component H, §4.4). Remap moves a
//! page to a new MPN meeting a constraint (below the low-memory boundary,
//! or on a specific NUMA node); checkpoint save/resume toggle the
//! resolver's dummy-page/scratch-buffer/lazy-load behavior via the
//! `checkpoint_window` field the resolver already reads (`crate::vm`,
//! `crate::resolver`).

use crate::alloc::{AllocKind, PageAllocator};
use crate::config::Config;
use crate::cow::{self, ShareOutcome};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::hooks::{PageContent, SchedulerHooks};
use crate::ids::{Ppn, SlotRef, SWAP_FILE_CHECKPOINT};
use crate::pframe::PFrameState;
use crate::pshare::PShareIndex;
use crate::vm::Vm;

#[derive(Debug, Clone, Copy)]
pub enum RemapTarget {
    Low,
    Node(u8),
}

impl RemapTarget {
    fn alloc_kind(self) -> AllocKind {
        match self {
            RemapTarget::Low => AllocKind::Low,
            RemapTarget::Node(n) => AllocKind::Node(n),
        }
    }
}

enum Kind {
    Private,
    CowHint,
    Cow,
}

/// §4.4 "Remap". Refuses pinned, mid-swap, or checkpoint-active pages.
/// A COW page remapped to a NUMA node attempts to re-share on that node
/// by re-running the ordinary content-addressed share path against the
/// freshly copied page (§4.4: "attempt to re-share on the target NUMA
/// node by searching a node-tagged hash derived from the content key" --
/// `PShareIndex` has no node dimension of its own, so this is the closest
/// equivalent: a fresh `add_if_shared` naturally finds any existing entry
/// for the same content, node-tagged or not). A COW page remapped to
/// low memory has no node-local re-share story and is refused outright.
pub fn remap(
    vm: &Vm,
    pshare: &PShareIndex,
    alloc: &PageAllocator,
    content: &dyn PageContent,
    hooks: &dyn SchedulerHooks,
    ppn: Ppn,
    target: RemapTarget,
) -> Result<crate::ids::Mpn> {
    let (old_mpn, kind) = vm.with_state(|state| -> Result<_> {
        if state.cache.contains(ppn) {
            return Err(Error::Busy);
        }
        if state.checkpoint_window.is_some() {
            return Err(Error::Busy);
        }
        let frame = state.directory.get(ppn).ok_or(Error::BadParam)?;
        if frame.is_pinned() {
            return Err(Error::Busy);
        }
        let kind = match frame.state() {
            PFrameState::Regular | PFrameState::Overhead => Kind::Private,
            PFrameState::CowHint => Kind::CowHint,
            PFrameState::Cow => Kind::Cow,
            PFrameState::SwapOut | PFrameState::SwapIn | PFrameState::Swapped => return Err(Error::Busy),
            PFrameState::Unmapped => return Err(Error::BadParam),
        };
        Ok((frame.mpn().ok_or(Error::BadParam)?, kind))
    })?;

    if matches!(kind, Kind::Cow) && matches!(target, RemapTarget::Low) {
        return Err(Error::Shared);
    }

    let data = content.read_page(old_mpn);
    let new_mpn = alloc.alloc(target.alloc_kind())?;
    content.write_page(new_mpn, &data);

    let result = match kind {
        Kind::Private => {
            vm.with_state_mut(|state| state.directory.get_mut(ppn).unwrap().set_regular(new_mpn));
            alloc.free(old_mpn, false);
            Ok(new_mpn)
        }
        Kind::CowHint => {
            let key = Fingerprint::of_page(&data);
            pshare.remove_hint(old_mpn);
            pshare.add_hint(key, new_mpn, vm.id, ppn);
            vm.with_state_mut(|state| state.directory.get_mut(ppn).unwrap().set_cow_hint(new_mpn));
            alloc.free(old_mpn, false);
            Ok(new_mpn)
        }
        Kind::Cow => {
            let key = Fingerprint::of_page(&data);
            if pshare.remove(key, old_mpn) == 0 {
                alloc.free(old_mpn, false);
            }
            vm.with_state_mut(|state| state.directory.get_mut(ppn).unwrap().set_regular(new_mpn));
            match cow::share(vm, pshare, content, ppn)? {
                (ShareOutcome::Shared { mpn, .. }, _) => Ok(mpn),
                (ShareOutcome::InstalledAsHint, _) => Ok(new_mpn),
            }
        }
    };

    // §4.4 / §6: the target VM must be told to pick up the new MPN.
    if result.is_ok() {
        hooks.post_remap_pickup(vm.id);
    }
    result
}

/// Begin a cartel-wide checkpoint save window for this VM (§4.4). Faults
/// outside `window` from the guest now return `busy`; COW/SWAPPED reads
/// bounce through a scratch MPN drawn from a pool of `config.checkpoint_buffer_pages`
/// pages instead of touching the original.
pub fn begin_checkpoint_window(vm: &Vm, alloc: &PageAllocator, config: &Config, window: std::ops::Range<u32>) -> Result<()> {
    let mut scratch = Vec::with_capacity(config.checkpoint_buffer_pages);
    for _ in 0..config.checkpoint_buffer_pages {
        match alloc.alloc(AllocKind::Any) {
            Ok(mpn) => scratch.push(mpn),
            Err(e) => {
                for mpn in scratch {
                    alloc.free(mpn, false);
                }
                return Err(e);
            }
        }
    }
    vm.with_state_mut(|state| {
        state.set_checkpoint_scratch(scratch);
        state.checkpoint_window = Some(window);
    });
    Ok(())
}

pub fn advance_checkpoint_window(vm: &Vm, window: std::ops::Range<u32>) {
    vm.with_state_mut(|state| state.checkpoint_window = Some(window));
}

/// Ends the checkpoint window and drains the scratch pool back to the
/// allocator.
pub fn end_checkpoint(vm: &Vm, alloc: &PageAllocator) {
    let scratch = vm.with_state_mut(|state| {
        state.checkpoint_window = None;
        std::mem::take(&mut state.checkpoint_scratch)
    });
    for mpn in scratch {
        alloc.free(mpn, false);
    }
}

/// §4.4 "Checkpoint resume": mark `ppns` SWAPPED against the reserved
/// checkpoint-file slots starting at `start_slot`, to be lazily faulted
/// in by the ordinary resolver SWAPPED path on first access.
pub fn mark_lazy_resume(vm: &Vm, ppns: impl IntoIterator<Item = Ppn>, start_slot: u32) {
    vm.with_state_mut(|state| {
        for (i, ppn) in ppns.into_iter().enumerate() {
            let slot = SlotRef::new(SWAP_FILE_CHECKPOINT, start_slot + i as u32);
            state.directory.get_or_insert_mut(ppn).set_swapped(slot);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ids::{Mpn, VmId};
    use std::collections::HashMap;
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

    struct NoopHooks;
    impl SchedulerHooks for NoopHooks {
        fn request_swap_candidates(&self, _vm: VmId, _max_batch: usize) -> Vec<Ppn> { Vec::new() }
        fn post_p2m_update(&self, _vm: VmId) {}
        fn post_hint_update(&self, _vm: VmId) {}
        fn post_remap_pickup(&self, _vm: VmId) {}
        fn on_vm_death(&self, _vm: VmId, _reason: &str) {}
        fn wait_memory_low(&self) {}
    }

    #[test]
    fn remap_private_page_to_node_copies_and_frees_old() {
        let pshare = PShareIndex::new();
        let alloc = PageAllocator::new((0..8).map(Mpn), |m| if m.0 < 4 { 0 } else { 1 }, Mpn(0));
        let content = MemContent::new();
        content.set(Mpn(0), vec![1u8; 16]);
        let hooks = NoopHooks;
        let vm = Vm::new(VmId(1), 4096, &Config::default());
        vm.with_state_mut(|s| s.directory.get_or_insert_mut(Ppn(0)).set_regular(Mpn(0)));

        let new_mpn = remap(&vm, &pshare, &alloc, &content, &hooks, Ppn(0), RemapTarget::Node(1)).unwrap();
        assert!(new_mpn.0 >= 4, "new mpn should be on node 1");
        assert_eq!(content.read_page(new_mpn), vec![1u8; 16]);
    }

    #[test]
    fn remap_cow_page_to_low_mem_is_refused() {
        let pshare = PShareIndex::new();
        let alloc = PageAllocator::new((0..8).map(Mpn), |_| 0, Mpn(4));
        let content = MemContent::new();
        content.set(Mpn(5), vec![2u8; 16]);
        pshare.add(Fingerprint::of_page(&[2u8; 16]), Mpn(5), 1);
        let hooks = NoopHooks;
        let vm = Vm::new(VmId(1), 4096, &Config::default());
        vm.with_state_mut(|s| s.directory.get_or_insert_mut(Ppn(0)).set_cow(Mpn(5)));

        assert_eq!(remap(&vm, &pshare, &alloc, &content, &hooks, Ppn(0), RemapTarget::Low), Err(Error::Shared));
    }

    #[test]
    fn checkpoint_resume_marks_swapped_for_lazy_load() {
        let vm = Vm::new(VmId(1), 4096, &Config::default());
        mark_lazy_resume(&vm, [Ppn(1), Ppn(2)], 100);
        vm.with_state(|s| {
            let f1 = s.directory.get(Ppn(1)).unwrap();
            assert_eq!(f1.state(), PFrameState::Swapped);
            assert_eq!(f1.slot().unwrap(), SlotRef::new(SWAP_FILE_CHECKPOINT, 100));
        });
    }
}
