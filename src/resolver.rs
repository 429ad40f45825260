//! The page-fault resolver (§2 component E, §4.1): the single public
//! PPN->MPN contract everything else exists to serve. `resolve` holds the
//! per-VM alloc lock for the duration of each state inspection, but never
//! across a blocking I/O or memory-low wait -- every suspension point
//! drops the lock, blocks, and restarts the whole case analysis from
//! scratch, since the PFrame may have changed underneath it (§5
//! "lock-drop-and-retry").

use crate::alloc::{AllocKind, PageAllocator};
use crate::config::Config;
use crate::cow;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::hooks::{PageContent, PageStore, SchedulerHooks};
use crate::ids::{Mpn, Ppn, SlotRef, PAGE_SIZE};
use crate::pframe::PFrameState;
use crate::pshare::PShareIndex;
use crate::swap::{engine, SwapFileTable};
use crate::vm::Vm;

/// Who is calling `resolve` (§4.1 "Tie-breaks"): affects whether the
/// checkpoint-window check applies and whether breaking COW defers the
/// refcount drop via the P2M ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Monitor,
    GuestVmx,
    Kernel,
}

pub struct ResolveDeps<'a> {
    pub pshare: &'a PShareIndex,
    pub alloc: &'a PageAllocator,
    pub swap: &'a SwapFileTable,
    pub tokens: &'a engine::AsyncIoTokens,
    pub store: &'a dyn PageStore,
    pub content: &'a dyn PageContent,
    pub hooks: &'a dyn SchedulerHooks,
    pub config: &'a Config,
}

enum Step {
    ReturnMpn(Mpn),
    NeedAlloc,
    NeedUnshare,
    NeedCheckpointCowRead(Mpn),
    NeedSwapIn { slot: SlotRef, checkpoint_active: bool },
    WaitSwapIn,
}

/// `resolve(vm, ppn, writeable, blocking, source) -> MPN | error` (§4.1).
pub fn resolve(vm: &Vm, deps: &ResolveDeps, ppn: Ppn, writeable: bool, blocking: bool, source: Source) -> Result<Mpn> {
    loop {
        let step = vm.with_state_mut(|state| -> Result<Step> {
            let in_checkpoint = state.checkpoint_window.is_some();

            if !state.directory.has_directory_page(ppn) && in_checkpoint {
                return Ok(Step::ReturnMpn(deps.content.zero_page()));
            }
            if let Some(window) = state.checkpoint_window.clone() {
                // §4.1 tie-break: only the guest itself is bound to the
                // write window; the monitor is the checkpoint writer and
                // must be able to read in-window pages regardless.
                if matches!(source, Source::GuestVmx) && !window.contains(&ppn.0) {
                    return Err(Error::Busy);
                }
            }

            let frame = state.directory.get_or_insert_mut(ppn);
            match frame.state() {
                PFrameState::Unmapped => Ok(Step::NeedAlloc),
                PFrameState::Regular | PFrameState::Overhead => Ok(Step::ReturnMpn(frame.mpn().ok_or(Error::BadParam)?)),
                PFrameState::Cow if writeable => Ok(Step::NeedUnshare),
                PFrameState::Cow | PFrameState::CowHint => {
                    let mpn = frame.mpn().ok_or(Error::BadParam)?;
                    if in_checkpoint {
                        Ok(Step::NeedCheckpointCowRead(mpn))
                    } else {
                        Ok(Step::ReturnMpn(mpn))
                    }
                }
                // §4.1 case 6: the write is still in flight, but the MPN is
                // still good; reclassify now, the write callback will no-op
                // against a non-SWAP_OUT frame.
                PFrameState::SwapOut => {
                    let mpn = frame.mpn().ok_or(Error::BadParam)?;
                    frame.set_regular(mpn);
                    Ok(Step::ReturnMpn(mpn))
                }
                PFrameState::SwapIn => Ok(Step::WaitSwapIn),
                PFrameState::Swapped => {
                    let slot = frame.slot().ok_or(Error::BadParam)?;
                    Ok(Step::NeedSwapIn { slot, checkpoint_active: in_checkpoint })
                }
            }
        })?;

        match step {
            Step::ReturnMpn(mpn) => return Ok(mpn),

            Step::NeedUnshare => {
                return cow::unshare(vm, deps.pshare, deps.alloc, deps.content, deps.hooks, ppn, matches!(source, Source::Monitor));
            }

            // §4.1 case 8 / §4.4: a COW read during checkpoint must not
            // disturb the live shared MPN -- a zero-key page returns the
            // dummy page, everything else bounces through a scratch MPN.
            Step::NeedCheckpointCowRead(mpn) => {
                let data = deps.content.read_page(mpn);
                if Fingerprint::of_page(&data).is_zero_key(PAGE_SIZE) {
                    return Ok(deps.content.zero_page());
                }
                let scratch = match vm.with_state_mut(|state| state.next_checkpoint_scratch()) {
                    Some(s) => s,
                    None => deps.alloc.alloc(AllocKind::Any)?,
                };
                deps.content.write_page(scratch, &data);
                return Ok(scratch);
            }

            Step::NeedAlloc => match deps.alloc.alloc(AllocKind::Any) {
                Ok(mpn) => {
                    deps.content.write_page(mpn, &vec![0u8; PAGE_SIZE]);
                    vm.with_state_mut(|state| state.directory.get_or_insert_mut(ppn).set_regular(mpn));
                    return Ok(mpn);
                }
                Err(Error::NoMem) => {
                    if !blocking {
                        return Err(Error::WouldBlock);
                    }
                    log::debug!("{ppn} waiting on memory-low signal before allocating");
                    deps.hooks.wait_memory_low();
                    continue;
                }
                Err(e) => return Err(e),
            },

            Step::WaitSwapIn => {
                if !blocking {
                    return Err(Error::WouldBlock);
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }

            Step::NeedSwapIn { slot, checkpoint_active } => {
                // §4.4 checkpoint save: bounce through a scratch MPN and
                // leave the original SWAPPED frame untouched.
                if checkpoint_active {
                    let (scratch, owned) = match vm.with_state_mut(|state| state.next_checkpoint_scratch()) {
                        Some(s) => (s, false),
                        None => (deps.alloc.alloc(AllocKind::Any)?, true),
                    };
                    let mut buf = vec![0u8; PAGE_SIZE];
                    if let Err(e) = engine::read_slot_with_retry(deps.store, slot, &mut buf, &deps.config.swap_retry_backoff) {
                        if owned {
                            deps.alloc.free(scratch, false);
                        }
                        return Err(e);
                    }
                    deps.content.write_page(scratch, &buf);
                    return Ok(scratch);
                }

                let new_mpn = deps.alloc.alloc(AllocKind::Any)?;
                vm.with_state_mut(|state| state.directory.get_or_insert_mut(ppn).set_swap_in(new_mpn));

                if !blocking {
                    // Async in-path: the caller owns a fault token and will
                    // be woken by a background completion; modeling that
                    // callback pump is a `crate::vm`/manager concern, not
                    // the resolver's. Surface `would-block` for now.
                    return Err(Error::WouldBlock);
                }

                let mut buf = vec![0u8; PAGE_SIZE];
                let _token = deps.tokens.acquire();
                match engine::read_slot_with_retry(deps.store, slot, &mut buf, &deps.config.swap_retry_backoff) {
                    Ok(()) => {
                        deps.content.write_page(new_mpn, &buf);
                        deps.swap.release_slots(slot, 1);
                        vm.with_state_mut(|state| state.directory.get_or_insert_mut(ppn).set_regular(new_mpn));
                        return Ok(new_mpn);
                    }
                    Err(_) => {
                        deps.alloc.free(new_mpn, false);
                        log::error!("{ppn} swap-in exhausted retries, tearing down {}", vm.id);
                        deps.hooks.on_vm_death(vm.id, "swap-in exhausted retries");
                        return Err(Error::fatal(vm.id, "swap-in exhausted retries"));
                    }
                }
            }
        }
    }
}
