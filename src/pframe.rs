//! The PFrame state machine (§3.2). The teacher packs `valid`/`state`/
//! `pinCount`/`sharedArea`/`index` into a 64-bit record accessed through
//! volatile loads in a `no_std` allocation table; we keep the same field
//! layout conceptually but as a plain safe `struct`, since this crate runs
//! hosted behind a `Mutex` rather than being touched from an MMU trap
//! handler.

use bitflags::bitflags;

use crate::ids::{Mpn, SlotRef};

bitflags! {
    /// Auxiliary flags orthogonal to `state`. Kept separate from `PFrameState`
    /// because, per §3.2, `sharedArea` can be set on frames in more than one
    /// state (it marks a frame whose backing MPN is owned by something
    /// outside this VM and must never be freed by the allocator).
    pub struct PFrameFlags: u8 {
        /// The frame's `index` points at an externally-owned MPN (e.g. a
        /// device BAR window) that `release_all_memory_for_process`-style
        /// teardown must never free.
        const SHARED_AREA = 0b0000_0001;
    }
}

/// `state` component of a PFrame (§3.2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PFrameState {
    /// No directory page has been allocated for this PPN yet, or the frame
    /// has never been faulted in. Equivalent to "not valid" in the spec's
    /// wording; we fold "no directory page" and "!valid regular" into one
    /// `Unmapped` marker and let `directory.rs` decide whether a directory
    /// page physically exists.
    Unmapped,
    Regular,
    Cow,
    CowHint,
    Swapped,
    SwapOut,
    SwapIn,
    Overhead,
}

/// One PFrame: the per-PPN record tracking what currently backs a guest
/// page.
#[derive(Debug, Clone)]
pub struct PFrame {
    state: PFrameState,
    flags: PFrameFlags,
    /// Saturating; `PIN_STICKY` marks a pin that can never be released by
    /// `unpin` underflowing below zero (§9 open question: the original
    /// treats overflow as a silent sticky pin; we keep that policy and
    /// record the choice in DESIGN.md rather than failing the call).
    pin_count: u16,
    /// An MPN when `state` is one of {Regular, Cow, CowHint, SwapOut,
    /// SwapIn, Overhead}; a packed `SlotRef` when `state == Swapped`.
    /// `None` when `state == Unmapped`.
    index: Option<Backing>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Backing {
    Mpn(Mpn),
    Slot(SlotRef),
}

const PIN_STICKY: u16 = u16::MAX;

impl Default for PFrame {
    fn default() -> Self {
        PFrame { state: PFrameState::Unmapped, flags: PFrameFlags::empty(), pin_count: 0, index: None }
    }
}

impl PFrame {
    pub fn state(&self) -> PFrameState { self.state }

    pub fn is_valid(&self) -> bool { self.state != PFrameState::Unmapped }

    pub fn pin_count(&self) -> u16 { self.pin_count }

    pub fn is_pinned(&self) -> bool { self.pin_count > 0 }

    pub fn shared_area(&self) -> bool { self.flags.contains(PFrameFlags::SHARED_AREA) }

    pub fn set_shared_area(&mut self, shared: bool) {
        self.flags.set(PFrameFlags::SHARED_AREA, shared);
    }

    /// MPN backing this frame, valid in every state except `Swapped` and
    /// `Unmapped` (§3.2 invariants).
    pub fn mpn(&self) -> Option<Mpn> {
        match self.index {
            Some(Backing::Mpn(m)) => Some(m),
            _ => None,
        }
    }

    /// SlotRef backing this frame, valid only in `Swapped` state.
    pub fn slot(&self) -> Option<SlotRef> {
        match self.index {
            Some(Backing::Slot(s)) => Some(s),
            _ => None,
        }
    }

    pub fn pin(&mut self) -> bool {
        if self.pin_count == PIN_STICKY {
            return true;
        }
        self.pin_count += 1;
        true
    }

    /// Saturating decrement; never panics, never goes below zero, and a
    /// `PIN_STICKY` pin is permanent (see the open question in §9).
    pub fn unpin(&mut self) {
        if self.pin_count != PIN_STICKY {
            self.pin_count = self.pin_count.saturating_sub(1);
        }
    }

    pub fn make_sticky(&mut self) { self.pin_count = PIN_STICKY; }

    fn set_mpn_state(&mut self, state: PFrameState, mpn: Mpn) {
        self.state = state;
        self.index = Some(Backing::Mpn(mpn));
    }

    /// Transition to `Regular`, valid, owning `mpn`. Used by the allocator
    /// path (§4.1 case 3) and by unshare/swap-in completion.
    pub fn set_regular(&mut self, mpn: Mpn) { self.set_mpn_state(PFrameState::Regular, mpn); }

    /// Transition to `Cow`, sharing `mpn` via the PShare index.
    pub fn set_cow(&mut self, mpn: Mpn) {
        assert!(!self.is_pinned(), "pinned pages may not transition to COW (§3.2)");
        self.set_mpn_state(PFrameState::Cow, mpn);
    }

    /// Transition to `CowHint`: privately owned, but advertised.
    pub fn set_cow_hint(&mut self, mpn: Mpn) {
        assert!(!self.is_pinned(), "pinned pages may not transition to COW_HINT (§3.2)");
        self.set_mpn_state(PFrameState::CowHint, mpn);
    }

    /// Transition to `SwapOut`: still in memory, write in flight.
    pub fn set_swap_out(&mut self, mpn: Mpn) {
        assert!(!self.is_pinned(), "pinned pages may not be selected for swap-out (§3.2)");
        self.set_mpn_state(PFrameState::SwapOut, mpn);
    }

    /// Transition to `SwapIn`: freshly allocated MPN, read in flight. Valid
    /// to call even while pinned (§3.2: "it *can* be in SWAP_IN from before
    /// it was pinned").
    pub fn set_swap_in(&mut self, mpn: Mpn) { self.set_mpn_state(PFrameState::SwapIn, mpn); }

    /// Transition to `Swapped`: MPN freed, `index` now names a slot.
    pub fn set_swapped(&mut self, slot: SlotRef) {
        self.state = PFrameState::Swapped;
        self.index = Some(Backing::Slot(slot));
    }

    pub fn set_overhead(&mut self, mpn: Mpn) { self.set_mpn_state(PFrameState::Overhead, mpn); }

    pub fn clear(&mut self) {
        self.state = PFrameState::Unmapped;
        self.index = None;
    }

    /// §8 invariant 1: every non-swapped valid frame names an MPN; a
    /// swapped frame names a slot. Used by debug/consistency checks and by
    /// property tests.
    pub fn check_invariant(&self) -> bool {
        match self.state {
            PFrameState::Unmapped => self.index.is_none(),
            PFrameState::Swapped => matches!(self.index, Some(Backing::Slot(_))),
            _ => matches!(self.index, Some(Backing::Mpn(_))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_is_unmapped() {
        let f = PFrame::default();
        assert_eq!(f.state(), PFrameState::Unmapped);
        assert!(!f.is_valid());
        assert!(f.check_invariant());
    }

    #[test]
    fn pin_saturates_and_stays_sticky() {
        let mut f = PFrame::default();
        f.set_regular(Mpn(1));
        for _ in 0..u16::MAX as u32 + 5 {
            f.pin();
        }
        assert_eq!(f.pin_count(), PIN_STICKY);
        f.unpin();
        assert_eq!(f.pin_count(), PIN_STICKY, "a sticky pin never releases");
    }

    #[test]
    fn unpin_never_underflows() {
        let mut f = PFrame::default();
        f.set_regular(Mpn(1));
        f.unpin();
        f.unpin();
        assert_eq!(f.pin_count(), 0);
    }

    #[test]
    fn swapped_frame_reports_slot_not_mpn() {
        let mut f = PFrame::default();
        f.set_swapped(SlotRef::new(0, 42));
        assert_eq!(f.state(), PFrameState::Swapped);
        assert!(f.mpn().is_none());
        assert_eq!(f.slot(), Some(SlotRef::new(0, 42)));
        assert!(f.check_invariant());
    }
}
