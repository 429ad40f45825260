//! External collaborator traits (§1 Non-goals, §6 "events posted to
//! external collaborators"). The scheduler, the in-guest monitor, the
//! filesystem backing swap files, and NUMA topology discovery are all
//! explicitly out of scope for this crate; we model the seams they'd plug
//! into as traits, the way the teacher models its own hosted/baremetal
//! split through a handful of narrow traits rather than `cfg`-gating every
//! call site (see `kernel/src/arch` in the teacher workspace).

use crate::error::Result;
use crate::ids::{Mpn, Ppn, SlotRef, VmId};

/// The abstract page-slot store a swap file's contents live in (§1: "disk
/// format of swap files ... treated as an abstract page-slot store").
/// Implementations may be a real file, an in-memory `Vec` for tests, or a
/// network-backed store for remote migration.
pub trait PageStore: Send + Sync {
    /// Write a full `PAGE_SIZE` buffer to `slot`. Blocking; the swap
    /// engine calls this from a background worker to simulate the
    /// original's async I/O.
    fn write_slot(&self, slot: SlotRef, data: &[u8]) -> Result<()>;

    /// Read a full `PAGE_SIZE` buffer from `slot` into `buf`.
    fn read_slot(&self, slot: SlotRef, buf: &mut [u8]) -> Result<()>;
}

/// The in-guest monitor and the scheduler that decides *when* to swap
/// (§1 Non-goals: "thread scheduling policy"). The engine calls these to
/// request candidate pages and to post the deferred-action events from
/// §6; it never decides on its own what to swap or when memory is "low".
pub trait SchedulerHooks: Send + Sync {
    /// Ask the in-guest monitor for up to `max_batch` swap-out candidate
    /// PPNs (§4.3 out-path step 2).
    fn request_swap_candidates(&self, vm: VmId, max_batch: usize) -> Vec<Ppn>;

    /// A P2M-update entry was enqueued for `vm`; wake its monitor to drain
    /// the ring (§3.7, §4.2 step 3).
    fn post_p2m_update(&self, vm: VmId);

    /// A hint-update (MATCH or STALE) entry was enqueued for `vm` (§4.2).
    fn post_hint_update(&self, vm: VmId);

    /// A remap completed and the target VM should pick up the new MPN
    /// (§4.4).
    fn post_remap_pickup(&self, vm: VmId);

    /// The VM hit an unrecoverable invariant violation and has been torn
    /// down (§7: "fatal" escalation).
    fn on_vm_death(&self, vm: VmId, reason: &str);

    /// Block until the host's memory-low condition clears (§4.1 "memory
    /// pressure wait", §5 suspension point (a)). The resolver drops its
    /// per-VM lock before calling this and re-reads PFrame state after.
    fn wait_memory_low(&self);
}

/// Host NUMA topology discovery (§1 Non-goals), consulted by remap and by
/// the page allocator facade when asked for a node-constrained page.
pub trait NumaTopology: Send + Sync {
    fn node_of(&self, mpn: Mpn) -> u8;
    fn node_count(&self) -> u8;
}

/// Access to the actual bytes backing an MPN. This crate models page
/// *identity and state*, never page *content* -- real guest RAM lives in
/// the host's address space, outside anything this crate owns. COW
/// fingerprinting, collision verification, and copy-on-write's memcpy all
/// go through this seam.
pub trait PageContent: Send + Sync {
    fn read_page(&self, mpn: Mpn) -> Vec<u8>;
    fn write_page(&self, mpn: Mpn, data: &[u8]);
    /// A shared, read-only all-zero page (§4.1 "dummy zero page",
    /// returned during checkpoint and for zero-key COW reads).
    fn zero_page(&self) -> Mpn;
}
