//! Error kinds (§7). Kept as a single flat, matchable enum the way the
//! teacher kernel's `xous_kernel::Error` is: callers `match` on variants
//! rather than inspecting chained causes. `thiserror` only saves us the
//! boilerplate `Display`/`std::error::Error` impls.

use crate::ids::VmId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Page allocation failed: no free MPNs and the memory-low signal did
    /// not free any up within policy.
    #[error("no memory available")]
    NoMem,

    /// Swap is full: no file had a free slot of any size.
    #[error("swap is full")]
    NotEnoughSlots,

    /// A non-blocking caller hit a condition that would have required
    /// sleeping.
    #[error("operation would block")]
    WouldBlock,

    /// Transient state denies the operation (checkpoint window, pinned
    /// page, in-flight swap I/O, page present in the fast-path cache).
    #[error("resource busy")]
    Busy,

    /// `remap` refused because the page is COW; caller may retry via the
    /// re-share path instead.
    #[error("page is shared")]
    Shared,

    /// `unshare` was called on a page that is not (or no longer) COW; this
    /// is an expected race and the caller should re-read PFrame state and
    /// retry.
    #[error("page is not shared")]
    NotShared,

    /// Invalid PPN/BPN/VM id.
    #[error("invalid parameter")]
    BadParam,

    /// An on-disk slot or file index was referenced but does not exist.
    #[error("invalid slot reference")]
    BadSlot,

    /// A state-machine invariant was violated. The owning VM is beyond
    /// recovery and must be torn down; the host continues.
    #[error("fatal invariant violation in {vm}: {reason}")]
    Fatal { vm: VmId, reason: String },
}

impl Error {
    pub fn fatal(vm: VmId, reason: impl Into<String>) -> Error { Error::Fatal { vm, reason: reason.into() } }
}
