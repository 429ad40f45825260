//! Identifiers used throughout the guest-physical-memory manager.
//!
//! These mirror the teacher kernel's `PID`/`xous_kernel::MemoryFlags`-style
//! newtypes: small `Copy` wrappers around an integer, with constructors that
//! reject the reserved/invalid value rather than letting it leak in as a
//! bare `usize`.

use std::fmt;

/// Guest-physical page number: per-VM, `0..num_phys_pages`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ppn(pub u32);

impl Ppn {
    /// Index of this PPN's directory page (top-level PFrame directory index).
    pub fn directory_index(self) -> usize { (self.0 >> 10) as usize }

    /// Index of this PPN within its directory page (0..1024).
    pub fn page_offset(self) -> usize { (self.0 & 0x3ff) as usize }
}

impl fmt::Display for Ppn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ppn{:#x}", self.0) }
}

/// Host machine page number: global, system-wide.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mpn(pub u64);

impl fmt::Display for Mpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "mpn{:#x}", self.0) }
}

/// Opaque guest-bus page number. Main-memory BPNs map 1:1 to PPNs; other
/// BPN ranges (MMIO, framebuffer) are out of scope here and are rejected by
/// [`Bpn::to_ppn`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bpn(pub u64);

impl Bpn {
    /// Convert a main-memory BPN to its PPN. Returns `None` if this BPN
    /// falls outside the region the caller has designated as main memory.
    pub fn to_ppn(self, main_memory_pages: u32) -> Option<Ppn> {
        if self.0 < main_memory_pages as u64 { Some(Ppn(self.0 as u32)) } else { None }
    }

    pub fn from_ppn(ppn: Ppn) -> Bpn { Bpn(ppn.0 as u64) }
}

/// Reserved swap-file indices (§3.1). These never name a real, allocator-owned
/// swap file; `SwapFileTable` refuses to register a file at either index.
pub const SWAP_FILE_CHECKPOINT: u8 = 14;
pub const SWAP_FILE_REMOTE_MIGRATION: u8 = 15;

/// Compound {fileIndex:4, slotNumber:24} reference to a page-sized region in
/// a swap file, or one of the two reserved pseudo-files.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotRef {
    packed: u32,
}

impl SlotRef {
    const SLOT_BITS: u32 = 24;
    const SLOT_MASK: u32 = (1 << Self::SLOT_BITS) - 1;

    pub fn new(file_index: u8, slot_number: u32) -> Self {
        debug_assert!(file_index < 16, "file index must fit in 4 bits");
        debug_assert!(slot_number <= Self::SLOT_MASK, "slot number must fit in 24 bits");
        SlotRef { packed: ((file_index as u32) << Self::SLOT_BITS) | (slot_number & Self::SLOT_MASK) }
    }

    pub fn file_index(self) -> u8 { (self.packed >> Self::SLOT_BITS) as u8 }

    pub fn slot_number(self) -> u32 { self.packed & Self::SLOT_MASK }

    pub fn is_checkpoint_file(self) -> bool { self.file_index() == SWAP_FILE_CHECKPOINT }

    pub fn is_remote_migration(self) -> bool { self.file_index() == SWAP_FILE_REMOTE_MIGRATION }

    pub fn as_raw(self) -> u32 { self.packed }

    pub fn from_raw(packed: u32) -> Self { SlotRef { packed } }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot({}:{})", self.file_index(), self.slot_number())
    }
}

/// Identifies a VM ("cartel member" in the teacher's vocabulary, where a
/// single guest is one world/process). VM ids are never reused while any
/// of the structures in this crate still reference them; the caller is
/// responsible for retiring a `VmId` only after `Vm::teardown` completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub u32);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "vm{}", self.0) }
}

/// The 4 KiB unit every MPN/slot refers to.
pub const PAGE_SIZE: usize = 4096;
