//! Guest-physical-memory manager for a type-1 hypervisor: PPN->MPN
//! resolution, copy-on-write page sharing, swap, remap, and checkpoint
//! support for a cartel of VMs sharing one host's machine memory.
//!
//! `manager::Gpmm` is the entry point; everything else is the machinery
//! it wires together. See the module docs on each for the corresponding
//! design-doc section.

pub mod alloc;
pub mod anon;
pub mod cache;
pub mod config;
pub mod cow;
pub mod directory;
pub mod error;
pub mod fingerprint;
pub mod hooks;
pub mod ids;
pub mod manager;
pub mod pframe;
pub mod pshare;
pub mod remap;
pub mod resolver;
pub mod ring;
pub mod swap;
pub mod vm;

pub use config::Config;
pub use error::{Error, Result};
pub use ids::{Bpn, Mpn, Ppn, SlotRef, VmId, PAGE_SIZE, SWAP_FILE_CHECKPOINT, SWAP_FILE_REMOTE_MIGRATION};
pub use manager::Gpmm;
pub use resolver::Source;
