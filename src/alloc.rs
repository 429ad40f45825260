//! The page allocator facade (§2 component A, ~5% of core): typed MPN
//! allocation with accounting. This crate doesn't own real host RAM, so
//! the pool itself is injected by the embedder at `PageAllocator::new`
//! (normally from `NumaTopology`/host memory-map discovery, both treated
//! as external collaborators per §1); everything below is what the
//! original's `Alloc_PageX`/`Alloc_PageXForVM` family actually adds on top
//! of a raw free list: low-mem segregation, per-node pools, and
//! outstanding-page accounting.
//!
//! Grounded in the teacher's `MemoryManager` (`kernel/src/mem.rs`): a
//! single struct behind a lock owning the entire free-page bookkeeping,
//! exposing typed `alloc_*` entry points rather than one untyped "give me
//! a page" call.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::ids::Mpn;

/// The kind of allocation requested, mirroring the original's
/// `AllocPageList` arguments: an unconstrained page, a page below the
/// low-memory boundary (for legacy DMA), or a page on a specific NUMA
/// node. Anon pages are tracked the same way as `Any` but counted
/// separately since they never back guest-visible memory (§3.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Any,
    Low,
    Node(u8),
    Anon,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllocStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub free_low_pages: u64,
    pub used_pages: u64,
    pub anon_pages: u64,
}

struct Inner {
    free_any: Vec<Mpn>,
    free_low: Vec<Mpn>,
    free_by_node: HashMap<u8, Vec<Mpn>>,
    node_of: HashMap<Mpn, u8>,
    is_low: HashMap<Mpn, bool>,
    stats: AllocStats,
}

/// The global free-page pool. One instance is shared across every VM
/// (§5: allocation is a leaf resource beneath the per-VM alloc lock), so
/// it carries its own lock rather than relying on a caller-held one.
pub struct PageAllocator {
    inner: Mutex<Inner>,
}

impl PageAllocator {
    /// Build the allocator from a fully enumerated free-page set. `node_of`
    /// tags each MPN with its NUMA node (host topology, supplied by the
    /// embedder's `NumaTopology` collaborator); `low_mem_boundary` is the
    /// first MPN considered "not low" -- every MPN below it also lands in
    /// the low pool.
    pub fn new(
        free_pages: impl IntoIterator<Item = Mpn>,
        node_of: impl Fn(Mpn) -> u8,
        low_mem_boundary: Mpn,
    ) -> Self {
        let mut free_any = Vec::new();
        let mut free_low = Vec::new();
        let mut free_by_node: HashMap<u8, Vec<Mpn>> = HashMap::new();
        let mut node_map = HashMap::new();
        let mut is_low = HashMap::new();
        let mut total = 0u64;
        for mpn in free_pages {
            total += 1;
            let node = node_of(mpn);
            node_map.insert(mpn, node);
            let low = mpn.0 < low_mem_boundary.0;
            is_low.insert(mpn, low);
            if low {
                free_low.push(mpn);
            }
            free_any.push(mpn);
            free_by_node.entry(node).or_default().push(mpn);
        }
        let free_pages_count = free_any.len() as u64;
        let free_low_count = free_low.len() as u64;
        PageAllocator {
            inner: Mutex::new(Inner {
                free_any,
                free_low,
                free_by_node,
                node_of: node_map,
                is_low,
                stats: AllocStats {
                    total_pages: total,
                    free_pages: free_pages_count,
                    free_low_pages: free_low_count,
                    used_pages: 0,
                    anon_pages: 0,
                },
            }),
        }
    }

    pub fn stats(&self) -> AllocStats { self.inner.lock().unwrap().stats }

    /// Allocate one MPN of the requested kind. `Error::NoMem` means the
    /// specific pool requested is exhausted -- callers do not silently
    /// fall back to a looser kind, since `Low`/`Node` are guarantees the
    /// caller is relying on (§4.1 case 3, §4.4 remap-to-node).
    pub fn alloc(&self, kind: AllocKind) -> Result<Mpn> {
        let mut inner = self.inner.lock().unwrap();
        let mpn = match kind {
            AllocKind::Any | AllocKind::Anon => inner.free_any.pop().ok_or(Error::NoMem)?,
            AllocKind::Low => {
                let mpn = inner.free_low.pop().ok_or(Error::NoMem)?;
                let pos = inner.free_any.iter().position(|m| *m == mpn);
                if let Some(pos) = pos {
                    inner.free_any.swap_remove(pos);
                }
                mpn
            }
            AllocKind::Node(node) => {
                let pool = inner.free_by_node.get_mut(&node).ok_or(Error::NoMem)?;
                let mpn = pool.pop().ok_or(Error::NoMem)?;
                if let Some(pos) = inner.free_any.iter().position(|m| *m == mpn) {
                    inner.free_any.swap_remove(pos);
                }
                if inner.is_low.get(&mpn).copied().unwrap_or(false) {
                    if let Some(pos) = inner.free_low.iter().position(|m| *m == mpn) {
                        inner.free_low.swap_remove(pos);
                    }
                }
                mpn
            }
        };
        inner.stats.free_pages = inner.free_any.len() as u64;
        inner.stats.free_low_pages = inner.free_low.len() as u64;
        inner.stats.used_pages += 1;
        if matches!(kind, AllocKind::Anon) {
            inner.stats.anon_pages += 1;
        }
        Ok(mpn)
    }

    /// Return `mpn` to every pool it was originally a member of. Called
    /// once an MPN has no remaining owner (balloon release, COW refcount
    /// hitting zero, swap-in/out finishing, anon-list removal).
    pub fn free(&self, mpn: Mpn, was_anon: bool) {
        let mut inner = self.inner.lock().unwrap();
        let node = inner.node_of.get(&mpn).copied();
        let low = inner.is_low.get(&mpn).copied().unwrap_or(false);
        inner.free_any.push(mpn);
        if low {
            inner.free_low.push(mpn);
        }
        if let Some(node) = node {
            inner.free_by_node.entry(node).or_default().push(mpn);
        }
        inner.stats.free_pages = inner.free_any.len() as u64;
        inner.stats.free_low_pages = inner.free_low.len() as u64;
        inner.stats.used_pages = inner.stats.used_pages.saturating_sub(1);
        if was_anon {
            inner.stats.anon_pages = inner.stats.anon_pages.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(n: u64) -> Vec<Mpn> { (0..n).map(Mpn).collect() }

    #[test]
    fn low_mem_pool_is_exhausted_independently_of_any_pool() {
        let alloc = PageAllocator::new(pages(10), |_| 0, Mpn(4));
        for _ in 0..4 {
            assert!(alloc.alloc(AllocKind::Low).is_ok());
        }
        assert_eq!(alloc.alloc(AllocKind::Low), Err(Error::NoMem));
        assert!(alloc.alloc(AllocKind::Any).is_ok(), "non-low pages remain for Any");
    }

    #[test]
    fn node_pool_respects_topology() {
        let alloc = PageAllocator::new(pages(6), |m| if m.0 < 3 { 0 } else { 1 }, Mpn(0));
        assert!(alloc.alloc(AllocKind::Node(2)).is_err());
        for _ in 0..3 {
            assert!(alloc.alloc(AllocKind::Node(0)).is_ok());
        }
        assert_eq!(alloc.alloc(AllocKind::Node(0)), Err(Error::NoMem));
    }

    #[test]
    fn free_restores_accounting() {
        let alloc = PageAllocator::new(pages(2), |_| 0, Mpn(0));
        let mpn = alloc.alloc(AllocKind::Any).unwrap();
        assert_eq!(alloc.stats().used_pages, 1);
        alloc.free(mpn, false);
        assert_eq!(alloc.stats().used_pages, 0);
        assert_eq!(alloc.stats().free_pages, 2);
    }
}
