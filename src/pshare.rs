//! The PShare index (§3.4, §4.2): a cartel-global, content-addressed
//! dedup table. The teacher's kernel has no direct analogue (xous does not
//! implement transparent page sharing), so this module is grounded instead
//! on the original C implementation's `PShare_*` family
//! (`examples/original_source/main/alloc.c`, calls like `PShare_AddIfShared`,
//! `PShare_LookupHint`, `PShare_RemoveIfUnshared`) while following the
//! teacher's style of wrapping shared global state behind a lock-holding
//! facade (compare `crate::swap::Swap::with_mut`).
//!
//! §5 describes this index as "global and internally synchronised by its
//! own primitive (spec treats it as atomic)" -- we realize that with one
//! `Mutex` guarding both maps, since they must be updated together (e.g.
//! promoting a hint into a content entry removes from one map and inserts
//! into the other atomically).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::fingerprint::Fingerprint;
use crate::ids::{Mpn, Ppn, VmId};

#[derive(Debug, Clone, Copy)]
struct ContentEntry {
    mpn: Mpn,
    refcount: u32,
}

#[derive(Debug, Clone, Copy)]
struct HintEntry {
    key: Fingerprint,
    owner: VmId,
    owner_ppn: Ppn,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PShareStats {
    pub pages_shared: u64,
    pub pages_unshared: u64,
    pub hash_collisions_detected: u64,
    /// Bytes saved is an estimate: (refcount - 1) * page_size summed over
    /// every live content entry, recomputed on demand by `Index::stats`.
    pub bytes_saved: u64,
}

/// Outcome of `add_if_shared`, mirroring the three-way branch in §4.2
/// "Share": an existing content entry matched, a hint was promoted, or
/// neither and the caller should install itself as a new hint.
pub enum AddIfSharedOutcome {
    /// A content entry already existed and matched byte-for-byte; returns
    /// the shared MPN and new refcount. If the content entry's MPN differs
    /// from the caller's own MPN, the caller must drop its private MPN and
    /// point at the returned one.
    Matched { shared_mpn: Mpn, refcount: u32 },
    /// No content entry existed, but a valid hint did; the hint's owner
    /// should be notified (`HintMatch`) and the caller becomes the new
    /// content entry, with its own MPN as the canonical shared MPN.
    PromotedFromHint { hint_owner: VmId, hint_owner_ppn: Ppn },
    /// A hint existed at this MPN but its content no longer matches its
    /// recorded key (the owner has since modified the page); notify the
    /// owner (`HintStale`) and fall through to installing a fresh hint.
    StaleHintEvicted { stale_owner: VmId, stale_owner_ppn: Ppn },
    /// Nothing existed at all; caller should install itself as a hint.
    NoMatch,
}

struct Inner {
    content: HashMap<Fingerprint, ContentEntry>,
    hints: HashMap<Mpn, HintEntry>,
    stats: PShareStats,
}

pub struct PShareIndex {
    inner: Mutex<Inner>,
}

impl Default for PShareIndex {
    fn default() -> Self { Self::new() }
}

impl PShareIndex {
    pub fn new() -> Self {
        PShareIndex {
            inner: Mutex::new(Inner { content: HashMap::new(), hints: HashMap::new(), stats: PShareStats::default() }),
        }
    }

    pub fn stats(&self) -> PShareStats { self.inner.lock().unwrap().stats }

    /// `PShare_LookupByMPN`: does this MPN currently back a content entry?
    /// Returns the entry's key and refcount.
    pub fn lookup_by_mpn(&self, mpn: Mpn) -> Option<(Fingerprint, u32)> {
        let inner = self.inner.lock().unwrap();
        inner.content.iter().find(|(_, e)| e.mpn == mpn).map(|(k, e)| (*k, e.refcount))
    }

    /// `PShare_LookupHint`.
    pub fn lookup_hint(&self, mpn: Mpn) -> Option<(Fingerprint, VmId, Ppn)> {
        let inner = self.inner.lock().unwrap();
        inner.hints.get(&mpn).map(|h| (h.key, h.owner, h.owner_ppn))
    }

    /// `PShare_AddHint`: advertise `mpn` (owned by `owner`/`owner_ppn`) as a
    /// single-reference sharing candidate under `key`. §3.2 COW_HINT
    /// invariant requires the entry point back at exactly this (VM, PPN).
    pub fn add_hint(&self, key: Fingerprint, mpn: Mpn, owner: VmId, owner_ppn: Ppn) {
        let mut inner = self.inner.lock().unwrap();
        inner.hints.insert(mpn, HintEntry { key, owner, owner_ppn });
    }

    /// `PShare_RemoveHint`.
    pub fn remove_hint(&self, mpn: Mpn) -> bool {
        self.inner.lock().unwrap().hints.remove(&mpn).is_some()
    }

    /// `PShare_Add`: install `mpn` as the canonical shared entry for `key`
    /// with an initial refcount of `initial_refcount` (2 when promoting a
    /// hint match: the new sharer plus the original hint owner).
    pub fn add(&self, key: Fingerprint, mpn: Mpn, initial_refcount: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.content.insert(key, ContentEntry { mpn, refcount: initial_refcount });
        inner.stats.pages_shared += 1;
    }

    /// `PShare_AddIfShared`: the core of §4.2 "Share". `verify` is called
    /// with the candidate shared MPN only when a content entry already
    /// exists for `key`, to defeat hash collisions by a byte-for-byte
    /// compare; if it returns `false` a collision is recorded and the call
    /// behaves as if no entry existed (matching the original's
    /// `PShare_ReportCollision` path).
    pub fn add_if_shared(
        &self,
        key: Fingerprint,
        candidate_mpn: Mpn,
        verify: impl FnOnce(Mpn) -> bool,
    ) -> AddIfSharedOutcome {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.content.get(&key).copied() {
            if entry.mpn == candidate_mpn || verify(entry.mpn) {
                let entry = inner.content.get_mut(&key).unwrap();
                entry.refcount += 1;
                let refcount = entry.refcount;
                let shared_mpn = entry.mpn;
                return AddIfSharedOutcome::Matched { shared_mpn, refcount };
            }
            inner.stats.hash_collisions_detected += 1;
            log::warn!("fingerprint collision at {key}, falling through to hint path");
            // fall through: treat as if no content entry existed
        }
        if let Some(hint) = inner.hints.get(&candidate_mpn).copied() {
            if hint.key == key {
                inner.hints.remove(&candidate_mpn);
                return AddIfSharedOutcome::PromotedFromHint { hint_owner: hint.owner, hint_owner_ppn: hint.owner_ppn };
            } else {
                inner.hints.remove(&candidate_mpn);
                return AddIfSharedOutcome::StaleHintEvicted { stale_owner: hint.owner, stale_owner_ppn: hint.owner_ppn };
            }
        }
        AddIfSharedOutcome::NoMatch
    }

    /// `PShare_RemoveIfUnshared`: atomic remove when `refcount == 1`.
    /// Returns `true` on success (no copy needed by the caller).
    pub fn remove_if_unshared(&self, key: Fingerprint, mpn: Mpn) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.content.get(&key) {
            if entry.mpn == mpn && entry.refcount == 1 {
                inner.content.remove(&key);
                inner.stats.pages_unshared += 1;
                return true;
            }
        }
        false
    }

    /// `PShare_Remove` / `AllocPShareRemove`: decrement refcount, dropping
    /// the content entry entirely once it hits zero. Returns the refcount
    /// remaining (0 if the entry was removed).
    pub fn remove(&self, key: Fingerprint, mpn: Mpn) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let remaining = if let Some(entry) = inner.content.get_mut(&key) {
            if entry.mpn != mpn {
                return entry.refcount;
            }
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount
        } else {
            return 0;
        };
        if remaining == 0 {
            inner.content.remove(&key);
            inner.stats.pages_unshared += 1;
        }
        remaining
    }

    #[cfg(test)]
    pub fn content_len(&self) -> usize { self.inner.lock().unwrap().content.len() }

    #[cfg(test)]
    pub fn hint_len(&self) -> usize { self.inner.lock().unwrap().hints.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Fingerprint { Fingerprint::of_page(&vec![b; 64]) }

    #[test]
    fn two_vms_sharing_zero_page_end_with_refcount_two() {
        let idx = PShareIndex::new();
        let k = key(0);
        match idx.add_if_shared(k, Mpn(1), |_| true) {
            AddIfSharedOutcome::NoMatch => idx.add_hint(k, Mpn(1), VmId(1), Ppn(0)),
            _ => panic!("expected first share to find nothing"),
        }
        match idx.add_if_shared(k, Mpn(2), |_| true) {
            AddIfSharedOutcome::PromotedFromHint { hint_owner, hint_owner_ppn } => {
                assert_eq!(hint_owner, VmId(1));
                assert_eq!(hint_owner_ppn, Ppn(0));
                idx.add(k, Mpn(2), 2);
            }
            _ => panic!("expected second share to promote the hint"),
        }
        assert_eq!(idx.lookup_by_mpn(Mpn(2)), Some((k, 2)));
        assert_eq!(idx.content_len(), 1);
        assert_eq!(idx.hint_len(), 0);
    }

    #[test]
    fn remove_if_unshared_succeeds_only_at_refcount_one() {
        let idx = PShareIndex::new();
        let k = key(1);
        idx.add(k, Mpn(5), 2);
        assert!(!idx.remove_if_unshared(k, Mpn(5)), "refcount 2, must not remove");
        assert_eq!(idx.remove(k, Mpn(5)), 1);
        assert!(idx.remove_if_unshared(k, Mpn(5)));
        assert_eq!(idx.content_len(), 0);
    }

    #[test]
    fn collision_is_recorded_and_falls_through() {
        let idx = PShareIndex::new();
        let k = key(2);
        idx.add(k, Mpn(9), 1);
        let outcome = idx.add_if_shared(k, Mpn(10), |_| false);
        assert!(matches!(outcome, AddIfSharedOutcome::NoMatch));
        assert_eq!(idx.stats().hash_collisions_detected, 1);
    }
}
