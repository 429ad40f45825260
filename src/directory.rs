//! Two-level PPN->PFrame directory (§3.3). Top-level array indexed by
//! `ppn >> 10`, each entry a lazily-allocated page of 1024 `PFrame`s. This
//! is the teacher's own `MEMORY_ALLOCATIONS` sparse-table idea (a flat
//! array in the teacher, sized to the max number of RAM pages) reshaped so
//! that a 64 GiB guest costs O(pages touched), not O(max guest size): the
//! teacher can afford a flat table because it only ever tracks *host* RAM;
//! here the table is indexed by *guest* PPN, which can be far larger than
//! what's actually resident.

use crate::pframe::PFrame;

const ENTRIES_PER_PAGE: usize = 1024;

pub struct PFrameDirectory {
    top: Vec<Option<Box<[PFrame; ENTRIES_PER_PAGE]>>>,
}

impl PFrameDirectory {
    pub fn new(num_phys_pages: u32) -> Self {
        let top_len = (num_phys_pages as usize).div_ceil(ENTRIES_PER_PAGE).max(1);
        PFrameDirectory { top: (0..top_len).map(|_| None).collect() }
    }

    /// Look up a PFrame without allocating its directory page. Returns
    /// `None` if no directory page has been allocated yet for this PPN
    /// (§4.1 case 1).
    pub fn get(&self, ppn: crate::ids::Ppn) -> Option<&PFrame> {
        self.top.get(ppn.directory_index())?.as_ref().map(|page| &page[ppn.page_offset()])
    }

    pub fn get_mut(&mut self, ppn: crate::ids::Ppn) -> Option<&mut PFrame> {
        self.top.get_mut(ppn.directory_index())?.as_mut().map(|page| &mut page[ppn.page_offset()])
    }

    /// Look up a PFrame, lazily allocating its directory page if absent
    /// (§4.1 case 1, "fall through").
    pub fn get_or_insert_mut(&mut self, ppn: crate::ids::Ppn) -> &mut PFrame {
        let dir_index = ppn.directory_index();
        let slot = self.top.get_mut(dir_index).expect("PPN out of range for this VM");
        let page = slot.get_or_insert_with(|| {
            Box::new(std::array::from_fn(|_| PFrame::default()))
        });
        &mut page[ppn.page_offset()]
    }

    pub fn has_directory_page(&self, ppn: crate::ids::Ppn) -> bool {
        self.top.get(ppn.directory_index()).map(|p| p.is_some()).unwrap_or(false)
    }

    /// Iterate over every allocated PFrame along with its PPN, for
    /// consistency checks (§4.2 "Consistency check (debug)") and teardown.
    pub fn iter(&self) -> impl Iterator<Item = (crate::ids::Ppn, &PFrame)> {
        self.top.iter().enumerate().flat_map(|(dir_idx, page)| {
            page.iter().flat_map(move |page| {
                page.iter().enumerate().map(move |(off, frame)| {
                    (crate::ids::Ppn((dir_idx * ENTRIES_PER_PAGE + off) as u32), frame)
                })
            })
        })
    }
}
