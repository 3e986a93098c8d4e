//! The ordered page-interval table describing a cage's valid address ranges.

use std::collections::BTreeMap;

use crate::host::descriptor::FileHandle;
use crate::host::memory::{Prot, PAGE_SHIFT};

/// File backing for a mapped interval. Holding the handle keeps the
/// underlying descriptor object alive for the lifetime of the mapping.
#[derive(Clone, Debug)]
pub struct FileBacking {
    pub file: FileHandle,
    pub offset: i64,
    pub file_size: i64,
}

/// One interval of mapped pages.
#[derive(Clone, Debug)]
pub struct VmEntry {
    pub page_num: usize,
    pub npages: usize,
    pub prot: Prot,
    pub backing: Option<FileBacking>,
}

impl VmEntry {
    pub fn end_page(&self) -> usize {
        self.page_num + self.npages
    }

    pub fn start_addr(&self) -> usize {
        self.page_num << PAGE_SHIFT
    }

    pub fn end_addr(&self) -> usize {
        self.end_page() << PAGE_SHIFT
    }

    fn split_off(&mut self, page: usize) -> VmEntry {
        debug_assert!(page > self.page_num && page < self.end_page());
        let tail_npages = self.end_page() - page;
        self.npages -= tail_npages;
        let mut tail = self.clone();
        tail.page_num = page;
        tail.npages = tail_npages;
        if let Some(backing) = &mut tail.backing {
            backing.offset += ((page - self.page_num) << PAGE_SHIFT) as i64;
        }
        tail
    }
}

/// Ordered, non-overlapping set of [`VmEntry`]s covering the accessible
/// pages of one cage window.
///
/// Page 0 is reserved (a user pointer of 0 is never valid), so hole
/// searches start at page 1.
pub struct VmMap {
    // keyed by first page of each entry
    entries: BTreeMap<usize, VmEntry>,
    // total pages in the cage window; entries never extend past this
    num_pages: usize,
}

impl VmMap {
    pub fn new(num_pages: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            num_pages,
        }
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry containing `page`, if any.
    pub fn find_page(&self, page: usize) -> Option<&VmEntry> {
        let (_, ent) = self.entries.range(..=page).next_back()?;
        (ent.end_page() > page).then_some(ent)
    }

    /// Lowest-address interval of at least `npages` pages not covered by
    /// any entry.
    pub fn find_hole(&self, npages: usize) -> Option<usize> {
        self.find_hole_aligned(npages, 1)
    }

    /// Like [`find_hole`](Self::find_hole), but the hole must start on a
    /// multiple of `align_pages` (a power of two).
    pub fn find_hole_aligned(&self, npages: usize, align_pages: usize) -> Option<usize> {
        self.find_hole_from(1, npages, align_pages)
    }

    /// Like [`find_hole`](Self::find_hole), but only considers pages at or
    /// above `hint`; falls back to a full search if nothing fits there.
    pub fn find_hole_above(&self, hint: usize, npages: usize) -> Option<usize> {
        self.find_hole_aligned_above(hint, npages, 1)
    }

    pub fn find_hole_aligned_above(
        &self,
        hint: usize,
        npages: usize,
        align_pages: usize,
    ) -> Option<usize> {
        self.find_hole_from(std::cmp::max(hint, 1), npages, align_pages)
            .or_else(|| self.find_hole_aligned(npages, align_pages))
    }

    fn find_hole_from(&self, start: usize, npages: usize, align_pages: usize) -> Option<usize> {
        debug_assert!(align_pages.is_power_of_two());
        if npages == 0 || start >= self.num_pages {
            return None;
        }
        let align = |page: usize| crate::utility::round_up_pow2(page, align_pages);
        let mut cursor = align(start);
        loop {
            // aligning can land the cursor inside an entry; hop over it
            if let Some(ent) = self.find_page(cursor) {
                cursor = align(ent.end_page());
                continue;
            }
            match self.entries.range(cursor..).next() {
                Some((_, ent)) => {
                    if ent.page_num - cursor >= npages {
                        return Some(cursor);
                    }
                    cursor = align(ent.end_page());
                }
                None => {
                    return (self.num_pages.saturating_sub(cursor) >= npages).then_some(cursor);
                }
            }
        }
    }

    // Splits any entry spanning `page` so that `page` becomes an entry
    // boundary.
    fn split_at(&mut self, page: usize) {
        let Some((&key, _)) = self.entries.range_mut(..page).next_back() else {
            return;
        };
        let ent = self.entries.get_mut(&key).unwrap();
        if ent.end_page() > page {
            let tail = ent.split_off(page);
            self.entries.insert(page, tail);
        }
    }

    /// Remove all coverage of `[page, page + npages)`, splitting partially
    /// overlapping entries.
    pub fn remove(&mut self, page: usize, npages: usize) {
        let end = page + npages;
        self.split_at(page);
        self.split_at(end);
        let contained: Vec<usize> = self
            .entries
            .range(page..end)
            .map(|(&k, _)| k)
            .collect();
        for k in contained {
            self.entries.remove(&k);
        }
    }

    /// Insert an interval, replacing whatever coverage it overlaps.
    pub fn add_with_overwrite(
        &mut self,
        page: usize,
        npages: usize,
        prot: Prot,
        backing: Option<FileBacking>,
    ) {
        assert!(npages > 0);
        assert!(page + npages <= self.num_pages);
        self.remove(page, npages);
        self.entries.insert(
            page,
            VmEntry {
                page_num: page,
                npages,
                prot,
                backing,
            },
        );
    }

    /// True if `[page, page + npages)` is fully covered and every covered
    /// entry allows at least `prot`.
    pub fn check_existing(&self, page: usize, npages: usize, prot: Prot) -> bool {
        let end = page + npages;
        let mut cursor = page;
        while cursor < end {
            let Some(ent) = self.find_page(cursor) else {
                return false;
            };
            if !ent.prot.contains(prot) {
                return false;
            }
            cursor = ent.end_page();
        }
        true
    }

    /// Update the protection of `[page, page + npages)`. Fails without
    /// mutating anything unless the range is fully covered.
    pub fn change_prot(&mut self, page: usize, npages: usize, prot: Prot) -> bool {
        if !self.check_existing(page, npages, Prot::empty()) {
            return false;
        }
        let end = page + npages;
        self.split_at(page);
        self.split_at(end);
        for (_, ent) in self.entries.range_mut(page..end) {
            ent.prot = prot;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(map: &mut VmMap, page: usize, npages: usize, prot: Prot) {
        map.add_with_overwrite(page, npages, prot, None);
    }

    #[test]
    fn test_find_page() {
        let mut m = VmMap::new(1024);
        anon(&mut m, 16, 16, Prot::READ | Prot::WRITE);
        assert!(m.find_page(15).is_none());
        assert_eq!(m.find_page(16).unwrap().npages, 16);
        assert_eq!(m.find_page(31).unwrap().page_num, 16);
        assert!(m.find_page(32).is_none());
    }

    #[test]
    fn test_find_hole_skips_page_zero() {
        let m = VmMap::new(1024);
        assert_eq!(m.find_hole(4), Some(1));
    }

    #[test]
    fn test_find_hole_between_entries() {
        let mut m = VmMap::new(1024);
        anon(&mut m, 1, 7, Prot::READ);
        anon(&mut m, 16, 16, Prot::READ);
        assert_eq!(m.find_hole(8), Some(8));
        // doesn't fit between; lands after the second entry
        assert_eq!(m.find_hole(9), Some(32));
        assert_eq!(m.find_hole_above(100, 9), Some(100));
        // hint beyond the window falls back to a full search
        assert_eq!(m.find_hole_above(2000, 9), Some(32));
        assert_eq!(m.find_hole(2000), None);
    }

    #[test]
    fn test_overwrite_splits() {
        let mut m = VmMap::new(1024);
        anon(&mut m, 10, 20, Prot::READ);
        anon(&mut m, 15, 5, Prot::READ | Prot::WRITE);
        let entries: Vec<_> = m.iter().map(|e| (e.page_num, e.npages)).collect();
        assert_eq!(entries, vec![(10, 5), (15, 5), (20, 10)]);
        assert!(m.find_page(17).unwrap().prot.contains(Prot::WRITE));
        assert!(!m.find_page(12).unwrap().prot.contains(Prot::WRITE));
    }

    #[test]
    fn test_remove_middle() {
        let mut m = VmMap::new(1024);
        anon(&mut m, 10, 20, Prot::READ);
        m.remove(12, 4);
        let entries: Vec<_> = m.iter().map(|e| (e.page_num, e.npages)).collect();
        assert_eq!(entries, vec![(10, 2), (16, 14)]);
    }

    #[test]
    fn test_check_existing() {
        let mut m = VmMap::new(1024);
        anon(&mut m, 10, 10, Prot::READ | Prot::WRITE);
        anon(&mut m, 20, 10, Prot::READ);
        assert!(m.check_existing(10, 20, Prot::READ));
        assert!(!m.check_existing(10, 20, Prot::WRITE));
        assert!(m.check_existing(12, 8, Prot::WRITE));
        // gap above 30
        assert!(!m.check_existing(25, 10, Prot::READ));
    }

    #[test]
    fn test_change_prot_atomic() {
        let mut m = VmMap::new(1024);
        anon(&mut m, 10, 10, Prot::READ | Prot::WRITE);
        // not fully covered; must not mutate
        assert!(!m.change_prot(15, 10, Prot::READ));
        assert!(m.find_page(15).unwrap().prot.contains(Prot::WRITE));

        assert!(m.change_prot(12, 4, Prot::READ));
        assert_eq!(m.find_page(12).unwrap().prot, Prot::READ);
        assert!(m.find_page(10).unwrap().prot.contains(Prot::WRITE));
        assert!(m.find_page(16).unwrap().prot.contains(Prot::WRITE));
    }

    #[test]
    fn test_split_adjusts_file_offset() {
        let mut m = VmMap::new(1024);
        let backing = FileBacking {
            file: FileHandle::invalid(),
            offset: 0,
            file_size: 1 << 20,
        };
        m.add_with_overwrite(10, 10, Prot::READ, Some(backing));
        m.remove(14, 2);
        let tail = m.find_page(16).unwrap();
        assert_eq!(
            tail.backing.as_ref().unwrap().offset,
            (6usize << PAGE_SHIFT) as i64
        );
    }
}
