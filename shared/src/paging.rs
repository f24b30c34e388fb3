// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation for user addresses, which all sit below 4GB.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use alloc::{boxed::Box, collections::BTreeMap};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

/// A user-pool physical frame number. The entry format caps these at 2^20,
/// which is plenty for any pool this kernel manages.
pub type Ppn = u32;

const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::default(); PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

/// One address space's page table, kept as a software structure: a sparse
/// directory of [`PageTable`]s whose entries carry the frame number plus the
/// `accessed`/`dirty` bits the eviction and write-back paths read. The
/// access paths that stand in for the CPU call [`PageManager::mark_access`]
/// to set those bits the way the hardware walker would.
#[derive(Default)]
pub struct PageManager {
    tables: BTreeMap<usize, Box<PageTable>>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, va: usize) -> Option<PageTableEntry> {
        let split = VirtualAddress::new_with_raw_value(va as u32);
        let table = self
            .tables
            .get(&usize::from(split.page_directory_index().value()))?;
        Some(table[usize::from(split.page_table_index().value())])
    }

    /// Rewrite the entry for `va` if one is present.
    fn update(&mut self, va: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) -> bool {
        let split = VirtualAddress::new_with_raw_value(va as u32);
        let Some(table) = self
            .tables
            .get_mut(&usize::from(split.page_directory_index().value()))
        else {
            return false;
        };
        let index = usize::from(split.page_table_index().value());
        if !table[index].present() {
            return false;
        }
        table[index] = f(table[index]);
        true
    }

    /// Install a mapping from `va` to frame `ppn`. Fails without touching
    /// the existing entry if `va` is already mapped.
    pub fn map(&mut self, va: usize, ppn: Ppn, writable: bool) -> bool {
        debug_assert_eq!(va % PAGE_FRAME_SIZE, 0);
        debug_assert!(va <= u32::MAX as usize);
        let split = VirtualAddress::new_with_raw_value(va as u32);
        let table = self
            .tables
            .entry(usize::from(split.page_directory_index().value()))
            .or_default();
        let index = usize::from(split.page_table_index().value());
        if table[index].present() {
            return false;
        }
        table[index] = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(ppn));
        true
    }

    /// Drop the mapping for `va`, clearing the entry (and with it the
    /// accessed and dirty bits) so a later access re-faults.
    pub fn unmap(&mut self, va: usize) {
        self.update(va, |_| PageTableEntry::DEFAULT);
    }

    pub fn lookup(&self, va: usize) -> Option<Ppn> {
        let entry = self.entry(va)?;
        entry.present().then(|| entry.page_frame_address().value())
    }

    pub fn is_writable(&self, va: usize) -> bool {
        self.entry(va)
            .is_some_and(|entry| entry.present() && entry.read_write())
    }

    pub fn is_accessed(&self, va: usize) -> bool {
        self.entry(va)
            .is_some_and(|entry| entry.present() && entry.accessed())
    }

    pub fn clear_accessed(&mut self, va: usize) {
        self.update(va, |entry| entry.with_accessed(false));
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.entry(va)
            .is_some_and(|entry| entry.present() && entry.dirty())
    }

    pub fn clear_dirty(&mut self, va: usize) {
        self.update(va, |entry| entry.with_dirty(false));
    }

    /// What the hardware walker does on a load or store: set the accessed
    /// bit, and the dirty bit too for stores. No-op when `va` is unmapped.
    pub fn mark_access(&mut self, va: usize, write: bool) {
        self.update(va, |entry| {
            let entry = entry.with_accessed(true);
            if write {
                entry.with_dirty(true)
            } else {
                entry
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lookup_unmap() {
        let mut pm = PageManager::new();
        assert_eq!(pm.lookup(0x1000), None);
        assert!(pm.map(0x1000, 7, true));
        assert_eq!(pm.lookup(0x1000), Some(7));
        assert!(pm.is_writable(0x1000));
        pm.unmap(0x1000);
        assert_eq!(pm.lookup(0x1000), None);
    }

    #[test]
    fn double_map_fails_and_preserves_entry() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x2000, 1, false));
        assert!(!pm.map(0x2000, 2, true));
        assert_eq!(pm.lookup(0x2000), Some(1));
        assert!(!pm.is_writable(0x2000));
    }

    #[test]
    fn access_bits() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x3000, 3, true));
        assert!(!pm.is_accessed(0x3000));
        assert!(!pm.is_dirty(0x3000));

        pm.mark_access(0x3000, false);
        assert!(pm.is_accessed(0x3000));
        assert!(!pm.is_dirty(0x3000));

        pm.mark_access(0x3000, true);
        assert!(pm.is_dirty(0x3000));

        pm.clear_accessed(0x3000);
        pm.clear_dirty(0x3000);
        assert!(!pm.is_accessed(0x3000));
        assert!(!pm.is_dirty(0x3000));
    }

    #[test]
    fn unmap_clears_bits() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x4000, 4, true));
        pm.mark_access(0x4000, true);
        pm.unmap(0x4000);
        assert!(pm.map(0x4000, 5, true));
        assert!(!pm.is_accessed(0x4000));
        assert!(!pm.is_dirty(0x4000));
    }

    #[test]
    fn distant_addresses_use_separate_tables() {
        let mut pm = PageManager::new();
        assert!(pm.map(0x1000, 1, true));
        assert!(pm.map(0x40001000, 2, true));
        assert_eq!(pm.lookup(0x1000), Some(1));
        assert_eq!(pm.lookup(0x40001000), Some(2));
    }
}
