//! The supplemental page table: one address space's directory of page
//! descriptors, keyed by page-aligned virtual address.

use crate::sync::Mutex;
use crate::vm::page::Page;
use crate::vm::VmState;
use alloc::{collections::BTreeMap, sync::Arc};
use minnowos_shared::mem::{page_round_down, PAGE_FRAME_SIZE};

#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<usize, Arc<Mutex<Page>>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the page containing `va`. Never mutates the table.
    pub fn find(&self, va: usize) -> Option<Arc<Mutex<Page>>> {
        self.pages.get(&page_round_down(va)).cloned()
    }

    /// Register `page` under its virtual address. Fails, leaving both the
    /// table and any existing entry untouched, if the address is taken;
    /// the caller discards the page.
    pub fn insert(&mut self, page: Page) -> bool {
        debug_assert_eq!(page.va() % PAGE_FRAME_SIZE, 0);
        let va = page.va();
        if self.pages.contains_key(&va) {
            return false;
        }
        self.pages.insert(va, Arc::new(Mutex::new(page)));
        true
    }

    /// Tear down the page at `va`: release its backing resources through
    /// its strategy and drop it from the table. Returns whether a page was
    /// there.
    pub(crate) fn remove(&mut self, va: usize, vm: &VmState) -> bool {
        let Some(page_arc) = self.pages.remove(&page_round_down(va)) else {
            return false;
        };
        let mut frames = vm.frames.lock();
        page_arc.lock().destroy(vm, &mut frames);
        true
    }

    /// Tear down every remaining page. Dirty file-backed pages get the
    /// same write-back as an explicit unmap would give them.
    pub(crate) fn kill(&mut self, vm: &VmState) {
        while let Some((_va, page_arc)) = self.pages.pop_first() {
            let mut frames = vm.frames.lock();
            page_arc.lock().destroy(vm, &mut frames);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&usize, &Arc<Mutex<Page>>)> {
        self.pages.iter()
    }
}
