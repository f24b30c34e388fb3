//! Page descriptors and their backing-store behavior.
//!
//! Every user page is one of three kinds of tenant: not yet materialized
//! (`Uninit`), backed by swap (`Anon`), or backed by a file (`File`). The
//! swap-in/swap-out/destroy operations dispatch on the variant, and each
//! variant carries exactly the payload its behavior needs.

use crate::fs::File;
use crate::sync::Mutex;
use crate::vm::frame::FrameTable;
use crate::vm::VmState;
use alloc::{sync::Arc, vec};
use minnowos_shared::{
    mem::PAGE_FRAME_SIZE,
    paging::{PageManager, Ppn},
};

/// The backing store a page will use once materialized.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Anon,
    File,
}

/// How to populate an uninitialized page on its first fault.
#[derive(Clone)]
pub enum Loader {
    /// Fill with zeroes.
    Zero,
    /// Read a segment of a file, zero-filling the tail.
    Segment(FileSegment),
}

/// One page's slice of a file mapping (or of a lazily loaded executable
/// segment).
#[derive(Clone)]
pub struct FileSegment {
    pub file: File,
    /// Byte offset of this page's data within the file.
    pub offset: usize,
    /// How many bytes come from the file; the rest of the page is zeroes.
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Total page count of the mapping this segment belongs to.
    pub span: usize,
}

pub struct UninitPage {
    pub kind: PageKind,
    pub loader: Loader,
}

pub struct AnonPage {
    /// Swap slot holding this page's contents while it is not resident.
    pub slot: Option<u32>,
}

pub struct FilePage {
    pub file: File,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub span: usize,
}

pub enum PageState {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// One virtual page of a user address space.
///
/// The supplemental page table owns these; the frame table only holds weak
/// back-references. A page keeps a handle on its owner's page directory so
/// eviction triggered from another address space can still clear the
/// owner's mapping.
pub struct Page {
    pub(crate) va: usize,
    pub(crate) writable: bool,
    pub(crate) state: PageState,
    pub(crate) frame: Option<Ppn>,
    pub(crate) pagedir: Arc<Mutex<PageManager>>,
}

impl Page {
    pub(crate) fn new(
        va: usize,
        writable: bool,
        kind: PageKind,
        loader: Loader,
        pagedir: Arc<Mutex<PageManager>>,
    ) -> Self {
        debug_assert_eq!(va % PAGE_FRAME_SIZE, 0);
        Page {
            va,
            writable,
            state: PageState::Uninit(UninitPage { kind, loader }),
            frame: None,
            pagedir,
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The page's backing-store kind, looking through deferred
    /// initialization.
    pub fn kind(&self) -> PageKind {
        match &self.state {
            PageState::Uninit(uninit) => uninit.kind,
            PageState::Anon(_) => PageKind::Anon,
            PageState::File(_) => PageKind::File,
        }
    }

    /// Populate frame `ppn` with this page's contents: the deferred loader
    /// for a first touch, the recorded swap slot for a page coming back
    /// from swap, or the backing file for a file page. A first touch also
    /// settles the page into its materialized state.
    pub(crate) fn swap_in(&mut self, vm: &VmState, ppn: Ppn) -> bool {
        let mut buf = vec![0u8; PAGE_FRAME_SIZE];
        let next = match &mut self.state {
            PageState::Uninit(uninit) => {
                match &uninit.loader {
                    Loader::Zero => {}
                    Loader::Segment(segment) => {
                        // A short read leaves the tail zeroed, which is
                        // exactly what the zero_bytes remainder asks for.
                        segment
                            .file
                            .read_at(&mut buf[..segment.read_bytes], segment.offset);
                    }
                }
                Some(match (uninit.kind, &uninit.loader) {
                    (PageKind::Anon, _) => PageState::Anon(AnonPage { slot: None }),
                    (PageKind::File, Loader::Segment(segment)) => PageState::File(FilePage {
                        file: segment.file.clone(),
                        offset: segment.offset,
                        read_bytes: segment.read_bytes,
                        zero_bytes: segment.zero_bytes,
                        span: segment.span,
                    }),
                    (PageKind::File, Loader::Zero) => {
                        unreachable!("file-backed pages always carry a segment loader")
                    }
                })
            }
            PageState::Anon(anon) => {
                if let Some(slot) = anon.slot.take() {
                    let mut swap = vm.swap.lock();
                    swap.read_page(slot, &mut buf);
                    swap.release(slot);
                }
                None
            }
            PageState::File(file_page) => {
                file_page
                    .file
                    .read_at(&mut buf[..file_page.read_bytes], file_page.offset);
                None
            }
        };
        if let Some(state) = next {
            self.state = state;
        }
        vm.pool.lock().frame_mut(ppn).copy_from_slice(&buf);
        true
    }

    /// Persist this resident page's contents somewhere recoverable, clear
    /// the owner's mapping so the next access re-faults, and detach the
    /// frame. Fails only when an anonymous page has no free swap slot to
    /// go to.
    pub(crate) fn swap_out(&mut self, vm: &VmState) -> bool {
        let ppn = self.frame.expect("swapping out a page with no frame");
        let buf = vm.pool.lock().frame(ppn).to_vec();
        match &mut self.state {
            PageState::Anon(anon) => {
                let mut swap = vm.swap.lock();
                let Some(slot) = swap.allocate() else {
                    return false;
                };
                swap.write_page(slot, &buf);
                anon.slot = Some(slot);
            }
            PageState::File(file_page) => {
                let dirty = self.pagedir.lock().is_dirty(self.va);
                if dirty {
                    file_page
                        .file
                        .write_at(&buf[..file_page.read_bytes], file_page.offset);
                    self.pagedir.lock().clear_dirty(self.va);
                }
            }
            PageState::Uninit(_) => unreachable!("uninit pages are never resident"),
        }
        self.pagedir.lock().unmap(self.va);
        self.frame = None;
        true
    }

    /// Release everything the page holds: its frame (with file write-back
    /// if the hardware marked it dirty) or, for a swapped-out anonymous
    /// page, its swap slot. Called with the frame table locked, from unmap
    /// and address-space teardown.
    pub(crate) fn destroy(&mut self, vm: &VmState, frames: &mut FrameTable) {
        if let Some(ppn) = self.frame.take() {
            if let PageState::File(file_page) = &self.state {
                let dirty = self.pagedir.lock().is_dirty(self.va);
                if dirty {
                    let buf = vm.pool.lock().frame(ppn).to_vec();
                    file_page
                        .file
                        .write_at(&buf[..file_page.read_bytes], file_page.offset);
                    self.pagedir.lock().clear_dirty(self.va);
                }
            }
            self.pagedir.lock().unmap(self.va);
            frames.remove(ppn);
            vm.pool.lock().free_page(ppn);
        } else if let PageState::Anon(anon) = &mut self.state {
            if let Some(slot) = anon.slot.take() {
                vm.swap.lock().release(slot);
            }
        }
    }
}
