//! Demand paging.
//!
//! Each address space keeps a supplemental page table of page descriptors;
//! physical frames come out of one shared pool, registered in one shared
//! frame table. A fault either claims an already-registered page (loading
//! it from its backing store), grows the stack, or is fatal. Under memory
//! pressure the clock scan in [`frame`] spills victims to the swap device
//! or back to their backing file.

pub mod file;
pub mod frame;
pub mod page;
pub mod spt;
pub mod swap;

pub use page::{FileSegment, Loader, Page, PageKind};
pub use spt::SupplementalPageTable;

use crate::block::{Block, BlockDriver, BlockSector, RamDisk};
use crate::mem::pool::UserPool;
use crate::sync::Mutex;
use crate::vm::frame::{evict, Frame, FrameTable};
use crate::vm::page::PageState;
use crate::vm::swap::SwapSpace;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use minnowos_shared::mem::{
    page_round_down, MAX_STACK_SIZE, OFFSET, USER_POOL_FRAMES, USER_STACK_TOP, WORD_SIZE,
};
use minnowos_shared::paging::PageManager;
use minnowos_shared::sizes::SWAP_SECTORS;
use once_cell::race::OnceBox;

/// The process-wide paging state: the frame table, the user frame pool,
/// and the swap area. Any thread in any address space may take these locks
/// while resolving a fault or evicting.
pub struct VmState {
    pub(crate) frames: Mutex<FrameTable>,
    pub(crate) pool: Mutex<UserPool>,
    pub(crate) swap: Mutex<SwapSpace>,
}

impl VmState {
    /// Build a paging state with `frames` pool frames and a RAM-backed
    /// swap device of `swap_sectors` sectors.
    pub fn new(frames: usize, swap_sectors: BlockSector) -> Arc<Self> {
        let device = Block::new(
            "swap",
            swap_sectors,
            BlockDriver::Ram(RamDisk::new(swap_sectors)),
        );
        Arc::new(VmState {
            frames: Mutex::new(FrameTable::new()),
            pool: Mutex::new(UserPool::new(frames)),
            swap: Mutex::new(SwapSpace::new(device)),
        })
    }
}

static SYSTEM: OnceBox<Arc<VmState>> = OnceBox::new();

/// Process-wide startup: install the default-sized paging state. Calling
/// it again is a no-op.
pub fn init() {
    let _ = SYSTEM.set(Box::new(VmState::new(USER_POOL_FRAMES, SWAP_SECTORS)));
}

/// The paging state installed by [`init`].
pub fn system() -> &'static Arc<VmState> {
    SYSTEM.get().expect("vm::init has not been called")
}

/// What the hardware reports about one page fault.
pub struct Fault {
    /// The faulting virtual address.
    pub addr: usize,
    /// Whether the access came from user mode.
    pub user: bool,
    /// Whether the access was a write.
    pub write: bool,
    /// True for a missing mapping, false for a protection violation on a
    /// present one.
    pub not_present: bool,
    /// The faulting context's stack pointer, for the stack-growth check.
    pub stack_pointer: usize,
}

/// One process's demand-paged address space: its page directory plus the
/// supplemental page table describing every registered page.
pub struct AddressSpace {
    pub(crate) vm: Arc<VmState>,
    pub(crate) pagedir: Arc<Mutex<PageManager>>,
    pub(crate) spt: Mutex<SupplementalPageTable>,
}

impl AddressSpace {
    pub fn new(vm: Arc<VmState>) -> Self {
        AddressSpace {
            vm,
            pagedir: Arc::new(Mutex::new(PageManager::new())),
            spt: Mutex::new(SupplementalPageTable::new()),
        }
    }

    pub fn pagedir(&self) -> &Arc<Mutex<PageManager>> {
        &self.pagedir
    }

    /// Register a lazily-initialized page at `va`. Nothing is loaded and
    /// no frame is taken until the first fault. Fails if the address is
    /// already registered or is not a user address.
    pub fn alloc_page(&self, kind: PageKind, va: usize, writable: bool, loader: Loader) -> bool {
        if matches!((kind, &loader), (PageKind::File, Loader::Zero)) {
            return false;
        }
        let va = page_round_down(va);
        if va >= OFFSET {
            return false;
        }
        let page = Page::new(va, writable, kind, loader, self.pagedir.clone());
        self.spt.lock().insert(page)
    }

    /// Force residency of the already-registered page containing `va`.
    pub fn claim_page(&self, va: usize) -> bool {
        let found = self.spt.lock().find(va);
        match found {
            Some(page) => self.claim(&page),
            None => false,
        }
    }

    /// Give `page_arc` a frame, install its mapping, and populate the
    /// frame from the page's backing store. Runs under the frame table
    /// lock; exhaustion with no evictable victim is unrecoverable.
    fn claim(&self, page_arc: &Arc<Mutex<Page>>) -> bool {
        let vm = &self.vm;
        let mut frames = vm.frames.lock();
        let from_pool = vm.pool.lock().get_page();
        let ppn = match from_pool {
            Some(ppn) => ppn,
            None => match evict(&mut frames, vm) {
                Some(ppn) => ppn,
                None => panic!("out of frames: nothing evictable and no swap space left"),
            },
        };
        frames.push(Frame {
            ppn,
            page: Arc::downgrade(page_arc),
        });

        let mut page = page_arc.lock();
        let mapped = page.pagedir.lock().map(page.va, ppn, page.writable);
        if !mapped {
            // The address is already mapped: a kernel bug, not a condition
            // to paper over.
            page.frame = None;
            frames.remove(ppn);
            vm.pool.lock().free_page(ppn);
            return false;
        }
        page.frame = Some(ppn);
        if !page.swap_in(vm, ppn) {
            page.pagedir.lock().unmap(page.va);
            page.frame = None;
            frames.remove(ppn);
            vm.pool.lock().free_page(ppn);
            return false;
        }
        true
    }

    /// The page-fault entry point. Returns whether the fault was resolved;
    /// an unresolved fault terminates the faulting process.
    pub fn try_handle_fault(&self, fault: &Fault) -> bool {
        if !fault.not_present {
            // Protection violation on a present mapping. With no
            // copy-on-write handling, there is nothing to resolve.
            return false;
        }
        if fault.addr >= OFFSET {
            return false;
        }
        let va = page_round_down(fault.addr);
        let found = self.spt.lock().find(va);
        if let Some(page) = found {
            return self.claim(&page);
        }
        if fault.addr < USER_STACK_TOP
            && fault.addr + WORD_SIZE >= fault.stack_pointer
            && fault.addr >= USER_STACK_TOP - MAX_STACK_SIZE
        {
            return self.stack_growth(va);
        }
        false
    }

    /// Extend the stack with one writable anonymous page at `va`.
    fn stack_growth(&self, va: usize) -> bool {
        self.alloc_page(PageKind::Anon, va, true, Loader::Zero) && self.claim_page(va)
    }

    /// Duplicate `src` into this (empty) address space, for fork. Pending
    /// pages stay pending; materialized pages get a private frame holding
    /// a byte-for-byte copy — nothing is shared. Fails on the first page
    /// that cannot be duplicated; the caller discards the partial space.
    pub fn copy_from(&self, src: &AddressSpace) -> bool {
        let entries: Vec<_> = {
            let spt = src.spt.lock();
            spt.iter().map(|(va, page)| (*va, page.clone())).collect()
        };
        for (va, src_page) in entries {
            let (kind, writable, loader, materialized) = {
                let page = src_page.lock();
                match &page.state {
                    PageState::Uninit(uninit) => {
                        (uninit.kind, page.writable, uninit.loader.clone(), false)
                    }
                    PageState::Anon(_) => (PageKind::Anon, page.writable, Loader::Zero, true),
                    PageState::File(file_page) => (
                        PageKind::File,
                        page.writable,
                        Loader::Segment(FileSegment {
                            file: file_page.file.clone(),
                            offset: file_page.offset,
                            read_bytes: file_page.read_bytes,
                            zero_bytes: file_page.zero_bytes,
                            span: file_page.span,
                        }),
                        true,
                    ),
                }
            };
            if !self.alloc_page(kind, va, writable, loader) {
                return false;
            }
            if materialized {
                if !self.claim_page(va) {
                    return false;
                }
                let dst_page = {
                    let spt = self.spt.lock();
                    spt.find(va).expect("page was registered just above")
                };
                if !self.duplicate_frame(src, &src_page, &dst_page) {
                    return false;
                }
            }
        }
        true
    }

    /// Copy the source page's current frame contents into the destination
    /// page's frame. Claiming one side can evict the other under memory
    /// pressure, so retry until both are resident at once.
    fn duplicate_frame(
        &self,
        src: &AddressSpace,
        src_page: &Arc<Mutex<Page>>,
        dst_page: &Arc<Mutex<Page>>,
    ) -> bool {
        for _attempt in 0..8 {
            let src_frame = src_page.lock().frame;
            let Some(src_ppn) = src_frame else {
                if !src.claim(src_page) {
                    return false;
                }
                continue;
            };
            let dst_frame = dst_page.lock().frame;
            let Some(dst_ppn) = dst_frame else {
                if !self.claim(dst_page) {
                    return false;
                }
                continue;
            };
            self.vm.pool.lock().copy_frame(src_ppn, dst_ppn);
            return true;
        }
        false
    }

    /// Tear down every page in the address space, writing dirty
    /// file-backed contents to their files.
    pub fn kill(&self) {
        self.spt.lock().kill(&self.vm);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.kill();
    }
}
