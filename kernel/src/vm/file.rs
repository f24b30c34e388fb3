//! Memory-mapped files.
//!
//! `mmap` registers one pending page per file page; nothing is read until
//! a page faults. `munmap` (and address-space teardown) writes
//! hardware-dirty pages back to the file before dropping them.

use crate::fs::File;
use crate::vm::page::{FileSegment, Loader, PageKind, PageState};
use crate::vm::AddressSpace;
use minnowos_shared::mem::{page_offset, PAGE_FRAME_SIZE};

impl AddressSpace {
    /// Map `length` bytes of `file`, starting at byte `offset`, at `addr`.
    ///
    /// The whole span must be page-aligned and free of existing pages;
    /// overlapping an existing mapping fails before anything is
    /// registered. The mapping holds its own reopened handle, so it
    /// survives the caller closing `file`. Returns the base address.
    pub fn mmap(
        &self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &File,
        offset: usize,
    ) -> Option<usize> {
        if addr == 0 || length == 0 || page_offset(addr) != 0 || page_offset(offset) != 0 {
            return None;
        }
        let count = length.div_ceil(PAGE_FRAME_SIZE);
        {
            let spt = self.spt.lock();
            for index in 0..count {
                if spt.find(addr + index * PAGE_FRAME_SIZE).is_some() {
                    return None;
                }
            }
        }

        let file = file.reopen();
        let mut remaining = length;
        let mut file_offset = offset;
        for index in 0..count {
            let page_addr = addr + index * PAGE_FRAME_SIZE;
            let read_bytes = remaining.min(PAGE_FRAME_SIZE);
            let segment = FileSegment {
                file: file.clone(),
                offset: file_offset,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
                span: count,
            };
            if !self.alloc_page(PageKind::File, page_addr, writable, Loader::Segment(segment)) {
                // Drop the pages this call already registered.
                for registered in 0..index {
                    self.spt
                        .lock()
                        .remove(addr + registered * PAGE_FRAME_SIZE, &self.vm);
                }
                return None;
            }
            remaining -= read_bytes;
            file_offset += read_bytes;
        }
        Some(addr)
    }

    /// Drop the mapping that starts at `addr`, writing dirty pages back to
    /// the file. Walks at most the mapping's own span, stopping early if a
    /// page is already gone.
    pub fn munmap(&self, addr: usize) {
        let span = {
            let spt = self.spt.lock();
            let Some(first) = spt.find(addr) else {
                return;
            };
            let first = first.lock();
            match &first.state {
                PageState::File(file_page) => file_page.span,
                PageState::Uninit(uninit) => match &uninit.loader {
                    Loader::Segment(segment) if uninit.kind == PageKind::File => segment.span,
                    _ => return,
                },
                PageState::Anon(_) => return,
            }
        };
        for index in 0..span {
            if !self
                .spt
                .lock()
                .remove(addr + index * PAGE_FRAME_SIZE, &self.vm)
            {
                break;
            }
        }
    }
}
