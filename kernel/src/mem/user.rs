//! Kernel access to user memory.
//!
//! These helpers walk an address space the way the hardware would: resolve
//! each page through the page directory, raising a page fault when the
//! page is missing or the access is disallowed, and set the accessed and
//! dirty bits as a side effect. Tests and kernel copy-in/copy-out paths go
//! through here so demand paging actually gets exercised.

use crate::vm::{AddressSpace, Fault};
use alloc::vec::Vec;
use minnowos_shared::mem::{page_offset, page_round_down, PAGE_FRAME_SIZE};

/// Stack-pointer value for accesses that are not stack pushes, so the
/// fault path never mistakes a stray access for stack growth.
const NOT_A_STACK_ACCESS: usize = usize::MAX;

/// Make the page containing `addr` present and, for writes, writable.
/// Missing or disallowed pages go through the fault path, exactly like a
/// hardware access would.
fn ensure_resident(aspace: &AddressSpace, addr: usize, write: bool) -> bool {
    let va = page_round_down(addr);
    let (mapped, writable) = {
        let pagedir = aspace.pagedir().lock();
        (pagedir.lookup(va).is_some(), pagedir.is_writable(va))
    };
    if mapped && (!write || writable) {
        return true;
    }
    aspace.try_handle_fault(&Fault {
        addr,
        user: true,
        write,
        not_present: !mapped,
        stack_pointer: NOT_A_STACK_ACCESS,
    })
}

/// Copy `bytes` into user memory at `va`, faulting pages in on demand.
/// Returns false if some page cannot be made present and writable.
pub fn write_bytes(aspace: &AddressSpace, va: usize, bytes: &[u8]) -> bool {
    let mut addr = va;
    let mut rest = bytes;
    while !rest.is_empty() {
        let page_va = page_round_down(addr);
        let offset = page_offset(addr);
        let chunk = rest.len().min(PAGE_FRAME_SIZE - offset);
        if !ensure_resident(aspace, addr, true) {
            return false;
        }
        let ppn = aspace.pagedir().lock().lookup(page_va);
        let Some(ppn) = ppn else {
            return false;
        };
        {
            let mut pool = aspace.vm.pool.lock();
            pool.frame_mut(ppn)[offset..offset + chunk].copy_from_slice(&rest[..chunk]);
        }
        aspace.pagedir().lock().mark_access(page_va, true);
        addr += chunk;
        rest = &rest[chunk..];
    }
    true
}

/// Copy `count` bytes of user memory starting at `va` into kernel memory,
/// faulting pages in on demand. Returns `None` if some page cannot be
/// made present.
pub fn read_bytes(aspace: &AddressSpace, va: usize, count: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(count);
    let mut addr = va;
    let mut remaining = count;
    while remaining > 0 {
        let page_va = page_round_down(addr);
        let offset = page_offset(addr);
        let chunk = remaining.min(PAGE_FRAME_SIZE - offset);
        if !ensure_resident(aspace, addr, false) {
            return None;
        }
        let ppn = aspace.pagedir().lock().lookup(page_va)?;
        {
            let pool = aspace.vm.pool.lock();
            out.extend_from_slice(&pool.frame(ppn)[offset..offset + chunk]);
        }
        aspace.pagedir().lock().mark_access(page_va, false);
        addr += chunk;
        remaining -= chunk;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Loader, PageKind, VmState};

    #[test]
    fn writes_fault_pages_in_and_read_back() {
        let vm = VmState::new(4, 64);
        let aspace = AddressSpace::new(vm);
        assert!(aspace.alloc_page(PageKind::Anon, 0x1000, true, Loader::Zero));
        assert!(aspace.alloc_page(PageKind::Anon, 0x2000, true, Loader::Zero));

        // A straddling write demand-loads both pages.
        let bytes: Vec<u8> = (0u8..64).collect();
        assert!(write_bytes(&aspace, 0x2000 - 32, &bytes));
        assert_eq!(read_bytes(&aspace, 0x2000 - 32, 64).unwrap(), bytes);
        assert!(aspace.pagedir().lock().is_dirty(0x1000));
        assert!(aspace.pagedir().lock().is_accessed(0x2000));
    }

    #[test]
    fn unregistered_addresses_are_rejected() {
        let vm = VmState::new(4, 64);
        let aspace = AddressSpace::new(vm);
        assert!(!write_bytes(&aspace, 0x7000, &[1, 2, 3]));
        assert!(read_bytes(&aspace, 0x7000, 3).is_none());
    }

    #[test]
    fn reads_do_not_set_the_dirty_bit() {
        let vm = VmState::new(4, 64);
        let aspace = AddressSpace::new(vm);
        assert!(aspace.alloc_page(PageKind::Anon, 0x1000, true, Loader::Zero));
        assert!(read_bytes(&aspace, 0x1000, 8).is_some());
        assert!(aspace.pagedir().lock().is_accessed(0x1000));
        assert!(!aspace.pagedir().lock().is_dirty(0x1000));
    }
}
