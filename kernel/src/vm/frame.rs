//! The global frame table and the clock eviction policy.
//!
//! Every frame handed to a user page is registered here, in allocation
//! order. When the pool runs dry, the second-chance scan walks this table:
//! a frame whose page was accessed since the last visit gets its accessed
//! bit cleared and survives; the first frame without it becomes the
//! victim and its page is swapped out.

use crate::sync::Mutex;
use crate::vm::page::Page;
use crate::vm::VmState;
use alloc::sync::Weak;
use alloc::vec::Vec;
use minnowos_shared::paging::Ppn;

pub(crate) struct Frame {
    pub ppn: Ppn,
    /// The page currently occupying this frame.
    pub page: Weak<Mutex<Page>>,
}

pub(crate) struct FrameTable {
    frames: Vec<Frame>,
    /// Clock hand: index of the next frame the eviction scan visits.
    hand: usize,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            frames: Vec::new(),
            hand: 0,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn remove(&mut self, ppn: Ppn) {
        let Some(position) = self.frames.iter().position(|frame| frame.ppn == ppn) else {
            return;
        };
        self.frames.remove(position);
        if self.hand > position {
            self.hand -= 1;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Frame> {
        self.frames.iter()
    }
}

/// Pick and swap out a victim, returning its now-free frame. `None` means
/// nothing could be evicted (no frames at all, or the victim's swap space
/// is exhausted) — callers treat that as an unrecoverable condition.
///
/// Runs with the frame table lock held; victim pages are locked inside it.
pub(crate) fn evict(frames: &mut FrameTable, vm: &VmState) -> Option<Ppn> {
    if frames.frames.is_empty() {
        return None;
    }
    loop {
        let index = frames.hand % frames.frames.len();
        let (ppn, page_arc) = {
            let frame = &frames.frames[index];
            (
                frame.ppn,
                frame
                    .page
                    .upgrade()
                    .expect("frame table entry for a destroyed page"),
            )
        };
        let mut page = page_arc.lock();

        let accessed = {
            let mut pagedir = page.pagedir.lock();
            let accessed = pagedir.is_accessed(page.va);
            if accessed {
                pagedir.clear_accessed(page.va);
            }
            accessed
        };
        if accessed {
            // Second chance: spare it this pass.
            frames.hand = index + 1;
            continue;
        }

        if !page.swap_out(vm) {
            return None;
        }
        drop(page);
        frames.frames.remove(index);
        frames.hand = index;
        return Some(ppn);
    }
}
