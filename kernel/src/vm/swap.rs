//! The swap area: a bitmap of page-sized slots over the swap block device.
//!
//! Each slot is one page's worth of contiguous device sectors. A slot is
//! marked used from the moment an anonymous page is swapped out until that
//! page is swapped back in (or destroyed while out).

use crate::block::{Block, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};
use minnowos_shared::mem::PAGE_FRAME_SIZE;

pub(crate) const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

pub struct SwapSpace {
    device: Block,
    /// One bit per slot, 1 = free.
    bitmap: Vec<u64>,
    /// Groups of the bitmap known to contain a free slot.
    queue: Vec<u32>,
    slots: u32,
    used: u32,
}

impl SwapSpace {
    pub fn new(device: Block) -> Self {
        let slots = device.size() / SECTORS_PER_PAGE as u32;
        let groups = slots.div_ceil(64);
        let mut bitmap = vec![u64::MAX; groups as usize];
        // Slots past the end of the device don't exist; mark them used.
        for index in slots..groups * 64 {
            bitmap[(index / 64) as usize] &= !(1 << (index % 64));
        }
        // Reverse order so popping hands out low groups first.
        let queue = (0..groups)
            .rev()
            .filter(|&group| bitmap[group as usize] != 0)
            .collect();
        SwapSpace {
            device,
            bitmap,
            queue,
            slots,
            used: 0,
        }
    }

    /// Claim a free slot.
    ///
    /// Returns `None` if the swap area is full.
    ///
    /// This takes *O(1)* time.
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        let group_index = self.queue.pop()?;
        let group = &mut self.bitmap[group_index as usize];
        debug_assert_ne!(*group, 0, "swap bitmap consistency error");
        let index_in_group = group.trailing_zeros();
        // clear bit
        *group &= !(1 << index_in_group);
        if *group != 0 {
            // add back to queue
            self.queue.push(group_index);
        }
        self.used += 1;
        Some(group_index * 64 + index_in_group)
    }

    /// Free a slot.
    ///
    /// In debug mode, this panics if the slot was already free.
    ///
    /// This takes *O(1)* time.
    pub(crate) fn release(&mut self, slot: u32) {
        let group_index = slot / 64;
        let index_in_group = slot % 64;
        let group = &mut self.bitmap[group_index as usize];
        let add = *group == 0;
        debug_assert!(
            (*group & (1 << index_in_group)) == 0,
            "SwapSpace::release called on a free slot"
        );
        // set bit
        *group |= 1 << index_in_group;
        if add {
            self.queue.push(group_index);
        }
        self.used -= 1;
    }

    /// Write one page of data into `slot`, sector by sector.
    pub(crate) fn write_page(&mut self, slot: u32, buf: &[u8]) {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        let base = slot * SECTORS_PER_PAGE as u32;
        for index in 0..SECTORS_PER_PAGE {
            let start = index * BLOCK_SECTOR_SIZE;
            self.device
                .write(base + index as u32, &buf[start..start + BLOCK_SECTOR_SIZE]);
        }
    }

    /// Read one page of data out of `slot`, sector by sector.
    pub(crate) fn read_page(&mut self, slot: u32, buf: &mut [u8]) {
        assert_eq!(buf.len(), PAGE_FRAME_SIZE);
        let base = slot * SECTORS_PER_PAGE as u32;
        for index in 0..SECTORS_PER_PAGE {
            let start = index * BLOCK_SECTOR_SIZE;
            self.device.read(
                base + index as u32,
                &mut buf[start..start + BLOCK_SECTOR_SIZE],
            );
        }
    }

    pub fn slots_total(&self) -> u32 {
        self.slots
    }

    pub fn slots_used(&self) -> u32 {
        self.used
    }

    #[cfg(test)]
    pub(crate) fn device(&self) -> &Block {
        &self.device
    }
}
