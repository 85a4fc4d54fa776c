//! Size class management for the slab pool

use crate::error::{Error, Result};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A size class manages a fixed number of equally sized blocks.
///
/// The backing buffer is allocated once at initialization and never grows.
/// Free slots are reused in lowest-index-first order via a min-heap.
#[derive(Debug)]
pub struct SizeClass {
    /// Index of this size class
    pub index: u16,
    /// Capacity of each block in bytes
    pub block_size: usize,
    /// Fixed number of blocks
    pub block_count: usize,
    /// Backing memory, `block_size * block_count` bytes
    data: Vec<u8>,
    /// Logical length of each slot
    lens: Vec<usize>,
    /// Allocation bitmap, double-free defense
    live: Vec<bool>,
    /// Free slots (min-heap over slot indices)
    free_slots: BinaryHeap<Reverse<u32>>,
}

impl SizeClass {
    /// Create a size class with every slot free.
    pub fn new(index: u16, block_size: usize, block_count: usize) -> Self {
        let mut free_slots = BinaryHeap::with_capacity(block_count);
        for slot in 0..block_count as u32 {
            free_slots.push(Reverse(slot));
        }
        Self {
            index,
            block_size,
            block_count,
            data: vec![0u8; block_size * block_count],
            lens: vec![0; block_count],
            live: vec![false; block_count],
            free_slots,
        }
    }

    /// Allocate a slot, or `None` when the class is exhausted.
    pub fn allocate(&mut self) -> Option<u32> {
        let Reverse(slot) = self.free_slots.pop()?;
        self.live[slot as usize] = true;
        self.lens[slot as usize] = 0;
        Some(slot)
    }

    /// Return a slot to the free heap.
    pub fn release(&mut self, slot: u32) -> Result<()> {
        let idx = self.check_slot(slot)?;
        self.live[idx] = false;
        self.lens[idx] = 0;
        self.free_slots.push(Reverse(slot));
        Ok(())
    }

    /// Write bytes into a slot. The logical size never exceeds the block
    /// capacity; oversized writes are rejected without touching the slot.
    pub fn write(&mut self, slot: u32, bytes: &[u8]) -> Result<()> {
        let idx = self.check_slot(slot)?;
        if bytes.len() > self.block_size {
            return Err(Error::InvalidBlock(format!(
                "Write of {} bytes exceeds block size {}",
                bytes.len(),
                self.block_size
            )));
        }
        let start = idx * self.block_size;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.lens[idx] = bytes.len();
        Ok(())
    }

    /// Read the logical contents of a slot.
    pub fn read(&self, slot: u32) -> Result<&[u8]> {
        let idx = self.check_slot(slot)?;
        let start = idx * self.block_size;
        Ok(&self.data[start..start + self.lens[idx]])
    }

    /// Logical length of a slot.
    pub fn len(&self, slot: u32) -> Result<usize> {
        let idx = self.check_slot(slot)?;
        Ok(self.lens[idx])
    }

    /// Check whether a payload fits in this class.
    pub fn can_fit(&self, size: usize) -> bool {
        size <= self.block_size
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Number of allocated slots.
    pub fn used_count(&self) -> usize {
        self.block_count - self.free_slots.len()
    }

    fn check_slot(&self, slot: u32) -> Result<usize> {
        let idx = slot as usize;
        if idx >= self.block_count {
            return Err(Error::InvalidBlock(format!(
                "Slot {} out of range for size class {} ({} blocks)",
                slot, self.block_size, self.block_count
            )));
        }
        if !self.live[idx] {
            return Err(Error::InvalidBlock(format!(
                "Slot {} of size class {} is not allocated",
                slot, self.block_size
            )));
        }
        Ok(idx)
    }
}
