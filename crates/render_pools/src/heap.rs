//! First-fit sub-allocator for fixed-size descriptor heaps
//!
//! Hands out aligned `[offset, offset + size)` ranges of a heap that was
//! allocated once up front. Free ranges are kept in a map ordered by offset
//! and merged with their neighbours on free, so a heap that is drained in
//! any order ends up as a single block again. Live allocations are never
//! moved; when no block fits the request fails immediately.

use std::collections::BTreeMap;

use log::{debug, trace};
use thiserror::Error;

/// Errors from [`HeapAllocator`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block can hold the request with its alignment padding
    #[error("Heap allocation of {requested} bytes (alignment {alignment}) failed: insufficient memory")]
    OutOfMemory {
        /// Bytes requested
        requested: u64,
        /// Alignment requested
        alignment: u64,
    },

    /// Alignment was zero or not a power of two
    #[error("Invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(u64),

    /// Zero-byte allocations are rejected
    #[error("Zero-sized heap allocation")]
    ZeroSize,

    /// Range is outside the heap or overlaps memory that is already free
    #[error("Invalid free of {size} bytes at offset {offset}")]
    InvalidFree {
        /// Offset passed to free
        offset: u64,
        /// Size passed to free
        size: u64,
    },
}

/// Free-list allocator over `[0, total_size)`
#[derive(Debug, Clone, Default)]
pub struct HeapAllocator {
    total_size: u64,
    /// Free blocks keyed by offset; no two are adjacent
    free_blocks: BTreeMap<u64, u64>,
}

impl HeapAllocator {
    /// Allocator with one free block spanning `total_size`
    pub fn new(total_size: u64) -> Self {
        let mut allocator = Self::default();
        allocator.initialize(total_size);
        allocator
    }

    /// Forget every allocation and manage a heap of `total_size` bytes
    pub fn initialize(&mut self, total_size: u64) {
        self.total_size = total_size;
        self.reset();
        debug!("Heap allocator initialized with {total_size} bytes");
    }

    /// Return the whole heap to a single free block
    ///
    /// Outstanding offsets become invalid; callers use this when the heap
    /// itself is torn down and rebuilt.
    pub fn reset(&mut self) {
        self.free_blocks.clear();
        if self.total_size > 0 {
            self.free_blocks.insert(0, self.total_size);
        }
    }

    /// Allocate `size` bytes at an offset that is a multiple of `alignment`
    ///
    /// Scans free blocks in ascending offset order and takes the first one
    /// that fits. Alignment padding in front of the allocation and the
    /// unused tail both stay free.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(alignment));
        }

        let fit = self.free_blocks.iter().find_map(|(&block_offset, &block_size)| {
            let aligned = block_offset.checked_next_multiple_of(alignment)?;
            let required = size.checked_add(aligned - block_offset)?;
            (block_size >= required).then_some((block_offset, block_size, aligned))
        });

        let Some((block_offset, block_size, aligned)) = fit else {
            return Err(HeapError::OutOfMemory {
                requested: size,
                alignment,
            });
        };

        self.free_blocks.remove(&block_offset);

        let padding = aligned - block_offset;
        if padding > 0 {
            self.free_blocks.insert(block_offset, padding);
        }

        let remaining = block_size - padding - size;
        if remaining > 0 {
            self.free_blocks.insert(aligned + size, remaining);
        }

        trace!("Heap allocate {size} bytes (alignment {alignment}) at {aligned}");
        Ok(aligned)
    }

    /// Return `[offset, offset + size)` to the heap
    ///
    /// Merges with the free blocks directly before and after the range.
    /// Ranges outside the heap or overlapping free memory are rejected
    /// without modifying the allocator.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<(), HeapError> {
        let invalid = HeapError::InvalidFree { offset, size };
        let end = offset.checked_add(size).ok_or(invalid)?;
        if size == 0 || end > self.total_size {
            return Err(invalid);
        }

        let previous = self.free_blocks.range(..=offset).next_back().map(|(&o, &s)| (o, s));
        let next = self.free_blocks.range(offset..).next().map(|(&o, &s)| (o, s));

        if previous.is_some_and(|(o, s)| o + s > offset) || next.is_some_and(|(o, _)| o < end) {
            return Err(invalid);
        }

        let mut start = offset;
        let mut length = size;

        if let Some((next_offset, next_size)) = next.filter(|&(o, _)| o == end) {
            self.free_blocks.remove(&next_offset);
            length += next_size;
        }

        if let Some((previous_offset, previous_size)) = previous.filter(|&(o, s)| o + s == offset) {
            start = previous_offset;
            length += previous_size;
        }

        self.free_blocks.insert(start, length);
        trace!("Heap free {size} bytes at {offset}");
        Ok(())
    }

    /// Size of the managed heap
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes not currently allocated
    pub fn free_bytes(&self) -> u64 {
        self.free_blocks.values().sum()
    }

    /// Largest request with alignment 1 that would succeed
    pub fn largest_free_block(&self) -> u64 {
        self.free_blocks.values().copied().max().unwrap_or(0)
    }

    /// Number of disjoint free ranges
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// Free ranges as `(offset, size)` in ascending offset order
    pub fn free_blocks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free_blocks.iter().map(|(&offset, &size)| (offset, size))
    }
}
