//! Physical and logical addresses into a queue's storage.
//!
//! A [`SegmentPointer`] names one byte inside one mapped extent (a "page").
//! A [`VirtualPointer`] is a byte offset into the unbounded stream a queue
//! presents; [`VirtualPointer::to_segment_pointer`] is the only way to turn
//! the second into the first.

use std::fmt;

use crate::{Error, Result};

/// Size of every segment, in bytes (4 MiB).
pub const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentPointer {
    page_id: u64,
    offset: u32,
}

impl SegmentPointer {
    pub fn new(page_id: u64, offset: u32) -> Result<Self> {
        if offset as usize >= SEGMENT_SIZE {
            return Err(Error::OutOfRange {
                offset: i64::from(offset),
            });
        }
        Ok(Self { page_id, offset })
    }

    /// First byte of `page_id`.
    pub fn page_start(page_id: u64) -> Self {
        Self { page_id, offset: 0 }
    }

    /// Last byte of `page_id`.
    pub fn page_end(page_id: u64) -> Self {
        Self {
            page_id,
            offset: (SEGMENT_SIZE - 1) as u32,
        }
    }

    pub fn page_id(&self) -> u64 {
        self.page_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn same_page(&self, other: &SegmentPointer) -> bool {
        self.page_id == other.page_id
    }

    /// Signed byte count `self - other`. Both pointers must share a page.
    pub fn distance(&self, other: &SegmentPointer) -> Result<i64> {
        if !self.same_page(other) {
            return Err(Error::PageMismatch {
                left: self.page_id,
                right: other.page_id,
            });
        }
        Ok(i64::from(self.offset) - i64::from(other.offset))
    }

    /// Pointer `n` bytes further into the same page.
    pub fn plus(&self, n: usize) -> Result<SegmentPointer> {
        let target = (self.offset as usize)
            .checked_add(n)
            .filter(|target| *target < SEGMENT_SIZE)
            .ok_or(Error::OutOfRange {
                offset: i64::from(self.offset).saturating_add(n as i64),
            })?;
        Ok(Self {
            page_id: self.page_id,
            offset: target as u32,
        })
    }
}

impl fmt::Display for SegmentPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page_id, self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualPointer(u64);

impl VirtualPointer {
    pub const ZERO: VirtualPointer = VirtualPointer(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// First byte of the segment with virtual index `index`.
    pub fn segment_begin(index: u64) -> Self {
        Self(index * SEGMENT_SIZE as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Offset inside whichever segment owns this pointer.
    pub fn segment_offset(&self) -> u32 {
        (self.0 % SEGMENT_SIZE as u64) as u32
    }

    /// Virtual index of the segment owning this pointer.
    pub fn segment_index(&self) -> u64 {
        self.0 / SEGMENT_SIZE as u64
    }

    pub fn plus(&self, n: u64) -> VirtualPointer {
        Self(self.0 + n)
    }

    /// Start of the segment following the one that owns this pointer.
    pub fn next_segment_begin(&self) -> VirtualPointer {
        Self::segment_begin(self.segment_index() + 1)
    }

    /// Bytes from `other` up to `self`; zero when `other` is ahead.
    pub fn bytes_since(&self, other: VirtualPointer) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// Rebases this logical offset onto the physical pointer space of the
    /// segment that starts at `segment_begin`.
    pub fn to_segment_pointer(&self, segment_begin: SegmentPointer) -> Result<SegmentPointer> {
        segment_begin.plus(self.segment_offset() as usize)
    }
}

impl fmt::Display for VirtualPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (segment {} +{})",
            self.0,
            self.segment_index(),
            self.segment_offset()
        )
    }
}
