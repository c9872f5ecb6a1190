//! Bounds-checked accessor over one mapped segment.
//!
//! A segment knows nothing about cursors or records; the queue log owns all
//! sequencing. Every access is checked against `[begin, end]` so a bad
//! pointer surfaces as an error instead of touching a neighbouring extent.

use std::fmt;

use crate::mmap::MappedRegion;
use crate::pointer::{SegmentPointer, VirtualPointer, SEGMENT_SIZE};
use crate::{Error, Result};

/// Byte written over recycled and freshly allocated segments.
pub const WIPE_BYTE: u8 = 0xFF;

pub struct Segment {
    begin: SegmentPointer,
    end: SegmentPointer,
    region: MappedRegion,
}

impl Segment {
    pub fn new(region: MappedRegion, page_id: u64) -> Result<Self> {
        if region.len() != SEGMENT_SIZE {
            return Err(Error::Corrupt("segment size mismatch"));
        }
        let begin = SegmentPointer::page_start(page_id);
        let end = SegmentPointer::page_end(page_id);
        debug_assert!(begin.same_page(&end));
        Ok(Self { begin, end, region })
    }

    pub fn begin(&self) -> SegmentPointer {
        self.begin
    }

    pub fn end(&self) -> SegmentPointer {
        self.end
    }

    pub fn page_id(&self) -> u64 {
        self.begin.page_id()
    }

    pub fn size(&self) -> usize {
        // end is inclusive
        self.end.offset() as usize - self.begin.offset() as usize + 1
    }

    /// Bytes in the segment after `mark`, not counting the byte at `mark`.
    pub fn bytes_after(&self, mark: SegmentPointer) -> Result<u64> {
        let distance = self.end.distance(&mark)?;
        u64::try_from(distance).map_err(|_| Error::OutOfRange {
            offset: i64::from(mark.offset()),
        })
    }

    pub fn bytes_after_virtual(&self, mark: VirtualPointer) -> Result<u64> {
        self.bytes_after(self.rebase(mark)?)
    }

    /// Bytes available for a write starting at `mark`, the byte at `mark`
    /// included.
    pub fn remaining(&self, mark: VirtualPointer) -> Result<usize> {
        Ok(self.bytes_after_virtual(mark)? as usize + 1)
    }

    pub fn has_space(&self, mark: VirtualPointer, length: usize) -> bool {
        self.remaining(mark)
            .map(|available| available >= length)
            .unwrap_or(false)
    }

    pub fn write(&mut self, at: SegmentPointer, content: &[u8]) -> Result<()> {
        let start = self.index_of(at)?;
        let available = self.size() - start;
        if content.len() > available {
            return Err(Error::CapacityExceeded {
                requested: content.len(),
                available,
            });
        }
        self.region
            .range_mut(start, content.len())?
            .copy_from_slice(content);
        Ok(())
    }

    pub fn write_virtual(&mut self, at: VirtualPointer, content: &[u8]) -> Result<()> {
        let at = self.rebase(at)?;
        self.write(at, content)
    }

    pub fn read(&self, start: SegmentPointer, length: usize) -> Result<Vec<u8>> {
        let index = self.index_of(start)?;
        let available = self.region.len() - index;
        if length > available {
            return Err(Error::BufferUnderflow {
                requested: length,
                available,
            });
        }
        Ok(self.region.range(index, length)?.to_vec())
    }

    pub fn read_virtual(&self, start: VirtualPointer, length: usize) -> Result<Vec<u8>> {
        self.read(self.rebase(start)?, length)
    }

    /// The big-endian `u32` stored in the four bytes at `at`.
    pub fn read_header(&self, at: VirtualPointer) -> Result<u32> {
        let index = self.index_of(self.rebase(at)?)?;
        let available = self.region.len() - index;
        if available < 4 {
            return Err(Error::BufferUnderflow {
                requested: 4,
                available,
            });
        }
        let bytes = self.region.range(index, 4)?;
        let header = u32::from_be_bytes(bytes.try_into().expect("slice length"));
        log::trace!("header {header:#010x} at {at}");
        Ok(header)
    }

    /// Every byte from `start` through the last byte of the segment.
    pub fn read_all_bytes_after(&self, start: SegmentPointer) -> Result<Vec<u8>> {
        // bytes_after excludes the slot at `start` itself
        let length = self.bytes_after(start)? as usize + 1;
        self.read(start, length)
    }

    pub fn read_all_bytes_after_virtual(&self, start: VirtualPointer) -> Result<Vec<u8>> {
        self.read_all_bytes_after(self.rebase(start)?)
    }

    pub fn fill_with(&mut self, value: u8) {
        log::debug!("wipe {self}");
        self.region.as_mut_slice().fill(value);
    }

    /// Flushes the mapped bytes to the backing file and waits for it.
    pub fn force(&self) -> Result<()> {
        self.region.flush_sync()
    }

    fn rebase(&self, at: VirtualPointer) -> Result<SegmentPointer> {
        at.to_segment_pointer(self.begin)
    }

    fn index_of(&self, at: SegmentPointer) -> Result<usize> {
        let distance = at.distance(&self.begin)?;
        usize::try_from(distance).map_err(|_| Error::OutOfRange { offset: distance })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(err) = self.region.flush_sync() {
            log::warn!("flush of {self} failed on release: {err}");
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segment{{page={}, begin={}, end={}, size={}}}",
            self.page_id(),
            self.begin.offset(),
            self.end.offset(),
            self.size()
        )
    }
}
