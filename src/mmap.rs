use std::fs::File;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// One writable memory-mapped extent of a backing file.
///
/// The mapping is released when the region is dropped.
pub struct MappedRegion {
    map: MmapMut,
}

impl MappedRegion {
    /// Maps `len` bytes of `file` starting at `file_offset`, which must be
    /// page aligned. The file must already be at least that long.
    pub fn map_extent(file: &File, file_offset: u64, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::AllocationFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "mmap length must be non-zero",
            )));
        }
        let map = unsafe {
            MmapOptions::new()
                .offset(file_offset)
                .len(len)
                .map_mut(file)
                .map_err(Error::AllocationFailure)?
        };
        Ok(Self { map })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.map.len() {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Corrupt("range overflow"))?;
        if end > self.map.len() {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}
