//! Backing storage for one queue.
//!
//! ```text
//! {queue_dir}/
//!   segments.dat     page 0 | page 1 | ... each SEGMENT_SIZE bytes
//!   segments.meta    segment table: live pages in virtual order
//! ```
//!
//! Pages of `segments.dat` that the table does not list are free and get
//! handed out again before the file is extended.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::mmap::MappedRegion;
use crate::pointer::SEGMENT_SIZE;
use crate::segment::{Segment, WIPE_BYTE};
use crate::{Error, Result};

pub const DATA_FILE: &str = "segments.dat";
pub const TABLE_FILE: &str = "segments.meta";

const TABLE_MAGIC: u32 = 0x5350_5131; // 'SPQ1'
const TABLE_VERSION: u32 = 1;
const TABLE_FIXED_LEN: usize = 4 + 4 + 8 + 8 + 4;
const NO_CHECKPOINT: u64 = u64::MAX;

/// Persisted description of which pages back a queue, in virtual order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentTable {
    /// Virtual segment index backed by `pages[0]`.
    pub head_index: u64,
    /// Read cursor saved by the last durability checkpoint.
    pub read_checkpoint: Option<u64>,
    pub pages: Vec<u64>,
}

impl SegmentTable {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TABLE_FIXED_LEN + self.pages.len() * 8 + 4);
        buf.extend_from_slice(&TABLE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&TABLE_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.head_index.to_be_bytes());
        buf.extend_from_slice(&self.read_checkpoint.unwrap_or(NO_CHECKPOINT).to_be_bytes());
        buf.extend_from_slice(&(self.pages.len() as u32).to_be_bytes());
        for page in &self.pages {
            buf.extend_from_slice(&page.to_be_bytes());
        }
        let crc = table_crc(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TABLE_FIXED_LEN + 4 {
            return Err(Error::CorruptMetadata("segment table truncated"));
        }
        let (body, crc) = buf.split_at(buf.len() - 4);
        let crc = u32::from_be_bytes(crc.try_into().expect("slice length"));
        if table_crc(body) != crc {
            return Err(Error::CorruptMetadata("segment table crc mismatch"));
        }
        let magic = u32::from_be_bytes(body[0..4].try_into().expect("slice length"));
        if magic != TABLE_MAGIC {
            return Err(Error::CorruptMetadata("segment table magic mismatch"));
        }
        let version = u32::from_be_bytes(body[4..8].try_into().expect("slice length"));
        if version != TABLE_VERSION {
            return Err(Error::CorruptMetadata("unsupported segment table version"));
        }
        let head_index = u64::from_be_bytes(body[8..16].try_into().expect("slice length"));
        let checkpoint = u64::from_be_bytes(body[16..24].try_into().expect("slice length"));
        let count = u32::from_be_bytes(body[24..28].try_into().expect("slice length")) as usize;
        if body.len() != TABLE_FIXED_LEN + count * 8 {
            return Err(Error::CorruptMetadata("segment table length mismatch"));
        }
        let pages = body[TABLE_FIXED_LEN..]
            .chunks_exact(8)
            .map(|chunk| u64::from_be_bytes(chunk.try_into().expect("slice length")))
            .collect();
        Ok(Self {
            head_index,
            read_checkpoint: (checkpoint != NO_CHECKPOINT).then_some(checkpoint),
            pages,
        })
    }
}

fn table_crc(payload: &[u8]) -> u32 {
    use crc32fast::Hasher;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

pub fn load_table(path: &Path) -> Result<SegmentTable> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SegmentTable::default())
        }
        Err(err) => return Err(err.into()),
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    SegmentTable::decode(&buf)
}

pub fn store_table(path: &Path, table: &SegmentTable) -> Result<()> {
    let tmp_path = path.with_extension("meta.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&table.encode())?;
    file.sync_all()?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

/// Directory name for a queue: the client id as lowercase hex, so any
/// client id maps to a portable file name.
pub fn queue_dir_name(client_id: &str) -> String {
    client_id.bytes().map(|byte| format!("{byte:02x}")).collect()
}

pub fn parse_queue_dir_name(name: &str) -> Option<String> {
    if name.len() % 2 != 0 || !name.bytes().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&name[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

const TOMBSTONE_MARKER: &str = ".dropped-";

/// Where a dropped queue's directory is moved before it is deleted. The
/// name is never valid hex, so discovery cannot mistake it for a queue.
pub fn tombstone_path(dir: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let mut name = dir.file_name().unwrap_or_default().to_os_string();
    name.push(format!("{TOMBSTONE_MARKER}{}-{nanos}", std::process::id()));
    dir.with_file_name(name)
}

pub fn is_tombstone(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.contains(TOMBSTONE_MARKER))
}

#[derive(Debug, Clone, Copy)]
struct FreePage {
    page_id: u64,
    wiped: bool,
}

/// The data file of one queue plus its free-page list.
pub struct SegmentStore {
    dir: PathBuf,
    file: File,
    page_count: u64,
    free: Vec<FreePage>,
}

impl SegmentStore {
    /// Opens (creating if needed) the data file under `dir`. Every page
    /// starts out free; [`SegmentStore::claim_live`] takes back the pages a
    /// recovered table still uses.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(DATA_FILE))?;
        let len = file.metadata()?.len();
        if len % SEGMENT_SIZE as u64 != 0 {
            return Err(Error::Corrupt("data file length is not a multiple of the segment size"));
        }
        let page_count = len / SEGMENT_SIZE as u64;
        let free = (0..page_count)
            .rev()
            .map(|page_id| FreePage {
                page_id,
                wiped: false,
            })
            .collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            page_count,
            free,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Points the store at its directory's new path after a rename. Open
    /// files and mappings are unaffected.
    pub fn relocate(&mut self, dir: PathBuf) {
        self.dir = dir;
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn free_pages(&self) -> Vec<u64> {
        self.free.iter().map(|page| page.page_id).collect()
    }

    pub fn table_path(&self) -> PathBuf {
        self.dir.join(TABLE_FILE)
    }

    pub fn load_table(&self) -> Result<SegmentTable> {
        load_table(&self.table_path())
    }

    pub fn store_table(&self, table: &SegmentTable) -> Result<()> {
        store_table(&self.table_path(), table)
    }

    /// Removes `pages` from the free list and maps them, in order.
    pub fn claim_live(&mut self, pages: &[u64]) -> Result<Vec<Segment>> {
        let mut seen = HashSet::with_capacity(pages.len());
        for page_id in pages {
            if *page_id >= self.page_count {
                return Err(Error::CorruptMetadata("segment table names a missing page"));
            }
            if !seen.insert(*page_id) {
                return Err(Error::CorruptMetadata("segment table lists a page twice"));
            }
        }
        self.free.retain(|page| !seen.contains(&page.page_id));
        pages.iter().map(|page_id| self.map_page(*page_id)).collect()
    }

    pub fn map_page(&self, page_id: u64) -> Result<Segment> {
        let region =
            MappedRegion::map_extent(&self.file, page_id * SEGMENT_SIZE as u64, SEGMENT_SIZE)?;
        Segment::new(region, page_id)
    }

    /// Hands out a wiped segment, reusing a free page when one exists and
    /// growing the data file by one page otherwise.
    pub fn allocate(&mut self) -> Result<Segment> {
        if let Some(page) = self.free.pop() {
            let mut segment = self.map_page(page.page_id)?;
            if !page.wiped {
                segment.fill_with(WIPE_BYTE);
            }
            log::debug!("reuse page {} in {}", page.page_id, self.dir.display());
            return Ok(segment);
        }

        let page_id = self.page_count;
        let new_len = (page_id + 1) * SEGMENT_SIZE as u64;
        self.file.set_len(new_len).map_err(Error::AllocationFailure)?;
        self.page_count += 1;
        let mut segment = self.map_page(page_id)?;
        segment.fill_with(WIPE_BYTE);
        log::debug!("extend {} to page {}", self.dir.display(), page_id);
        Ok(segment)
    }

    /// Wipes a fully consumed segment, flushes it and puts its page on the
    /// free list. The mapping is released when `segment` drops.
    pub fn release(&mut self, mut segment: Segment) -> Result<()> {
        segment.fill_with(WIPE_BYTE);
        segment.force()?;
        self.free.push(FreePage {
            page_id: segment.page_id(),
            wiped: true,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::{SegmentPointer, VirtualPointer};
    use tempfile::tempdir;

    #[test]
    fn table_round_trips_and_detects_corruption() {
        let table = SegmentTable {
            head_index: 12,
            read_checkpoint: Some(12 * SEGMENT_SIZE as u64 + 40),
            pages: vec![3, 0, 7],
        };
        let mut bytes = table.encode();
        assert_eq!(SegmentTable::decode(&bytes).unwrap(), table);

        bytes[10] ^= 0x01;
        assert!(matches!(
            SegmentTable::decode(&bytes),
            Err(Error::CorruptMetadata(_))
        ));
    }

    #[test]
    fn missing_table_loads_empty() {
        let dir = tempdir().unwrap();
        let table = load_table(&dir.path().join(TABLE_FILE)).unwrap();
        assert_eq!(table, SegmentTable::default());
    }

    #[test]
    fn store_table_replaces_previous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        store_table(&path, &SegmentTable { head_index: 1, read_checkpoint: None, pages: vec![0] }).unwrap();
        let second = SegmentTable { head_index: 2, read_checkpoint: None, pages: vec![1, 0] };
        store_table(&path, &second).unwrap();
        assert_eq!(load_table(&path).unwrap(), second);
        assert!(!path.with_extension("meta.tmp").exists());
    }

    #[test]
    fn queue_dir_names_round_trip() {
        for id in ["c1", "sensor/42", "ünïcode-client", ""] {
            let name = queue_dir_name(id);
            assert!(name.bytes().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(parse_queue_dir_name(&name).as_deref(), Some(id));
        }
        assert_eq!(parse_queue_dir_name("abc"), None);
        assert_eq!(parse_queue_dir_name("zz"), None);
        assert_eq!(parse_queue_dir_name("repository.lock"), None);
    }

    #[test]
    fn tombstones_are_never_queue_names() {
        let dir = Path::new("/data").join(queue_dir_name("c1"));
        let tombstone = tombstone_path(&dir);
        assert_eq!(tombstone.parent(), dir.parent());
        assert!(is_tombstone(&tombstone));
        assert!(!is_tombstone(&dir));
        let name = tombstone.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_queue_dir_name(name), None);
    }

    #[test]
    fn allocate_extends_then_reuses_released_pages() {
        let dir = tempdir().unwrap();
        let mut store = SegmentStore::open(dir.path()).unwrap();
        let first = store.allocate().unwrap();
        let second = store.allocate().unwrap();
        assert_eq!((first.page_id(), second.page_id()), (0, 1));
        assert_eq!(store.page_count(), 2);

        store.release(first).unwrap();
        assert_eq!(store.free_pages(), vec![0]);
        let reused = store.allocate().unwrap();
        assert_eq!(reused.page_id(), 0);
        assert_eq!(store.page_count(), 2);
        assert_eq!(store.free_count(), 0);
    }

    #[test]
    fn allocated_segments_are_wiped() {
        let dir = tempdir().unwrap();
        let mut store = SegmentStore::open(dir.path()).unwrap();
        let mut segment = store.allocate().unwrap();
        segment
            .write(SegmentPointer::page_start(0), b"old record")
            .unwrap();
        store.release(segment).unwrap();

        let segment = store.allocate().unwrap();
        let head = segment.read_virtual(VirtualPointer::ZERO, 10).unwrap();
        assert!(head.iter().all(|byte| *byte == WIPE_BYTE));
    }

    #[test]
    fn reopen_treats_unlisted_pages_as_free() {
        let dir = tempdir().unwrap();
        {
            let mut store = SegmentStore::open(dir.path()).unwrap();
            for _ in 0..3 {
                store.allocate().unwrap();
            }
        }
        let mut store = SegmentStore::open(dir.path()).unwrap();
        assert_eq!(store.page_count(), 3);
        let live = store.claim_live(&[2, 0]).unwrap();
        assert_eq!(live.iter().map(Segment::page_id).collect::<Vec<_>>(), vec![2, 0]);
        assert_eq!(store.free_pages(), vec![1]);
        assert!(store.claim_live(&[9]).is_err());
    }
}
