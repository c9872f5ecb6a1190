//! Append-only record stream over a chain of segments.
//!
//! # Layout
//!
//! Records are framed as `[u32 big-endian length][record bytes]` and a frame
//! never crosses a segment boundary. When a frame does not fit in what is
//! left of the tail segment, the write cursor jumps to the next segment and
//! the leftover bytes stay wiped:
//!
//! ```text
//! virtual:  | segment k                         | segment k+1          |
//!           | len|rec | len|rec | 0xFF 0xFF ... | len|rec | len|rec |  |
//!                ^read                                            ^write
//! ```
//!
//! Segments entirely behind the read cursor are wiped and returned to the
//! store's free list.
//!
//! # Recovery
//!
//! The read cursor is not persisted on every read. On open, reading resumes
//! from the last checkpoint written by [`QueueLog::force`], or from the start
//! of the first live segment. The write cursor is recovered by walking frame
//! headers until the first unwritten header of the last segment.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};

use crate::pointer::{VirtualPointer, SEGMENT_SIZE};
use crate::segment::{Segment, WIPE_BYTE};
use crate::segment_store::{is_tombstone, tombstone_path, SegmentStore, SegmentTable};
use crate::{Error, Result};

pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest record a single frame can carry.
pub const MAX_RECORD_LEN: usize = SEGMENT_SIZE - FRAME_HEADER_SIZE;

const UNWRITTEN_HEADER: u32 = 0;
const WIPED_HEADER: u32 = u32::from_be_bytes([WIPE_BYTE; 4]);

/// Point-in-time view of a queue log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub segments: usize,
    pub free_segments: usize,
    pub read_cursor: VirtualPointer,
    pub write_cursor: VirtualPointer,
    pub unread_bytes: u64,
}

enum Frame {
    Record { body: Vec<u8>, next: VirtualPointer },
    /// Unused tail of a segment the writer rolled away from.
    Skip { next: VirtualPointer },
    Damaged { next: VirtualPointer, error: Error },
    End,
}

pub struct QueueLog {
    store: SegmentStore,
    segments: VecDeque<Segment>,
    /// Virtual segment index backed by `segments[0]`.
    head_index: u64,
    read: VirtualPointer,
    write: VirtualPointer,
    checkpoint: Option<u64>,
}

impl QueueLog {
    /// Opens the log stored under `dir`, recovering cursors from whatever
    /// is on disk. An empty or missing directory yields an empty log.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let mut store = SegmentStore::open(dir.as_ref())?;
        let table = store.load_table()?;
        let segments = store.claim_live(&table.pages)?;
        let start = VirtualPointer::segment_begin(table.head_index);
        let mut log = Self {
            store,
            segments: segments.into(),
            head_index: table.head_index,
            read: start,
            write: start,
            checkpoint: table.read_checkpoint,
        };
        log.write = log.recover_write_cursor()?;

        if let Some(checkpoint) = table.read_checkpoint.map(VirtualPointer::new) {
            if checkpoint >= log.read && checkpoint <= log.write {
                log.read = checkpoint;
            } else {
                log::warn!(
                    "ignoring read checkpoint {checkpoint} outside [{}, {}] in {}",
                    log.read,
                    log.write,
                    log.store.dir().display()
                );
            }
        }

        log::info!(
            "opened queue log {}: {} segments, {} free, {} unread bytes",
            log.store.dir().display(),
            log.segments.len(),
            log.store.free_count(),
            log.write.bytes_since(log.read)
        );
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn read_cursor(&self) -> VirtualPointer {
        self.read
    }

    pub fn write_cursor(&self) -> VirtualPointer {
        self.write
    }

    pub fn is_empty(&self) -> bool {
        self.read >= self.write
    }

    /// Page ids of the live segments, in virtual order.
    pub fn pages(&self) -> Vec<u64> {
        self.segments.iter().map(Segment::page_id).collect()
    }

    pub fn head_index(&self) -> u64 {
        self.head_index
    }

    /// Read position saved by the last [`QueueLog::force`].
    pub fn checkpoint(&self) -> Option<VirtualPointer> {
        self.checkpoint.map(VirtualPointer::new)
    }

    pub fn free_pages(&self) -> Vec<u64> {
        self.store.free_pages()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            segments: self.segments.len(),
            free_segments: self.store.free_count(),
            read_cursor: self.read,
            write_cursor: self.write,
            unread_bytes: self.write.bytes_since(self.read),
        }
    }

    /// Appends one framed record and returns the pointer of its frame.
    ///
    /// Rolls to a fresh segment when the tail segment cannot hold the whole
    /// frame.
    pub fn append(&mut self, record: &[u8]) -> Result<VirtualPointer> {
        if record.is_empty() {
            return Err(Error::Corrupt("empty record"));
        }
        if record.len() > MAX_RECORD_LEN {
            return Err(Error::RecordTooLarge(record.len()));
        }
        let frame_len = FRAME_HEADER_SIZE + record.len();

        // self.write only moves once the frame is fully in place
        let mut at = self.write;
        let needs_roll = self
            .segment_for(at)
            .map(|segment| !segment.has_space(at, frame_len))
            .unwrap_or(false);
        if needs_roll {
            log::debug!(
                "roll {} at {}: {} byte frame does not fit",
                self.store.dir().display(),
                at,
                frame_len
            );
            at = at.next_segment_begin();
        }
        if self.segment_for(at).is_none() {
            self.grow(at.segment_index())?;
        }

        let segment = self
            .segment_for_mut(at)
            .ok_or(Error::Corrupt("write cursor outside segment chain"))?;
        segment.write_virtual(at.plus(FRAME_HEADER_SIZE as u64), record)?;
        // body before header: a reader never sees a header without its body
        fence(Ordering::Release);
        segment.write_virtual(at, &(record.len() as u32).to_be_bytes())?;
        self.write = at.plus(frame_len as u64);
        Ok(at)
    }

    /// Reads the record at the read cursor and advances past it.
    ///
    /// A damaged frame is skipped and its error returned; the following call
    /// continues with the next readable frame.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.frame_at(self.read)? {
                Frame::End => return Ok(None),
                Frame::Skip { next } => self.advance_read(next)?,
                Frame::Record { body, next } => {
                    self.advance_read(next)?;
                    return Ok(Some(body));
                }
                Frame::Damaged { next, error } => {
                    log::warn!(
                        "skipping damaged frame at {} in {}: {error}",
                        self.read,
                        self.store.dir().display()
                    );
                    self.advance_read(next)?;
                    return Err(error);
                }
            }
        }
    }

    /// Reads the record at `cursor` and the cursor just past it, leaving the
    /// log's own read cursor alone.
    pub fn read_at(&self, mut cursor: VirtualPointer) -> Result<Option<(Vec<u8>, VirtualPointer)>> {
        loop {
            match self.frame_at(cursor)? {
                Frame::End => return Ok(None),
                Frame::Skip { next } => cursor = next,
                Frame::Record { body, next } => return Ok(Some((body, next))),
                Frame::Damaged { error, .. } => return Err(error),
            }
        }
    }

    /// Iterates unread records without moving the read cursor.
    pub fn records(&self) -> Records<'_> {
        Records {
            log: self,
            cursor: self.read,
        }
    }

    /// Wipes and frees every segment that lies entirely before `upto`.
    /// Never reaches past the read cursor. Returns the number of segments
    /// released.
    pub fn reclaim(&mut self, upto: VirtualPointer) -> Result<usize> {
        let upto = upto.min(self.read);
        let mut released = 0;
        while self.head_index < upto.segment_index() {
            let Some(segment) = self.segments.pop_front() else {
                self.head_index = upto.segment_index();
                break;
            };
            self.head_index += 1;
            log::debug!("reclaim {segment} from {}", self.store.dir().display());
            self.store.release(segment)?;
            released += 1;
        }
        if released > 0 {
            self.persist_table()?;
        }
        Ok(released)
    }

    /// Flushes the segment holding the most recent write.
    pub fn sync_tail(&self) -> Result<()> {
        let last_written = VirtualPointer::new(self.write.value().saturating_sub(1));
        match self.segment_for(last_written) {
            Some(segment) => segment.force(),
            None => Ok(()),
        }
    }

    /// Durability checkpoint: flushes every live segment, then records the
    /// read cursor so a restart resumes from here.
    pub fn force(&mut self) -> Result<()> {
        for segment in &self.segments {
            segment.force()?;
        }
        self.checkpoint = Some(self.read.value());
        self.persist_table()
    }

    /// Renames the log's directory to a tombstone that queue discovery
    /// ignores. The log keeps working from the new location. On error the
    /// directory is left where it was.
    pub fn entomb(&mut self) -> Result<()> {
        if is_tombstone(self.store.dir()) {
            return Ok(());
        }
        let tombstone = tombstone_path(self.store.dir());
        std::fs::rename(self.store.dir(), &tombstone)?;
        log::debug!(
            "moved queue log {} to {}",
            self.store.dir().display(),
            tombstone.display()
        );
        self.store.relocate(tombstone);
        Ok(())
    }

    /// Releases every mapping and deletes the log's directory. The directory
    /// is entombed first, so a failed delete never resurrects the log.
    pub fn destroy(mut self) -> Result<()> {
        self.entomb()?;
        let dir = self.store.dir().to_path_buf();
        drop(self);
        std::fs::remove_dir_all(&dir)?;
        log::debug!("removed queue log {}", dir.display());
        Ok(())
    }

    fn advance_read(&mut self, next: VirtualPointer) -> Result<()> {
        self.read = next;
        self.reclaim(next)?;
        Ok(())
    }

    /// Appends a fresh segment as virtual segment `index`, which must
    /// directly follow the chain.
    fn grow(&mut self, index: u64) -> Result<()> {
        let head_index = if self.segments.is_empty() {
            index
        } else {
            self.head_index
        };
        if head_index + self.segments.len() as u64 != index {
            return Err(Error::Corrupt("write cursor outside segment chain"));
        }
        let segment = self.store.allocate()?;
        log::debug!(
            "allocated {segment} as segment {index} of {}",
            self.store.dir().display()
        );
        self.head_index = head_index;
        self.segments.push_back(segment);
        self.persist_table()
    }

    fn persist_table(&self) -> Result<()> {
        self.store.store_table(&SegmentTable {
            head_index: self.head_index,
            read_checkpoint: self.checkpoint,
            pages: self.pages(),
        })
    }

    fn segment_for(&self, at: VirtualPointer) -> Option<&Segment> {
        let index = at.segment_index().checked_sub(self.head_index)?;
        self.segments.get(index as usize)
    }

    fn segment_for_mut(&mut self, at: VirtualPointer) -> Option<&mut Segment> {
        let index = at.segment_index().checked_sub(self.head_index)?;
        self.segments.get_mut(index as usize)
    }

    fn frame_at(&self, cursor: VirtualPointer) -> Result<Frame> {
        if cursor >= self.write {
            return Ok(Frame::End);
        }
        let segment = self
            .segment_for(cursor)
            .ok_or(Error::Corrupt("read cursor outside segment chain"))?;
        let in_tail = cursor.segment_index() == self.write.segment_index();
        // where a reader resumes when this frame cannot be trusted
        let resume = if in_tail {
            self.write
        } else {
            cursor.next_segment_begin()
        };

        let remaining = segment.remaining(cursor)?;
        if remaining < FRAME_HEADER_SIZE {
            if in_tail {
                return Ok(Frame::Damaged {
                    next: resume,
                    error: Error::BufferUnderflow {
                        requested: FRAME_HEADER_SIZE,
                        available: remaining,
                    },
                });
            }
            return Ok(Frame::Skip { next: resume });
        }

        let header = segment.read_header(cursor)?;
        if header == UNWRITTEN_HEADER || header == WIPED_HEADER {
            if in_tail {
                return Ok(Frame::Damaged {
                    next: resume,
                    error: Error::UnwrittenFrame,
                });
            }
            return Ok(Frame::Skip { next: resume });
        }

        fence(Ordering::Acquire);
        let len = header as usize;
        let body_at = cursor.plus(FRAME_HEADER_SIZE as u64);
        let available = (remaining - FRAME_HEADER_SIZE)
            .min(self.write.bytes_since(body_at) as usize);
        if len > available {
            return Ok(Frame::Damaged {
                next: resume,
                error: Error::BufferUnderflow {
                    requested: len,
                    available,
                },
            });
        }
        let body = segment.read_virtual(body_at, len)?;
        Ok(Frame::Record {
            body,
            next: body_at.plus(len as u64),
        })
    }

    fn recover_write_cursor(&self) -> Result<VirtualPointer> {
        let end_index = self.head_index + self.segments.len() as u64;
        let mut cursor = VirtualPointer::segment_begin(self.head_index);
        while cursor.segment_index() < end_index {
            let segment = &self.segments[(cursor.segment_index() - self.head_index) as usize];
            let remaining = segment.remaining(cursor)?;
            if remaining >= FRAME_HEADER_SIZE {
                let header = segment.read_header(cursor)?;
                let fits = header as usize <= remaining - FRAME_HEADER_SIZE;
                if header != UNWRITTEN_HEADER && header != WIPED_HEADER && fits {
                    cursor = cursor.plus((FRAME_HEADER_SIZE + header as usize) as u64);
                    continue;
                }
            }
            if cursor.segment_index() + 1 == end_index {
                return Ok(cursor);
            }
            cursor = cursor.next_segment_begin();
        }
        Ok(cursor)
    }
}

/// Non-consuming iterator over unread records, see [`QueueLog::records`].
pub struct Records<'a> {
    log: &'a QueueLog,
    cursor: VirtualPointer,
}

impl Iterator for Records<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.log.frame_at(self.cursor) {
                Err(err) => {
                    self.cursor = self.log.write;
                    return Some(Err(err));
                }
                Ok(Frame::End) => return None,
                Ok(Frame::Skip { next }) => self.cursor = next,
                Ok(Frame::Record { body, next }) => {
                    self.cursor = next;
                    return Some(Ok(body));
                }
                Ok(Frame::Damaged { next, error }) => {
                    self.cursor = next;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn big_record(fill: u8) -> Vec<u8> {
        vec![fill; SEGMENT_SIZE / 2]
    }

    #[test]
    fn append_then_read_in_order() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        assert!(log.is_empty());

        let first = log.append(b"one").unwrap();
        let second = log.append(b"two").unwrap();
        assert_eq!(first, VirtualPointer::ZERO);
        assert_eq!(second.value(), (FRAME_HEADER_SIZE + 3) as u64);

        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(log.read_next().unwrap(), None);
        assert!(log.is_empty());
    }

    #[test]
    fn oversized_and_empty_records_are_rejected() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        let too_big = vec![0u8; MAX_RECORD_LEN + 1];
        assert!(matches!(log.append(&too_big), Err(Error::RecordTooLarge(_))));
        assert!(log.append(&[]).is_err());
        assert!(log.is_empty());
    }

    #[test]
    fn record_filling_a_whole_segment_fits() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        let record = vec![7u8; MAX_RECORD_LEN];
        log.append(&record).unwrap();
        assert_eq!(log.write_cursor(), VirtualPointer::segment_begin(1));
        log.append(b"next").unwrap();
        assert_eq!(log.stats().segments, 2);

        assert_eq!(log.read_next().unwrap().unwrap(), record);
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"next"[..]));
    }

    #[test]
    fn frame_that_does_not_fit_rolls_without_splitting() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        log.append(&big_record(1)).unwrap();
        let at = log.append(&big_record(2)).unwrap();
        assert_eq!(at, VirtualPointer::segment_begin(1));
        assert_eq!(log.pages(), vec![0, 1]);

        assert_eq!(log.read_next().unwrap().unwrap(), big_record(1));
        assert_eq!(log.read_next().unwrap().unwrap(), big_record(2));
        assert_eq!(log.read_next().unwrap(), None);
    }

    #[test]
    fn drained_segments_are_recycled() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        for fill in 0..3 {
            log.append(&big_record(fill)).unwrap();
        }
        assert_eq!(log.pages(), vec![0, 1, 2]);
        for _ in 0..2 {
            log.read_next().unwrap().unwrap();
        }
        // second record sat in segment 1, so segment 0 is behind the cursor
        assert_eq!(log.pages(), vec![1, 2]);
        assert_eq!(log.free_pages(), vec![0]);

        log.append(&big_record(9)).unwrap();
        assert_eq!(log.pages(), vec![1, 2, 0]);
        log.read_next().unwrap().unwrap();
        assert_eq!(log.read_next().unwrap().unwrap(), big_record(9));
    }

    #[test]
    fn reclaim_stops_at_read_cursor() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        log.append(&big_record(1)).unwrap();
        log.append(&big_record(2)).unwrap();
        let released = log.reclaim(log.write_cursor()).unwrap();
        assert_eq!(released, 0);
        assert_eq!(log.pages(), vec![0, 1]);
    }

    #[test]
    fn read_at_walks_across_the_rolled_tail() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        log.append(&big_record(1)).unwrap();
        log.append(&big_record(2)).unwrap();

        let (first, next) = log.read_at(VirtualPointer::ZERO).unwrap().unwrap();
        assert_eq!(first, big_record(1));
        let (second, end) = log.read_at(next).unwrap().unwrap();
        assert_eq!(second, big_record(2));
        assert_eq!(end, log.write_cursor());
        assert!(log.read_at(end).unwrap().is_none());
        assert_eq!(log.read_cursor(), VirtualPointer::ZERO);
    }

    #[test]
    fn records_does_not_consume() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        log.append(b"a").unwrap();
        log.append(b"b").unwrap();
        let seen: Vec<Vec<u8>> = log.records().collect::<Result<_>>().unwrap();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"a"[..]));
    }

    #[test]
    fn damaged_header_is_skipped_with_error() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        log.append(&big_record(1)).unwrap();
        log.append(&big_record(2)).unwrap();
        log.append(b"survivor").unwrap();
        // claim more bytes than segment 0 holds
        log.segments[0]
            .write_virtual(VirtualPointer::ZERO, &(SEGMENT_SIZE as u32).to_be_bytes())
            .unwrap();

        let err = log.read_next().unwrap_err();
        assert!(matches!(err, Error::BufferUnderflow { .. }));
        assert!(err.is_recoverable());
        assert_eq!(log.read_next().unwrap().unwrap(), big_record(2));
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"survivor"[..]));
    }

    #[test]
    fn unwritten_header_in_tail_skips_to_write_cursor() {
        let dir = tempdir().unwrap();
        let mut log = QueueLog::open(dir.path()).unwrap();
        log.append(b"lost").unwrap();
        log.append(b"also lost").unwrap();
        log.segments[0]
            .write_virtual(VirtualPointer::ZERO, &UNWRITTEN_HEADER.to_be_bytes())
            .unwrap();

        let err = log.read_next().unwrap_err();
        assert!(matches!(err, Error::UnwrittenFrame));
        assert!(err.is_recoverable());
        assert!(log.is_empty());
        assert_eq!(log.read_next().unwrap(), None);

        log.append(b"after").unwrap();
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"after"[..]));
    }

    #[test]
    fn entombed_log_keeps_working_until_destroyed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue");
        let mut log = QueueLog::open(&path).unwrap();
        log.append(b"kept").unwrap();
        log.entomb().unwrap();
        assert!(!path.exists());
        assert!(log.dir().exists());
        assert!(is_tombstone(log.dir()));

        log.append(b"more").unwrap();
        log.force().unwrap();
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"kept"[..]));
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"more"[..]));

        let tombstone = log.dir().to_path_buf();
        log.destroy().unwrap();
        assert!(!tombstone.exists());
    }

    #[test]
    fn reopen_recovers_write_cursor() {
        let dir = tempdir().unwrap();
        let write_cursor = {
            let mut log = QueueLog::open(dir.path()).unwrap();
            log.append(&big_record(1)).unwrap();
            log.append(&big_record(2)).unwrap();
            log.append(b"tail").unwrap();
            log.force().unwrap();
            log.write_cursor()
        };
        let mut log = QueueLog::open(dir.path()).unwrap();
        assert_eq!(log.write_cursor(), write_cursor);
        assert_eq!(log.read_next().unwrap().unwrap(), big_record(1));
        assert_eq!(log.read_next().unwrap().unwrap(), big_record(2));
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"tail"[..]));
    }

    #[test]
    fn checkpoint_resumes_reading() {
        let dir = tempdir().unwrap();
        {
            let mut log = QueueLog::open(dir.path()).unwrap();
            for record in [&b"r1"[..], b"r2", b"r3"] {
                log.append(record).unwrap();
            }
            log.read_next().unwrap();
            log.force().unwrap();
            // consumed after the checkpoint, replayed after restart
            log.read_next().unwrap();
        }
        let mut log = QueueLog::open(dir.path()).unwrap();
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"r2"[..]));
        assert_eq!(log.read_next().unwrap().as_deref(), Some(&b"r3"[..]));
        assert_eq!(log.read_next().unwrap(), None);
    }

    #[test]
    fn destroy_removes_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue");
        let mut log = QueueLog::open(&path).unwrap();
        log.append(b"gone").unwrap();
        log.destroy().unwrap();
        assert!(!path.exists());
    }
}
