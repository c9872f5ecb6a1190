//! Per-client FIFO queues.
//!
//! [`SessionQueue`] is the contract the session layer programs against. Both
//! variants serialise their operations behind one lock per queue, so queues
//! never contend with each other.
//!
//! Segmented queue operations may map, grow or flush files; callers on a
//! latency-sensitive path should run them on a blocking-friendly thread.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::codec::{self, Record};
use crate::log::{QueueLog, QueueStats};
use crate::{Error, Result};

pub type QueueHandle = Arc<SessionQueue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Memory,
    Segmented,
}

pub enum SessionQueue {
    Memory(MemoryQueue),
    Segmented(SegmentedQueue),
}

impl SessionQueue {
    pub fn name(&self) -> &str {
        match self {
            SessionQueue::Memory(queue) => &queue.name,
            SessionQueue::Segmented(queue) => &queue.name,
        }
    }

    pub fn kind(&self) -> QueueKind {
        match self {
            SessionQueue::Memory(_) => QueueKind::Memory,
            SessionQueue::Segmented(_) => QueueKind::Segmented,
        }
    }

    pub fn enqueue(&self, record: Record) -> Result<()> {
        match self {
            SessionQueue::Memory(queue) => queue.enqueue(record),
            SessionQueue::Segmented(queue) => queue.enqueue(&record),
        }
    }

    pub fn dequeue(&self) -> Result<Option<Record>> {
        match self {
            SessionQueue::Memory(queue) => queue.dequeue(),
            SessionQueue::Segmented(queue) => queue.dequeue(),
        }
    }

    /// True when nothing is left to dequeue. A dropped queue is empty.
    pub fn is_empty(&self) -> bool {
        match self {
            SessionQueue::Memory(queue) => queue.is_empty(),
            SessionQueue::Segmented(queue) => queue.is_empty(),
        }
    }

    /// Durability checkpoint. A no-op for in-memory queues.
    pub fn force(&self) -> Result<()> {
        match self {
            SessionQueue::Memory(queue) => queue.with_entries(|_| Ok(())),
            SessionQueue::Segmented(queue) => queue.force(),
        }
    }

    /// Up to `limit` unread records, oldest first, without consuming them.
    pub fn peek(&self, limit: usize) -> Result<Vec<Result<Record>>> {
        match self {
            SessionQueue::Memory(queue) => queue.peek(limit),
            SessionQueue::Segmented(queue) => queue.peek(limit),
        }
    }

    /// Encoded size of everything not yet dequeued.
    pub fn unread_bytes(&self) -> Result<u64> {
        match self {
            SessionQueue::Memory(queue) => queue.with_entries(|entries| {
                Ok(entries.iter().map(|record| record.encoded_len() as u64).sum())
            }),
            SessionQueue::Segmented(queue) => Ok(queue.stats()?.unread_bytes),
        }
    }

    /// Releases the queue's storage. Every handle to it then fails with
    /// [`Error::QueueDropped`].
    pub(crate) fn release(&self) -> Result<()> {
        match self {
            SessionQueue::Memory(queue) => queue.release(),
            SessionQueue::Segmented(queue) => queue.destroy(),
        }
    }
}

pub struct MemoryQueue {
    name: String,
    entries: Mutex<Option<VecDeque<Record>>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(Some(VecDeque::new())),
        }
    }

    pub fn enqueue(&self, record: Record) -> Result<()> {
        self.with_entries(|entries| {
            entries.push_back(record);
            Ok(())
        })
    }

    pub fn dequeue(&self) -> Result<Option<Record>> {
        self.with_entries(|entries| Ok(entries.pop_front()))
    }

    pub fn is_empty(&self) -> bool {
        self.with_entries(|entries| Ok(entries.is_empty()))
            .unwrap_or(true)
    }

    pub fn peek(&self, limit: usize) -> Result<Vec<Result<Record>>> {
        self.with_entries(|entries| Ok(entries.iter().take(limit).cloned().map(Ok).collect()))
    }

    fn release(&self) -> Result<()> {
        let mut guard = self.entries.lock().map_err(|_| Error::LockPoisoned)?;
        guard.take();
        Ok(())
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut VecDeque<Record>) -> Result<T>) -> Result<T> {
        let mut guard = self.entries.lock().map_err(|_| Error::LockPoisoned)?;
        let entries = guard.as_mut().ok_or(Error::QueueDropped)?;
        f(entries)
    }
}

pub struct SegmentedQueue {
    name: String,
    log: Mutex<Option<QueueLog>>,
    flush_on_enqueue: bool,
}

impl SegmentedQueue {
    pub fn open(name: impl Into<String>, dir: &Path, flush_on_enqueue: bool) -> Result<Self> {
        let log = QueueLog::open(dir)?;
        Ok(Self {
            name: name.into(),
            log: Mutex::new(Some(log)),
            flush_on_enqueue,
        })
    }

    pub fn enqueue(&self, record: &Record) -> Result<()> {
        let bytes = codec::encode(record)?;
        self.with_log(|log| {
            log.append(&bytes)?;
            if self.flush_on_enqueue {
                log.sync_tail()?;
            }
            Ok(())
        })
    }

    /// Pops the oldest record. A record that fails to decode has already
    /// been consumed; its error is returned and the next call moves on.
    pub fn dequeue(&self) -> Result<Option<Record>> {
        self.with_log(|log| match log.read_next()? {
            None => Ok(None),
            Some(bytes) => codec::decode(&bytes).map(Some).map_err(|err| {
                log::warn!("dropping undecodable record from queue {}: {err}", self.name);
                err
            }),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.with_log(|log| Ok(log.is_empty())).unwrap_or(true)
    }

    pub fn force(&self) -> Result<()> {
        self.with_log(QueueLog::force)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.with_log(|log| Ok(log.stats()))
    }

    pub fn peek(&self, limit: usize) -> Result<Vec<Result<Record>>> {
        self.with_log(|log| {
            Ok(log
                .records()
                .take(limit)
                .map(|bytes| bytes.and_then(|bytes| codec::decode(&bytes)))
                .collect())
        })
    }

    /// Entombs the log's directory, then deletes it. If the directory
    /// cannot be moved aside the queue stays open and the error is
    /// returned; a failed delete after that only leaves a tombstone behind.
    fn destroy(&self) -> Result<()> {
        let mut guard = self.log.lock().map_err(|_| Error::LockPoisoned)?;
        let Some(live) = guard.as_mut() else {
            return Ok(());
        };
        live.entomb()?;
        if let Some(retired) = guard.take() {
            let dir = retired.dir().to_path_buf();
            if let Err(err) = retired.destroy() {
                log::warn!("queue {} dropped but {} remains: {err}", self.name, dir.display());
            }
        }
        Ok(())
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut QueueLog) -> Result<T>) -> Result<T> {
        let mut guard = self.log.lock().map_err(|_| Error::LockPoisoned)?;
        let log = guard.as_mut().ok_or(Error::QueueDropped)?;
        f(log)
    }
}
