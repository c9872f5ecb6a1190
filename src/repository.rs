//! Registry of per-client queues.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{QueueBackend, RepositoryConfig};
use crate::lock::DirectoryLock;
use crate::queue::{MemoryQueue, QueueHandle, SegmentedQueue, SessionQueue};
use crate::segment_store::{is_tombstone, parse_queue_dir_name, queue_dir_name};
use crate::{Error, Result};

/// One map entry. The slot's own lock serialises creating and dropping the
/// queue for that client, so the map lock is never held across file I/O.
type QueueSlot = Arc<Mutex<Option<QueueHandle>>>;

/// Hands out one queue per client id and keeps it until dropped.
///
/// Creation is atomic: concurrent `get_or_create_queue` calls for the same
/// client receive the same queue.
///
/// Lock order is slot, then map. The map lock is only ever taken briefly.
pub struct QueueRepository {
    config: RepositoryConfig,
    queues: Mutex<HashMap<String, QueueSlot>>,
    _lock: Option<DirectoryLock>,
}

impl QueueRepository {
    /// Opens a repository. For the segmented backend this creates the data
    /// directory, takes its lock, clears leftover tombstones and reopens
    /// every queue stored there.
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        let mut queues = HashMap::new();
        let mut lock = None;
        if let QueueBackend::Segmented { data_dir } = &config.backend {
            std::fs::create_dir_all(data_dir)?;
            if config.lock_data_dir {
                let held = DirectoryLock::acquire(data_dir)?;
                log::debug!("holding {}", held.path().display());
                lock = Some(held);
            }
            purge_tombstones(data_dir)?;
            for (name, dir) in discover_queues(data_dir)? {
                let queue = SegmentedQueue::open(name.clone(), &dir, config.flush_on_enqueue)?;
                let handle: QueueHandle = Arc::new(SessionQueue::Segmented(queue));
                queues.insert(name, Arc::new(Mutex::new(Some(handle))));
            }
            log::info!(
                "queue repository at {} recovered {} queues",
                data_dir.display(),
                queues.len()
            );
        }
        Ok(Self {
            config,
            queues: Mutex::new(queues),
            _lock: lock,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            config: RepositoryConfig::memory(),
            queues: Mutex::new(HashMap::new()),
            _lock: None,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn list_queue_names(&self) -> Result<HashSet<String>> {
        let slots: Vec<(String, QueueSlot)> = self
            .queues()?
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        let mut names = HashSet::with_capacity(slots.len());
        for (name, slot) in slots {
            if lock_slot(&slot)?.is_some() {
                names.insert(name);
            }
        }
        Ok(names)
    }

    pub fn contains_queue(&self, name: &str) -> Result<bool> {
        let slot = self.queues()?.get(name).cloned();
        match slot {
            Some(slot) => Ok(lock_slot(&slot)?.is_some()),
            None => Ok(false),
        }
    }

    pub fn get_or_create_queue(&self, name: &str) -> Result<QueueHandle> {
        if name.is_empty() {
            return Err(Error::EmptyQueueName);
        }
        loop {
            let slot = Arc::clone(self.queues()?.entry(name.to_owned()).or_default());
            let mut entry = lock_slot(&slot)?;
            if let Some(queue) = entry.as_ref() {
                return Ok(Arc::clone(queue));
            }
            // a concurrent drop detached this slot; start over with a fresh one
            if !self.is_attached(name, &slot)? {
                continue;
            }
            match self.open_queue(name) {
                Ok(queue) => {
                    log::debug!("created queue for {name}");
                    *entry = Some(Arc::clone(&queue));
                    return Ok(queue);
                }
                Err(err) => {
                    self.detach(name, &slot)?;
                    return Err(err);
                }
            }
        }
    }

    /// Removes the queue and frees its storage. Outstanding handles fail
    /// with [`Error::QueueDropped`]. Returns false when no such queue
    /// existed. If the storage cannot be retired the queue stays registered
    /// and usable.
    pub fn drop_queue(&self, name: &str) -> Result<bool> {
        let Some(slot) = self.queues()?.get(name).cloned() else {
            return Ok(false);
        };
        let mut entry = lock_slot(&slot)?;
        let Some(queue) = entry.as_ref() else {
            return Ok(false);
        };
        queue.release()?;
        *entry = None;
        self.detach(name, &slot)?;
        log::debug!("dropped queue for {name}");
        Ok(true)
    }

    /// Checkpoints every queue. Stops at the first failure.
    pub fn force_all(&self) -> Result<()> {
        let slots: Vec<QueueSlot> = self.queues()?.values().cloned().collect();
        for slot in slots {
            let queue = lock_slot(&slot)?.clone();
            if let Some(queue) = queue {
                queue.force()?;
            }
        }
        Ok(())
    }

    fn open_queue(&self, name: &str) -> Result<QueueHandle> {
        let queue = match &self.config.backend {
            QueueBackend::Memory => SessionQueue::Memory(MemoryQueue::new(name)),
            QueueBackend::Segmented { data_dir } => SessionQueue::Segmented(SegmentedQueue::open(
                name,
                &data_dir.join(queue_dir_name(name)),
                self.config.flush_on_enqueue,
            )?),
        };
        Ok(Arc::new(queue))
    }

    fn is_attached(&self, name: &str, slot: &QueueSlot) -> Result<bool> {
        Ok(self
            .queues()?
            .get(name)
            .map_or(false, |current| Arc::ptr_eq(current, slot)))
    }

    /// Removes `slot` from the map unless it was already replaced.
    fn detach(&self, name: &str, slot: &QueueSlot) -> Result<()> {
        let mut queues = self.queues()?;
        if queues
            .get(name)
            .map_or(false, |current| Arc::ptr_eq(current, slot))
        {
            queues.remove(name);
        }
        Ok(())
    }

    fn queues(&self) -> Result<MutexGuard<'_, HashMap<String, QueueSlot>>> {
        self.queues.lock().map_err(|_| Error::LockPoisoned)
    }
}

fn lock_slot(slot: &QueueSlot) -> Result<MutexGuard<'_, Option<QueueHandle>>> {
    slot.lock().map_err(|_| Error::LockPoisoned)
}

/// Queue directories under `data_dir`, keyed by client id.
pub fn discover_queues(data_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() || is_tombstone(&entry.path()) {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name
            .to_str()
            .and_then(parse_queue_dir_name)
            .filter(|name| !name.is_empty())
        else {
            log::warn!("skipping unrecognised entry {}", entry.path().display());
            continue;
        };
        found.push((name, entry.path()));
    }
    found.sort();
    Ok(found)
}

/// Deletes directories of dropped queues whose removal did not finish.
fn purge_tombstones(data_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.is_dir() && is_tombstone(&path) {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => log::info!("removed leftover {}", path.display()),
                Err(err) => log::warn!("cannot remove {}: {err}", path.display()),
            }
        }
    }
    Ok(())
}
