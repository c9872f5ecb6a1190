//! Durable per-client session queues for a publish/subscribe broker.
//!
//! Each client gets a FIFO of [`Record`]s. The segmented backend stores them
//! in fixed-size memory-mapped segments carved from one data file per queue;
//! segments the reader has moved past are wiped and reused. The memory
//! backend keeps everything in process.

pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod log;
pub mod mmap;
pub mod pointer;
pub mod queue;
pub mod repository;
pub mod segment;
pub mod segment_store;

pub use codec::{decode, encode, PublishedMessage, Qos, Record};
pub use config::{QueueBackend, RepositoryConfig};
pub use error::{Error, Result};
pub use log::{QueueLog, QueueStats};
pub use pointer::{SegmentPointer, VirtualPointer, SEGMENT_SIZE};
pub use queue::{MemoryQueue, QueueHandle, QueueKind, SegmentedQueue, SessionQueue};
pub use repository::QueueRepository;
pub use segment::Segment;
