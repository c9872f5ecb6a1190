use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pointer out of range: offset {offset} outside segment")]
    OutOfRange { offset: i64 },
    #[error("pointers on different pages: {left} vs {right}")]
    PageMismatch { left: u64, right: u64 },
    #[error("capacity exceeded: {requested} bytes requested, {available} available")]
    CapacityExceeded { requested: usize, available: usize },
    #[error("buffer underflow: {requested} bytes requested, {available} available")]
    BufferUnderflow { requested: usize, available: usize },
    #[error("unrecognized record type: {0:#04x}")]
    UnrecognizedRecordType(u8),
    #[error("segment allocation failed: {0}")]
    AllocationFailure(std::io::Error),
    #[error("record of {0} bytes does not fit in a segment")]
    RecordTooLarge(usize),
    #[error("invalid qos level: {0}")]
    InvalidQos(u8),
    #[error("topic is not valid utf-8")]
    InvalidTopic,
    #[error("topic of {0} bytes exceeds the length prefix")]
    TopicTooLong(usize),
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("unwritten frame header inside the written range")]
    UnwrittenFrame,
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("queue lock poisoned")]
    LockPoisoned,
    #[error("data directory locked by another process")]
    DirectoryLocked,
    #[error("queue has been dropped")]
    QueueDropped,
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Errors after which the reader has already moved past the damaged
    /// frame, so the next read continues with later records.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::BufferUnderflow { .. }
                | Error::UnrecognizedRecordType(_)
                | Error::InvalidQos(_)
                | Error::InvalidTopic
                | Error::TrailingBytes(_)
                | Error::UnwrittenFrame
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
