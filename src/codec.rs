//! Binary encoding of queue entries.
//!
//! ```text
//! marker:     [tag=0x00]
//! published:  [tag=0x01][qos: u8][topic_len: u16][topic: utf-8][payload_len: u32][payload]
//! ```
//!
//! Integers are big-endian.

use std::fmt;

use crate::{Error, Result};

pub const TAG_PUB_REL_MARKER: u8 = 0x00;
pub const TAG_PUBLISHED_MESSAGE: u8 = 0x01;

const PUBLISHED_FIXED_LEN: usize = 1 + 1 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Qos {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Qos {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(Error::InvalidQos(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: Qos,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    pub fn new(topic: impl Into<String>, qos: Qos, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: payload.into(),
        }
    }
}

/// One entry of a session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Published(PublishedMessage),
    /// Position of a QoS 2 release in the stream; carries no content.
    PubRelMarker,
}

impl Record {
    pub fn tag(&self) -> u8 {
        match self {
            Record::Published(_) => TAG_PUBLISHED_MESSAGE,
            Record::PubRelMarker => TAG_PUB_REL_MARKER,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Record::Published(msg) => PUBLISHED_FIXED_LEN + msg.topic.len() + msg.payload.len(),
            Record::PubRelMarker => 1,
        }
    }
}

impl From<PublishedMessage> for Record {
    fn from(msg: PublishedMessage) -> Self {
        Record::Published(msg)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Published(msg) => write!(
                f,
                "publish topic={} qos={} payload={}B",
                msg.topic,
                msg.qos.as_u8(),
                msg.payload.len()
            ),
            Record::PubRelMarker => f.write_str("pubrel-marker"),
        }
    }
}

pub fn encode(record: &Record) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(record.encoded_len());
    encode_into(record, &mut buf)?;
    Ok(buf)
}

/// Appends the encoding of `record` to `buf`. On error `buf` is left as it
/// was.
pub fn encode_into(record: &Record, buf: &mut Vec<u8>) -> Result<()> {
    match record {
        Record::PubRelMarker => buf.push(TAG_PUB_REL_MARKER),
        Record::Published(msg) => {
            let topic_len = u16::try_from(msg.topic.len())
                .map_err(|_| Error::TopicTooLong(msg.topic.len()))?;
            let payload_len = u32::try_from(msg.payload.len())
                .map_err(|_| Error::RecordTooLarge(msg.payload.len()))?;
            buf.reserve(record.encoded_len());
            buf.push(TAG_PUBLISHED_MESSAGE);
            buf.push(msg.qos.as_u8());
            buf.extend_from_slice(&topic_len.to_be_bytes());
            buf.extend_from_slice(msg.topic.as_bytes());
            buf.extend_from_slice(&payload_len.to_be_bytes());
            buf.extend_from_slice(&msg.payload);
        }
    }
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<Record> {
    let mut input = Input { bytes, pos: 0 };
    let record = match input.u8()? {
        TAG_PUB_REL_MARKER => Record::PubRelMarker,
        TAG_PUBLISHED_MESSAGE => {
            let qos = Qos::try_from(input.u8()?)?;
            let topic_len = u16::from_be_bytes(input.array()?) as usize;
            let topic = std::str::from_utf8(input.take(topic_len)?)
                .map_err(|_| Error::InvalidTopic)?
                .to_owned();
            let payload_len = u32::from_be_bytes(input.array()?) as usize;
            let payload = input.take(payload_len)?.to_vec();
            Record::Published(PublishedMessage {
                topic,
                qos,
                payload,
            })
        }
        other => return Err(Error::UnrecognizedRecordType(other)),
    };
    if input.pos != bytes.len() {
        return Err(Error::TrailingBytes(bytes.len() - input.pos));
    }
    Ok(record)
}

struct Input<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let available = self.bytes.len() - self.pos;
        if len > available {
            return Err(Error::BufferUnderflow {
                requested: len,
                available,
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("slice length"))
    }
}
