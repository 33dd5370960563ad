//! Core data model: partitions, streams, offsets, envelopes

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// One shard of an input stream. Opaque beyond identity and ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Partition(pub u32);

impl Display for Partition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical stream within a named messaging system
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SystemStream {
    pub system: String,
    pub stream: String,
}

impl SystemStream {
    pub fn new(system: &str, stream: &str) -> Self {
        Self {
            system: system.to_string(),
            stream: stream.to_string(),
        }
    }

    /// Parse a `system.stream` identifier. The first dot splits; stream
    /// names may themselves contain dots.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        match spec.split_once('.') {
            Some((system, stream)) if !system.is_empty() && !stream.is_empty() => {
                Ok(Self::new(system, stream))
            }
            _ => Err(ConfigError::invalid(
                spec,
                "expected a 'system.stream' identifier",
            )),
        }
    }

    pub fn partition(&self, partition: Partition) -> SystemStreamPartition {
        SystemStreamPartition {
            system_stream: self.clone(),
            partition,
        }
    }
}

impl Display for SystemStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.system, self.stream)
    }
}

/// The unit of ordering and checkpointing: (system, stream, partition)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SystemStreamPartition {
    pub system_stream: SystemStream,
    pub partition: Partition,
}

impl SystemStreamPartition {
    pub fn new(system: &str, stream: &str, partition: Partition) -> Self {
        SystemStream::new(system, stream).partition(partition)
    }

    pub fn system(&self) -> &str {
        &self.system_stream.system
    }

    pub fn stream(&self) -> &str {
        &self.system_stream.stream
    }
}

impl Display for SystemStreamPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system_stream, self.partition)
    }
}

/// An opaque consumption position, interpreted only by the owning system.
/// Monotonic per SSP under that system's ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Offset(String);

impl Offset {
    pub fn new(offset: impl Into<String>) -> Self {
        Self(offset.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An in-flight domain value. Raw (undecoded) payloads are `Bytes`;
/// codecs map between `Bytes` and the richer variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bytes(Bytes),
    Text(String),
    Integer(i64),
    Json(serde_json::Value),
}

impl Datum {
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Datum::Bytes(bytes.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Datum::Text(text.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Datum::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// An inbound message. Before decoding, key and value are raw `Bytes`;
/// after the codec boundary they are domain `Datum`s.
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    pub ssp: SystemStreamPartition,
    pub offset: Offset,
    pub key: Option<Datum>,
    pub value: Option<Datum>,
}

/// An outbound message. The partition is optional; the destination system
/// picks one when absent.
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub system_stream: SystemStream,
    pub partition: Option<Partition>,
    pub key: Option<Datum>,
    pub value: Option<Datum>,
}

impl OutgoingEnvelope {
    pub fn new(system_stream: SystemStream, key: Option<Datum>, value: Option<Datum>) -> Self {
        Self {
            system_stream,
            partition: None,
            key,
            value,
        }
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Scope key for checkpoints and per-task metrics: `<job>-<partition>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskName(String);

impl TaskName {
    pub fn new(job: &str, partition: Partition) -> Self {
        Self(format!("{job}-{partition}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
