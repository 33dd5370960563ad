//! Storage capability contracts
//!
//! `StorageEngine` is the embedded engine SPI (bytes in, bytes out, one
//! engine per store partition). `KeyValueStore` is what user tasks see:
//! domain values going through the store's codecs, with mutations
//! replicated to a change-log stream when one is configured.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use config::Config;

use crate::types::{Datum, Partition};

/// One change-log record applied during restore. `None` value is a
/// tombstone (delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Embedded key-value engine SPI, one instance per (store, partition)
pub trait StorageEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Entries with `from <= key < to`, in key order
    fn range(&self, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn flush(&mut self) -> Result<()>;

    /// Apply change-log records directly, bypassing replication
    fn restore(&mut self, entries: Vec<RestoreEntry>) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Builds an engine rooted at the store's partition directory
pub trait StorageEngineFactory: Send + Sync {
    fn build(
        &self,
        store: &str,
        partition: Partition,
        path: &Path,
        config: &Config,
    ) -> Result<Box<dyn StorageEngine>>;
}

/// Store operations exposed to user tasks. Async because mutations on a
/// change-logged store go through the shared producer multiplexer before
/// they are acknowledged.
#[async_trait]
pub trait KeyValueStore: Send {
    async fn get(&mut self, key: &Datum) -> Result<Option<Datum>>;

    async fn put(&mut self, key: Datum, value: Datum) -> Result<()>;

    async fn delete(&mut self, key: &Datum) -> Result<()>;

    /// Entries with `from <= key < to` under the encoded-key order
    async fn range(&mut self, from: &Datum, to: &Datum) -> Result<Vec<(Datum, Datum)>>;

    async fn flush(&mut self) -> Result<()>;
}
