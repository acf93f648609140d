//! Endpoint adapter for chunks: naming, codec, retries.
//!
//! Chunk objects live at `"<prefix>/ept-data/<d>-<x>-<y>-<z><postfix>.<ext>"`.
//! Writes are idempotent full-object puts. Transient endpoint failures are
//! retried with exponential backoff up to the configured cap; corruption
//! is never retried.

use crate::cell::{Cell, CellKind};
use crate::codec;
use entile_core::manifest::layout;
use entile_core::{join_key, ChunkKey, DataType, Endpoint, Error, Point, Result, Schema};
use std::sync::Arc;
use std::time::Duration;

/// Retry policy for transient endpoint failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying transient failures with exponential backoff.
    pub fn run<T>(&self, what: &str, op: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay = self.base_delay;
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt + 1 < self.attempts.max(1) => {
                    attempt += 1;
                    tracing::warn!(what, attempt, error = %e, "transient endpoint failure, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                other => return other,
            }
        }
    }
}

/// Serializes cells to chunk objects and back.
#[derive(Clone)]
pub struct ChunkStore {
    endpoint: Arc<dyn Endpoint>,
    prefix: String,
    postfix: String,
    schema: Schema,
    data_type: DataType,
    retry: RetryPolicy,
}

impl ChunkStore {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        prefix: impl Into<String>,
        postfix: impl Into<String>,
        schema: Schema,
        data_type: DataType,
        retry: RetryPolicy,
    ) -> Self {
        ChunkStore {
            endpoint,
            prefix: prefix.into(),
            postfix: postfix.into(),
            schema,
            data_type,
            retry,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Object key of the chunk for `key`.
    pub fn object_key(&self, key: &ChunkKey) -> String {
        join_key(
            &self.prefix,
            &layout::chunk(key, &self.postfix, self.data_type.extension()),
        )
    }

    /// Write a cell through to its chunk object.
    pub fn write(&self, cell: &Cell) -> Result<()> {
        let compress = self.data_type == DataType::Zstandard;
        let bytes = codec::encode(cell.points(), &self.schema, compress, cell.sealed())?;
        let object = self.object_key(&cell.key());
        self.retry
            .run(&object, || self.endpoint.put(&object, &bytes))?;
        tracing::debug!(chunk = %cell.key(), points = cell.len(), bytes = bytes.len(), "chunk written");
        Ok(())
    }

    /// Read the chunk for `key`, if one exists. Corruption surfaces as
    /// `ChunkCorrupt` and aborts the build.
    pub fn read(&self, key: &ChunkKey) -> Result<Option<(Vec<Point>, bool)>> {
        let object = self.object_key(key);
        let bytes = match self.retry.run(&object, || match self.endpoint.get(&object) {
            Err(Error::NotFound(_)) => Ok(None),
            other => other.map(Some),
        })? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        codec::decode(&bytes, &self.schema)
            .map(Some)
            .map_err(|e| match e {
                Error::ChunkCorrupt(msg) => Error::chunk_corrupt(format!("{}: {}", object, msg)),
                other => other,
            })
    }

    /// Materialize a cell for `key`: reload its chunk if one exists,
    /// otherwise start empty.
    pub fn load_cell(&self, key: &ChunkKey, kind: CellKind, capacity: usize) -> Result<Cell> {
        match self.read(key)? {
            Some((points, sealed)) => Ok(Cell::from_store(*key, kind, capacity, points, sealed)),
            None => Ok(Cell::new(*key, kind, capacity)),
        }
    }
}
