//! Trajectory persistence for larvadrift runs.
//!
//! Implements the engine's [`OutputSink`] boundary with a JSON-lines file:
//! one serialized [`ParticleRecord`] per line, buffered, flushed on close.
//! [`SharedStore`] wraps a store behind `Arc<Mutex<_>>` so a supervising
//! thread can keep a handle on the file while the worker writes to it.

use larvadrift_core::{OutputError, OutputSink, ParticleRecord};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors raised while opening a trajectory store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be created.
    #[error("failed to create trajectory file {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// JSON-lines particle record store.
pub struct TrajectoryStore {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
    closed: bool,
}

impl std::fmt::Debug for TrajectoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectoryStore")
            .field("path", &self.path)
            .field("records", &self.records)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TrajectoryStore {
    /// Create (or truncate) the trajectory file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = File::create(&path).map_err(|source| StoreError::Create {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            records: 0,
            closed: false,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written so far.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Whether `flush_and_close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl OutputSink for TrajectoryStore {
    fn write_state(&mut self, record: &ParticleRecord) -> Result<(), OutputError> {
        if self.closed {
            return Err(OutputError::Write("store already closed".into()));
        }
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|err| OutputError::Write(err.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|err| OutputError::Write(err.to_string()))?;
        self.records += 1;
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), OutputError> {
        self.writer
            .flush()
            .map_err(|err| OutputError::Flush(err.to_string()))?;
        self.closed = true;
        Ok(())
    }
}

/// Clonable handle sharing one store between the worker and a supervisor.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<TrajectoryStore>>,
}

impl SharedStore {
    /// Wrap an open store.
    #[must_use]
    pub fn new(store: TrajectoryStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Borrow the shared store handle.
    #[must_use]
    pub fn handle(&self) -> Arc<Mutex<TrajectoryStore>> {
        Arc::clone(&self.inner)
    }
}

impl OutputSink for SharedStore {
    fn write_state(&mut self, record: &ParticleRecord) -> Result<(), OutputError> {
        let mut store = self
            .inner
            .lock()
            .map_err(|_| OutputError::Write("trajectory store lock poisoned".into()))?;
        store.write_state(record)
    }

    fn flush_and_close(&mut self) -> Result<(), OutputError> {
        let mut store = self
            .inner
            .lock()
            .map_err(|_| OutputError::Flush("trajectory store lock poisoned".into()))?;
        store.flush_and_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(index: usize) -> ParticleRecord {
        ParticleRecord {
            record_index: 0,
            particle: index,
            time: 3_600,
            lon: -4.5 + index as f64 * 0.01,
            lat: 43.2,
            depth: -25.0,
            death: None,
            length: 0.025,
            temperature: 16.5,
            salinity: 35.1,
            zone_code: 1,
            recruited: vec![false, false],
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("larvadrift-store-{}-{name}", std::process::id()))
    }

    #[test]
    fn writes_one_json_line_per_record() {
        let path = temp_path("lines.jsonl");
        let mut store = TrajectoryStore::create(&path).expect("create");
        store.write_state(&sample_record(0)).expect("write");
        store.write_state(&sample_record(1)).expect("write");
        assert_eq!(store.record_count(), 2);
        store.flush_and_close().expect("close");
        assert!(store.is_closed());

        let body = std::fs::read_to_string(&path).expect("read back");
        let records: Vec<ParticleRecord> = body
            .lines()
            .map(|line| serde_json::from_str(line).expect("parse line"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].particle, 0);
        assert_eq!(records[1].particle, 1);
        assert_eq!(records[1].zone_code, 1);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_writes_after_close() {
        let path = temp_path("closed.jsonl");
        let mut store = TrajectoryStore::create(&path).expect("create");
        store.flush_and_close().expect("close");
        assert!(store.write_state(&sample_record(0)).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn shared_store_writes_through_clones() {
        let path = temp_path("shared.jsonl");
        let store = TrajectoryStore::create(&path).expect("create");
        let mut writer = SharedStore::new(store);
        let mut other = writer.clone();
        writer.write_state(&sample_record(0)).expect("write");
        other.write_state(&sample_record(1)).expect("write");
        writer.flush_and_close().expect("close");

        let handle = other.handle();
        let store = handle.lock().expect("lock");
        assert_eq!(store.record_count(), 2);
        assert!(store.is_closed());
        drop(store);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn create_fails_for_missing_directory() {
        let err = TrajectoryStore::create("/nonexistent-dir/larvadrift.jsonl").expect_err("create");
        assert!(matches!(err, StoreError::Create { .. }));
    }
}
