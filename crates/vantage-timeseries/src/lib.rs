//! # vantage-timeseries
//!
//! A deliberately small time-series abstraction: the prober registers metric
//! keys into a [`KeyPackage`], sets integer values as probing progresses,
//! and flushes the whole package at round boundaries with an explicit
//! timestamp. The [`Sink`] behind the package decides where points go; the
//! built-in sinks write Graphite plaintext or capture points in memory for
//! tests.
//!
//! Key resolution is modeled after backends that need a registration
//! round-trip before accepting points: `resolve` may fail transiently and
//! callers are expected to retry.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Handle to a registered key within a [`KeyPackage`].
pub type KeyId = usize;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("could not resolve {failed} of {total} keys")]
    Resolve { failed: usize, total: usize },
}

/// A time-series backend.
pub trait Sink: Send + Sync {
    /// Resolve the given key names with the backend. Retriable.
    fn resolve(&self, keys: &[String]) -> Result<(), SinkError>;

    /// Emit one point per key at the given unix timestamp (seconds).
    fn emit(&self, points: &[(&str, u64)], timestamp: u64) -> Result<(), SinkError>;
}

// ─── Key package ────────────────────────────────────────────────────────────

/// A set of registered keys and their current values, flushed as one batch.
pub struct KeyPackage {
    sink: Arc<dyn Sink>,
    keys: Vec<String>,
    by_name: HashMap<String, KeyId>,
    values: Vec<u64>,
}

impl KeyPackage {
    pub fn new(sink: Arc<dyn Sink>) -> KeyPackage {
        KeyPackage {
            sink,
            keys: Vec::new(),
            by_name: HashMap::new(),
            values: Vec::new(),
        }
    }

    /// Register a key, returning its handle. Registering an already-known
    /// name returns the existing handle.
    pub fn register_key(&mut self, name: impl Into<String>) -> KeyId {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = self.keys.len();
        self.by_name.insert(name.clone(), id);
        self.keys.push(name);
        self.values.push(0);
        id
    }

    /// Look up the handle of an already-registered key.
    pub fn key_id(&self, name: &str) -> Option<KeyId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: KeyId) -> u64 {
        self.values[id]
    }

    pub fn set(&mut self, id: KeyId, value: u64) {
        self.values[id] = value;
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Resolve every registered key with the backend.
    pub fn resolve_all(&self) -> Result<(), SinkError> {
        self.sink.resolve(&self.keys)
    }

    /// Emit the current value of every key at `timestamp` (unix seconds).
    pub fn flush(&self, timestamp: u64) -> Result<(), SinkError> {
        let points: Vec<(&str, u64)> = self
            .keys
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
            .collect();
        self.sink.emit(&points, timestamp)
    }
}

// ─── Graphite plaintext sink ────────────────────────────────────────────────

/// Writes points in Graphite's plaintext protocol: `key value timestamp`.
pub struct GraphiteSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl GraphiteSink {
    pub fn new(out: Box<dyn Write + Send>) -> GraphiteSink {
        GraphiteSink {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> GraphiteSink {
        Self::new(Box::new(io::stdout()))
    }

    pub fn file(path: &Path) -> io::Result<GraphiteSink> {
        Ok(Self::new(Box::new(BufWriter::new(File::create(path)?))))
    }
}

impl Sink for GraphiteSink {
    fn resolve(&self, _keys: &[String]) -> Result<(), SinkError> {
        // plaintext output has no registration round-trip
        Ok(())
    }

    fn emit(&self, points: &[(&str, u64)], timestamp: u64) -> Result<(), SinkError> {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in points {
            writeln!(out, "{key} {value} {timestamp}")?;
        }
        out.flush()?;
        Ok(())
    }
}

// ─── In-memory sink (tests) ─────────────────────────────────────────────────

/// Captures emitted points; can be told to fail the next N resolve calls.
#[derive(Default)]
pub struct MemSink {
    points: Mutex<Vec<(String, u64, u64)>>,
    resolve_failures: AtomicUsize,
}

impl MemSink {
    pub fn new() -> MemSink {
        MemSink::default()
    }

    /// Make the next `n` calls to `resolve` fail.
    pub fn fail_next_resolves(&self, n: usize) {
        self.resolve_failures.store(n, Ordering::Relaxed);
    }

    /// Snapshot of all captured `(key, value, timestamp)` points.
    pub fn points(&self) -> Vec<(String, u64, u64)> {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All `(value, timestamp)` pairs emitted for a key, in emit order.
    pub fn values_for(&self, key: &str) -> Vec<(u64, u64)> {
        self.points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _, _)| k == key)
            .map(|&(_, v, t)| (v, t))
            .collect()
    }
}

impl Sink for MemSink {
    fn resolve(&self, keys: &[String]) -> Result<(), SinkError> {
        let remaining = self.resolve_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.resolve_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(SinkError::Resolve {
                failed: keys.len(),
                total: keys.len(),
            });
        }
        Ok(())
    }

    fn emit(&self, points: &[(&str, u64)], timestamp: u64) -> Result<(), SinkError> {
        let mut stored = self.points.lock().unwrap_or_else(|e| e.into_inner());
        for (key, value) in points {
            stored.push((key.to_string(), *value, timestamp));
        }
        Ok(())
    }
}
