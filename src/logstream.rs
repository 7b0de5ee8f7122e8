//! Per-deployment log capture and tailing

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Which stream a captured line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
    /// Lines emitted by the manager itself (driver events, provider output)
    System,
}

/// One captured log line
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    /// Monotonically increasing per deployment; survives buffer eviction
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStreamKind,
    pub message: String,
}

struct BufferState {
    lines: VecDeque<LogLine>,
    next_seq: u64,
}

/// Bounded ring buffer for one deployment id
struct LogBuffer {
    state: Mutex<BufferState>,
    tx: broadcast::Sender<LogLine>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            state: Mutex::new(BufferState {
                lines: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            tx,
            capacity,
        }
    }

    fn append(&self, stream: LogStreamKind, message: String) {
        let line = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let line = LogLine {
                seq: state.next_seq,
                timestamp: Utc::now(),
                stream,
                message,
            };
            state.next_seq += 1;
            if state.lines.len() >= self.capacity {
                state.lines.pop_front();
            }
            state.lines.push_back(line.clone());
            line
        };
        // No live subscribers is fine
        let _ = self.tx.send(line);
    }

    fn read_since(&self, since_seq: Option<u64>) -> Vec<LogLine> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match since_seq {
            Some(since) => state
                .lines
                .iter()
                .filter(|l| l.seq >= since)
                .cloned()
                .collect(),
            None => state.lines.iter().cloned().collect(),
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // seq keeps counting so prior reader offsets stay meaningful
        state.lines.clear();
    }
}

/// Log aggregator: one bounded buffer per deployment id.
///
/// Buffers survive restart of the same deployment and are reset only when a
/// new artifact is built. A subscriber attaching mid-stream receives the
/// buffered history first, then live lines.
pub struct LogAggregator {
    buffers: RwLock<HashMap<String, std::sync::Arc<LogBuffer>>>,
    capacity: usize,
}

impl LogAggregator {
    /// Create an aggregator whose per-deployment buffers hold `capacity`
    /// lines. A buffer always holds at least one line.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn buffer(&self, deployment_id: &str) -> std::sync::Arc<LogBuffer> {
        {
            let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(buf) = buffers.get(deployment_id) {
                return buf.clone();
            }
        }
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers
            .entry(deployment_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(LogBuffer::new(self.capacity)))
            .clone()
    }

    /// Append a captured line for a deployment
    pub fn append(&self, deployment_id: &str, stream: LogStreamKind, message: impl Into<String>) {
        self.buffer(deployment_id).append(stream, message.into());
    }

    /// Read buffered lines, optionally only those at or after `since_seq`.
    /// Oldest-first; lines evicted from the ring are gone.
    pub fn read_since(&self, deployment_id: &str, since_seq: Option<u64>) -> Vec<LogLine> {
        self.buffer(deployment_id).read_since(since_seq)
    }

    /// Attach a live subscriber: buffered history plus a receiver for
    /// subsequent lines.
    pub fn subscribe(&self, deployment_id: &str) -> (Vec<LogLine>, broadcast::Receiver<LogLine>) {
        let buf = self.buffer(deployment_id);
        // Subscribe before snapshotting so no line falls in between
        let rx = buf.tx.subscribe();
        let history = buf.read_since(None);
        (history, rx)
    }

    /// Reset the buffer for a deployment (new build artifact)
    pub fn reset(&self, deployment_id: &str) {
        let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(buf) = buffers.get(deployment_id) {
            buf.clear();
        }
    }

    /// Drop the buffer entirely (instance archived)
    pub fn remove(&self, deployment_id: &str) {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers.remove(deployment_id);
    }
}
