//! NDJSON run logs: append-only event streams for post-mortems.
//!
//! Each training run writes one object per line; a crashed run leaves at most
//! one partial trailing line, which readers skip.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum NdjsonError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stable hash of a config snapshot, recorded in checkpoints and events.
pub fn hash_config_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Per-epoch learner stats.
#[derive(Debug, Clone, Serialize)]
pub struct TrainEpochEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub epoch: u64,
    pub loss_total: f32,
    pub loss_policy: f32,
    pub loss_value: f32,
    pub buffer_size: usize,
    pub buffer_num_add: u64,
    pub buffer_num_sample: u64,
    pub add_rate: f64,
    pub sample_rate: f64,
    pub sync_count: u32,
}

/// Rate-balancer transitions; `throttled` flips on engage/release.
#[derive(Debug, Clone, Serialize)]
pub struct RateStatusEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub add_rate: f64,
    pub sample_rate: f64,
    pub threshold_factor: f64,
    pub throttled: bool,
}

/// Network peer lifecycle on the serving side.
#[derive(Debug, Clone, Serialize)]
pub struct PeerEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub peer: String,
    pub detail: String,
}

/// Checkpoint save/load records.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,
    pub epoch: u64,
    pub path: String,
    pub with_buffer: bool,
}

/// Append-only NDJSON writer.
///
/// Contract: each call writes exactly one JSON object followed by a newline.
pub struct NdjsonWriter {
    w: BufWriter<File>,
    lines_since_flush: u64,
    flush_every_lines: u64,
}

impl NdjsonWriter {
    /// Open a file for append. Creates it if it doesn't exist.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        Self::open_append_with_flush(path, 0)
    }

    /// `flush_every_lines=0` disables periodic flushing.
    pub fn open_append_with_flush(
        path: impl AsRef<Path>,
        flush_every_lines: u64,
    ) -> Result<Self, NdjsonError> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            w: BufWriter::new(f),
            lines_since_flush: 0,
            flush_every_lines,
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        let mut buf = serde_json::to_vec(event)?;
        buf.push(b'\n');
        self.w.write_all(&buf)?;
        self.lines_since_flush += 1;
        if self.flush_every_lines > 0 && self.lines_since_flush >= self.flush_every_lines {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.w.flush()?;
        self.lines_since_flush = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use serde_json::Value;

    fn read_ndjson_lenient(path: &Path) -> Vec<Value> {
        let s = fs::read_to_string(path).expect("read");
        let mut out = Vec::new();
        for line in s.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(line) {
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn writes_one_valid_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut w = NdjsonWriter::open_append(&path).unwrap();

        w.write_event(&RateStatusEventV1 {
            event: "rate_status",
            ts_ms: now_ms(),
            add_rate: 10.0,
            sample_rate: 25.0,
            threshold_factor: 1.4,
            throttled: true,
        })
        .unwrap();
        w.write_event(&RateStatusEventV1 {
            event: "rate_status",
            ts_ms: now_ms(),
            add_rate: 10.0,
            sample_rate: 9.0,
            threshold_factor: 1.4,
            throttled: false,
        })
        .unwrap();
        w.flush().unwrap();

        let vals = read_ndjson_lenient(&path);
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[0]["throttled"], true);
        assert_eq!(vals[1]["throttled"], false);
    }

    #[test]
    fn lenient_reader_tolerates_trailing_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");

        {
            let mut w = NdjsonWriter::open_append(&path).unwrap();
            w.write_event(&CheckpointEventV1 {
                event: "checkpoint_saved",
                ts_ms: now_ms(),
                epoch: 3,
                path: "checkpoint_3.ckpt.gz".to_string(),
                with_buffer: true,
            })
            .unwrap();
            w.flush().unwrap();
        }

        // Simulate crash: append a partial JSON line (no newline, invalid JSON).
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"event":"checkpoint_saved","epoch":"#).unwrap();
        f.flush().unwrap();

        let vals = read_ndjson_lenient(&path);
        assert_eq!(vals.len(), 1);
        assert_eq!(vals[0]["epoch"], 3);
    }

    #[test]
    fn config_hash_is_stable() {
        let a = hash_config_bytes(b"optim:\n  lr: 0.001\n");
        let b = hash_config_bytes(b"optim:\n  lr: 0.001\n");
        let c = hash_config_bytes(b"optim:\n  lr: 0.002\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
