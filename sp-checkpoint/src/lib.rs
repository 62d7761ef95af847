//! Checkpoint persistence and resume reconciliation.
//!
//! A checkpoint bundles everything a resumed run needs: epoch, weights,
//! optimizer state, the full configuration groups, the command history and
//! (optionally) the serialized replay buffer. Files are published atomically
//! (temp + rename) as `checkpoint_<epoch>.<ext>` with `<ext>` one of `.ckpt`,
//! `.ckpt.gz`, `.zip`; readers auto-detect by extension.

mod format;
mod resume;

pub use resume::{update_params_from_checkpoint, ResumedRun};

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use thiserror::Error;

use sp_core::config::{Compression, Config, ConfigError};
use sp_core::history::{CommandHistory, MergeError};
use sp_core::model::WeightsSnapshot;
use sp_core::tensor::{NamedTensors, TensorError};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("unsupported checkpoint file extension: {path} (expected .ckpt, .ckpt.gz or .zip)")]
    UnsupportedFormat { path: PathBuf },
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot start from init_checkpoint: {0} already holds checkpoints of a previous run")]
    InitWithExistingRun(PathBuf),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Full run state as persisted.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub epoch: u64,
    pub config: Config,
    pub history: CommandHistory,
    pub weights: WeightsSnapshot,
    pub optim_state: NamedTensors,
    /// Exported replay-buffer blob; `None` when the run skips it to save
    /// space and time.
    pub replay: Option<Vec<u8>>,
}

fn io_err(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, reason: impl ToString) -> CheckpointError {
    CheckpointError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn file_name_for(epoch: u64, compression: Compression) -> String {
    match compression {
        Compression::Uncompressed => format!("checkpoint_{epoch}.ckpt"),
        Compression::Gzip => format!("checkpoint_{epoch}.ckpt.gz"),
        Compression::Zip => format!("checkpoint_{epoch}.zip"),
    }
}

/// Persist a checkpoint; a reader never observes a half-written file.
pub fn save(
    dir: &Path,
    checkpoint: &Checkpoint,
    compression: Compression,
) -> Result<PathBuf, CheckpointError> {
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let bytes = format::encode(checkpoint).map_err(|e| corrupt(dir, e))?;

    let final_path = dir.join(file_name_for(checkpoint.epoch, compression));
    let tmp_path = dir.join(format!(
        "{}.tmp",
        file_name_for(checkpoint.epoch, compression)
    ));

    match compression {
        Compression::Uncompressed => {
            fs::write(&tmp_path, &bytes).map_err(|e| io_err(&tmp_path, e))?;
        }
        Compression::Gzip => {
            let file = fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
            let mut enc = GzEncoder::new(file, GzLevel::default());
            enc.write_all(&bytes).map_err(|e| io_err(&tmp_path, e))?;
            enc.finish().map_err(|e| io_err(&tmp_path, e))?;
        }
        Compression::Zip => {
            let file = fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
            let mut z = zip::ZipWriter::new(file);
            z.start_file("checkpoint.ckpt", zip::write::SimpleFileOptions::default())
                .map_err(|e| corrupt(&tmp_path, e))?;
            z.write_all(&bytes).map_err(|e| io_err(&tmp_path, e))?;
            z.finish().map_err(|e| corrupt(&tmp_path, e))?;
        }
    }
    fs::rename(&tmp_path, &final_path).map_err(|e| io_err(&final_path, e))?;
    Ok(final_path)
}

/// Load a checkpoint, auto-detecting the container by file extension.
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CheckpointError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;

    let bytes = if name.ends_with(".ckpt.gz") || name.ends_with(".gz") {
        let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
        let mut out = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut out)
            .map_err(|e| corrupt(path, e))?;
        out
    } else if name.ends_with(".zip") {
        let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| corrupt(path, e))?;
        if archive.is_empty() {
            return Err(corrupt(path, "empty zip archive"));
        }
        let mut entry = archive.by_index(0).map_err(|e| corrupt(path, e))?;
        let mut out = Vec::new();
        entry.read_to_end(&mut out).map_err(|e| corrupt(path, e))?;
        out
    } else if name.ends_with(".ckpt") {
        fs::read(path).map_err(|e| io_err(path, e))?
    } else {
        return Err(CheckpointError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    };

    format::decode(&bytes).map_err(|e| corrupt(path, e))
}

/// Epoch number parsed from a `checkpoint_<epoch>.<ext>` file name.
fn epoch_of(name: &str) -> Option<u64> {
    if name.ends_with(".tmp") {
        return None;
    }
    let rest = name.strip_prefix("checkpoint_")?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}

/// Most recent checkpoint in `dir`: highest epoch number present.
pub fn latest(dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(epoch) = epoch_of(name) else { continue };
        if best.as_ref().is_none_or(|(e, _)| epoch > *e) {
            best = Some((epoch, entry.path()));
        }
    }
    Ok(best.map(|(_, p)| p))
}

/// Guard for pretrained starts: `init_checkpoint` is only valid on a fresh
/// checkpoint directory.
pub fn ensure_fresh_for_init(dir: &Path) -> Result<(), CheckpointError> {
    if latest(dir)?.is_some() {
        return Err(CheckpointError::InitWithExistingRun(dir.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use sp_core::tensor::Tensor;

    fn sample_checkpoint(epoch: u64) -> Checkpoint {
        let mut weights = NamedTensors::new();
        weights.insert(
            "fc.weight".to_string(),
            Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        let mut optim = NamedTensors::new();
        optim.insert(
            "fc.weight.exp_avg".to_string(),
            Tensor::from_f32(vec![2, 2], vec![0.1; 4]).unwrap(),
        );
        Checkpoint {
            epoch,
            config: Config::default(),
            history: CommandHistory::from_invocation(["optim.lr"]),
            weights: WeightsSnapshot::new(weights),
            optim_state: optim,
            replay: Some(vec![1, 2, 3, 4]),
        }
    }

    #[test]
    fn roundtrip_all_container_formats() {
        let dir = tempfile::tempdir().unwrap();
        for compression in [Compression::Uncompressed, Compression::Gzip, Compression::Zip] {
            let path = save(dir.path(), &sample_checkpoint(5), compression).unwrap();
            let back = load(&path).unwrap();
            assert_eq!(back.epoch, 5);
            assert_eq!(
                back.weights.tensors["fc.weight"].as_f32().unwrap(),
                &[1.0, 2.0, 3.0, 4.0]
            );
            assert_eq!(back.replay.as_deref(), Some(&[1u8, 2, 3, 4][..]));
            assert!(back.history.last_command_contains("optim.lr"));
        }
    }

    #[test]
    fn replay_blob_is_skippable() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = sample_checkpoint(1);
        ckpt.replay = None;
        let path = save(dir.path(), &ckpt, Compression::Uncompressed).unwrap();
        assert!(load(&path).unwrap().replay.is_none());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint_3.tar");
        fs::write(&path, b"whatever").unwrap();
        assert!(matches!(
            load(&path),
            Err(CheckpointError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn corrupt_file_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint_3.ckpt");
        fs::write(&path, b"not a checkpoint").unwrap();
        match load(&path) {
            Err(CheckpointError::Corrupt { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn latest_scans_numerically_across_extensions() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &sample_checkpoint(2), Compression::Uncompressed).unwrap();
        save(dir.path(), &sample_checkpoint(10), Compression::Zip).unwrap();
        let best = save(dir.path(), &sample_checkpoint(30), Compression::Gzip).unwrap();
        save(dir.path(), &sample_checkpoint(9), Compression::Gzip).unwrap();
        // A stale tmp file from a crashed save is ignored.
        fs::write(dir.path().join("checkpoint_99.ckpt.tmp"), b"junk").unwrap();

        assert_eq!(latest(dir.path()).unwrap(), Some(best));
    }

    #[test]
    fn latest_on_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never_created");
        assert_eq!(latest(&missing).unwrap(), None);
    }

    #[test]
    fn init_guard_rejects_populated_dir() {
        let dir = tempfile::tempdir().unwrap();
        ensure_fresh_for_init(dir.path()).unwrap();
        save(dir.path(), &sample_checkpoint(1), Compression::Uncompressed).unwrap();
        assert!(matches!(
            ensure_fresh_for_init(dir.path()),
            Err(CheckpointError::InitWithExistingRun(_))
        ));
    }
}
