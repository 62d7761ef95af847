//! Sectioned binary layout of a checkpoint bundle.
//!
//! `SPCK` magic, a format version, then typed sections: a JSON section for
//! epoch/config/history and raw safetensors sections for weights, optimizer
//! state and the optional replay-buffer blob.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sp_core::config::Config;
use sp_core::history::CommandHistory;
use sp_core::model::WeightsSnapshot;
use sp_core::tensor::{self, NamedTensors};

use crate::Checkpoint;

const MAGIC: &[u8; 4] = b"SPCK";
const FORMAT_VERSION: u32 = 1;

const SEC_META: u8 = 1;
const SEC_WEIGHTS: u8 = 2;
const SEC_OPTIM: u8 = 3;
const SEC_REPLAY: u8 = 4;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported bundle version {0}")]
    BadVersion(u32),
    #[error("bundle truncated")]
    Truncated,
    #[error("duplicate section {0}")]
    DuplicateSection(u8),
    #[error("missing section {0}")]
    MissingSection(&'static str),
    #[error("meta json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tensor payload: {0}")]
    Tensor(#[from] sp_core::tensor::TensorError),
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaV1 {
    epoch: u64,
    config: Config,
    history: CommandHistory,
    config_hash: String,
    has_replay: bool,
}

pub(crate) fn encode(ckpt: &Checkpoint) -> Result<Vec<u8>, FormatError> {
    let config_json = serde_json::to_vec(&ckpt.config)?;
    let meta = MetaV1 {
        epoch: ckpt.epoch,
        config: ckpt.config.clone(),
        history: ckpt.history.clone(),
        config_hash: sp_logging::hash_config_bytes(&config_json),
        has_replay: ckpt.replay.is_some(),
    };
    let meta_bytes = serde_json::to_vec(&meta)?;
    let weights_bytes = ckpt.weights.to_bytes()?;
    let optim_bytes = tensor::to_safetensors(&ckpt.optim_state, None)?;

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    let n_sections = 3 + u32::from(ckpt.replay.is_some());
    out.extend_from_slice(&n_sections.to_le_bytes());

    put_section(&mut out, SEC_META, &meta_bytes);
    put_section(&mut out, SEC_WEIGHTS, &weights_bytes);
    put_section(&mut out, SEC_OPTIM, &optim_bytes);
    if let Some(replay) = &ckpt.replay {
        put_section(&mut out, SEC_REPLAY, replay);
    }
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Checkpoint, FormatError> {
    let mut c = Cursor { bytes, off: 0 };
    if c.take(4)? != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = c.read_u32()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::BadVersion(version));
    }
    let n_sections = c.read_u32()?;

    let mut meta: Option<MetaV1> = None;
    let mut weights: Option<WeightsSnapshot> = None;
    let mut optim: Option<NamedTensors> = None;
    let mut replay: Option<Vec<u8>> = None;
    for _ in 0..n_sections {
        let kind = c.read_u8()?;
        let len = c.read_u64()? as usize;
        let body = c.take(len)?;
        match kind {
            SEC_META if meta.is_none() => meta = Some(serde_json::from_slice(body)?),
            SEC_WEIGHTS if weights.is_none() => {
                weights = Some(WeightsSnapshot::from_bytes(body)?)
            }
            SEC_OPTIM if optim.is_none() => {
                optim = Some(tensor::from_safetensors(body)?.0)
            }
            SEC_REPLAY if replay.is_none() => replay = Some(body.to_vec()),
            k if matches!(k, SEC_META | SEC_WEIGHTS | SEC_OPTIM | SEC_REPLAY) => {
                return Err(FormatError::DuplicateSection(k))
            }
            // Unknown sections from a newer writer are skipped.
            _ => {}
        }
    }

    let meta = meta.ok_or(FormatError::MissingSection("meta"))?;
    Ok(Checkpoint {
        epoch: meta.epoch,
        config: meta.config,
        history: meta.history,
        weights: weights.ok_or(FormatError::MissingSection("weights"))?,
        optim_state: optim.ok_or(FormatError::MissingSection("optim"))?,
        replay,
    })
}

fn put_section(out: &mut Vec<u8>, kind: u8, body: &[u8]) {
    out.push(kind);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        if self.off + n > self.bytes.len() {
            return Err(FormatError::Truncated);
        }
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn read_u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, FormatError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, FormatError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
