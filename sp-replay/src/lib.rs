//! Fixed-capacity replay storage shared by many actor threads and the
//! learner.

mod buffer;
mod snapshot;

pub use buffer::{FieldSpec, ReplayBuffer, SlotSchema};
pub use snapshot::restore;

use thiserror::Error;

use sp_core::tensor::TensorError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot sample from an empty buffer")]
    InsufficientData,
    #[error("slot field '{field}' does not match the buffer schema: {detail}")]
    SchemaMismatch { field: String, detail: String },
    #[error("restored buffer is incompatible with the configured buffer: {0}")]
    IncompatibleBufferShape(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}
