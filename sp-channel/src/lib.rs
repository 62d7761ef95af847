//! Rendezvous channels between actors and the serving/ingestion loops.

mod inference;
mod train;

pub use inference::{Collected, InferenceChannel, ReplySink, Ticket};
pub use train::{train_channel, TrainReceiver, TrainSender};

use thiserror::Error;

use sp_core::tensor::TensorError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel terminated")]
    Terminated,
    #[error("reply sender disconnected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("reply has {got} rows, collected batch has {expected}")]
    ReplyShape { expected: usize, got: usize },
    #[error("request fields do not match the requests already waiting")]
    MixedSchema,
    #[error("request batch is malformed: {0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}
