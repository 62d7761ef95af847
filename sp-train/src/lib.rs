//! The learner side of the loop: replay warmup, rate balancing, the epoch
//! loop with periodic weight publication and checkpointing, and multi-process
//! coordination.

mod dist;
mod learner;
mod rate;

pub use dist::{DistributedTrainCoordinator, Rank0Listener, RemoteSampler, ReplaySampleServer};
pub use learner::{warm_up_replay_buffer, TrainLoop};
pub use rate::RateBalancer;

use thiserror::Error;

use sp_checkpoint::CheckpointError;
use sp_core::model::EvalError;
use sp_logging::NdjsonError;
use sp_manager::ManagerError;
use sp_net::WireError;
use sp_replay::ReplayError;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("terminated")]
    Terminated,
    #[error("distributed group misconfigured: {0}")]
    BadGroup(String),
    #[error("unexpected message from rank {rank}: {detail}")]
    Protocol { rank: u32, detail: String },
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Log(#[from] NdjsonError),
    #[error(transparent)]
    Tensor(#[from] sp_core::tensor::TensorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
