//! Core value types for the self-play training loop: named tensors, training
//! samples, configuration groups, the invocation history used for resume
//! reconciliation, and the evaluator registry.

pub mod config;
pub mod game;
pub mod history;
pub mod model;
pub mod sample;
pub mod schema;
pub mod tensor;

pub use config::{Compression, Config, ConfigError};
pub use game::{Game, GameError, Player};
pub use history::{CommandHistory, MergeError, Reconcile};
pub use model::{EvalError, Evaluator, EvaluatorRegistry, LossStats, TrainableModel, WeightsSnapshot};
pub use sample::{Sample, SampleError, SampleSeq};
pub use tensor::{Dtype, NamedTensors, Tensor, TensorError};
