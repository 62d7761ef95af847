//! Resume-time reconciliation of supplied configuration with a checkpoint.

use sp_core::config::{Config, ExecutionConfig, OptimConfig, SimulationConfig};
use sp_core::config::{GameConfig, ModelConfig};
use sp_core::history::{CommandHistory, Reconcile};
use sp_core::model::WeightsSnapshot;
use sp_core::tensor::NamedTensors;

use crate::{Checkpoint, CheckpointError};

/// Everything the training entry point needs to continue a run.
#[derive(Debug)]
pub struct ResumedRun {
    pub epoch: u64,
    pub config: Config,
    pub history: CommandHistory,
    pub weights: WeightsSnapshot,
    pub optim_state: NamedTensors,
    pub replay: Option<Vec<u8>>,
}

/// Merge the freshly supplied configuration with the checkpoint's stored one.
///
/// Field precedence, per group field: a value explicitly supplied now always
/// wins; otherwise a value explicitly supplied in any earlier invocation
/// sticks (the checkpoint's copy); otherwise the compiled-in default applies.
/// Game and model identity adopt the checkpoint wholesale, after asserting
/// that any newly supplied locked field matches it (`game.name` may change).
/// Distributed placement is per-invocation and is taken as supplied.
pub fn update_params_from_checkpoint(
    checkpoint: Checkpoint,
    supplied: Config,
    current_invocation: CommandHistory,
) -> Result<ResumedRun, CheckpointError> {
    let mut history = current_invocation;
    history.prepend(&checkpoint.history);

    let game = GameConfig::adopt_from_checkpoint(&history, &supplied.game, &checkpoint.config.game)?;
    let model =
        ModelConfig::adopt_from_checkpoint(&history, &supplied.model, &checkpoint.config.model)?;
    let config = Config {
        game,
        model,
        optim: OptimConfig::reconcile(&history, &supplied.optim, &checkpoint.config.optim),
        simulation: SimulationConfig::reconcile(
            &history,
            &supplied.simulation,
            &checkpoint.config.simulation,
        ),
        execution: ExecutionConfig::reconcile(
            &history,
            &supplied.execution,
            &checkpoint.config.execution,
        ),
        distributed: supplied.distributed,
    };
    config.validate()?;

    Ok(ResumedRun {
        epoch: checkpoint.epoch,
        config,
        history,
        weights: checkpoint.weights,
        optim_state: checkpoint.optim_state,
        replay: checkpoint.replay,
    })
}
