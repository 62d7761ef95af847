//! Full local loop: actor threads play fake episodes through the inference
//! channel while the learner trains, checkpoints, and resumes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sp_core::config::{Compression, Config};
use sp_core::history::CommandHistory;
use sp_core::model::{
    EvalError, EvaluatorRegistry, LossStats, TrainableModel, WeightsSnapshot,
};
use sp_core::schema;
use sp_core::tensor::{NamedTensors, Tensor};
use sp_logging::NdjsonWriter;
use sp_manager::{ActorHandle, ManagerConfig, ModelManager};
use sp_train::{warm_up_replay_buffer, TrainLoop};

struct StubModel {
    steps: u64,
}

impl TrainableModel for StubModel {
    fn train_step(&mut self, batch: &NamedTensors) -> Result<LossStats, EvalError> {
        assert_eq!(batch[schema::OBS].shape()[0], batch[schema::VALUE].shape()[0]);
        self.steps += 1;
        Ok(LossStats::default())
    }

    fn weights(&self) -> WeightsSnapshot {
        let mut t = NamedTensors::new();
        t.insert(
            "steps".to_string(),
            Tensor::from_f32(vec![1], vec![self.steps as f32]).unwrap(),
        );
        WeightsSnapshot::new(t)
    }

    fn load_weights(&mut self, weights: &WeightsSnapshot) -> Result<(), EvalError> {
        self.steps = weights.tensors["steps"].as_f32().unwrap()[0] as u64;
        Ok(())
    }

    fn optimizer_state(&self) -> NamedTensors {
        let mut t = NamedTensors::new();
        t.insert(
            "momentum".to_string(),
            Tensor::from_f32(vec![1], vec![0.9]).unwrap(),
        );
        t
    }

    fn load_optimizer_state(&mut self, state: &NamedTensors) -> Result<(), EvalError> {
        assert!(state.contains_key("momentum"));
        Ok(())
    }
}

/// Play short fake episodes: ask for an evaluation, pretend to move, push a
/// trajectory at episode end.
fn run_actor(handle: ActorHandle, episodes: usize, terminated: Arc<AtomicBool>) {
    for _ in 0..episodes {
        if terminated.load(Ordering::Relaxed) {
            return;
        }
        let steps = 4usize;
        let mut obs_rows = Vec::new();
        for _ in 0..steps {
            let mut batch = NamedTensors::new();
            batch.insert(schema::OBS.to_string(), Tensor::zeros_f32(vec![1, 1, 2, 2]));
            batch.insert(
                schema::POLICY_MASK.to_string(),
                Tensor::from_u8(vec![1, 4], vec![1; 4]).unwrap(),
            );
            let Ok(reply) = handle.infer(batch) else {
                return;
            };
            obs_rows.push(reply[schema::POLICY].as_f32().unwrap()[0]);
        }

        let n = steps;
        let mut traj = NamedTensors::new();
        traj.insert(
            schema::OBS.to_string(),
            Tensor::from_f32(vec![n, 1, 2, 2], vec![0.0; n * 4]).unwrap(),
        );
        traj.insert(
            schema::VALUE.to_string(),
            Tensor::from_f32(vec![n, 1], obs_rows.clone()).unwrap(),
        );
        traj.insert(
            schema::POLICY.to_string(),
            Tensor::from_f32(vec![n, 4], vec![0.25; n * 4]).unwrap(),
        );
        traj.insert(
            schema::POLICY_MASK.to_string(),
            Tensor::from_u8(vec![n, 4], vec![1; n * 4]).unwrap(),
        );
        if handle.push_trajectory(traj).is_err() {
            return;
        }
    }
}

fn manager_for(config: &Config) -> ModelManager {
    ModelManager::new(ManagerConfig::from_simulation(&config.simulation))
}

#[test]
fn selfplay_train_checkpoint_resume() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.simulation.num_actor = 4;
    config.simulation.replay_capacity = 256;
    config.simulation.replay_warmup = 32;
    config.simulation.train_channel_slots = 16;
    config.simulation.train_channel_timeout_ms = 5;
    config.optim.batchsize = 8;
    config.optim.epoch_len = 5;
    config.optim.num_epoch = 2;
    config.optim.sync_period = 5;
    config.optim.lr = 2e-3;
    config.execution.saving_period = 2;
    config.execution.checkpoint_dir = dir.path().to_path_buf();
    config.execution.compression = Compression::Gzip;
    config.validate().unwrap();

    let registry = EvaluatorRegistry::new();
    registry.validate(&config.model.kind).unwrap();
    let evaluator = registry.build(&config.game, &config.model).unwrap();

    let manager = Arc::new(manager_for(&config));
    let terminated = Arc::new(AtomicBool::new(false));

    let serving = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || manager.serve_inference(evaluator.as_ref()))
    };
    let mut actors = Vec::new();
    for _ in 0..config.simulation.num_actor {
        let handle = manager.actor_handle();
        let terminated = Arc::clone(&terminated);
        actors.push(std::thread::spawn(move || {
            run_actor(handle, 64, terminated)
        }));
    }

    warm_up_replay_buffer(&manager, config.simulation.replay_warmup, &terminated).unwrap();

    let history = CommandHistory::from_invocation(["optim.lr"]);
    let mut train = TrainLoop {
        manager: &manager,
        config: &config,
        history: history.clone(),
        events: NdjsonWriter::open_append(dir.path().join("events.ndjson")).unwrap(),
        terminated: Arc::clone(&terminated),
    };
    let mut model = StubModel { steps: 0 };
    let last_epoch = train.run(&mut model, 0).unwrap();
    assert_eq!(last_epoch, 2);
    assert_eq!(model.steps, 10);

    terminated.store(true, Ordering::Relaxed);
    manager.terminate();
    for a in actors {
        a.join().unwrap();
    }
    serving.join().unwrap().unwrap();
    manager.join().unwrap();

    // Resume: the checkpoint carries weights, optimizer state, buffer and the
    // reconciled configuration.
    let latest = sp_checkpoint::latest(dir.path()).unwrap().unwrap();
    let checkpoint = sp_checkpoint::load(&latest).unwrap();

    let resumed = sp_checkpoint::update_params_from_checkpoint(
        checkpoint,
        Config {
            execution: config.execution.clone(),
            simulation: config.simulation.clone(),
            ..Config::default()
        },
        CommandHistory::from_invocation(Vec::<String>::new()),
    )
    .unwrap();
    // optim.lr was explicitly set on the first invocation; it sticks.
    assert_eq!(resumed.config.optim.lr, 2e-3);
    assert_eq!(resumed.epoch, 2);

    let mut resumed_model = StubModel { steps: 0 };
    resumed_model.load_weights(&resumed.weights).unwrap();
    resumed_model
        .load_optimizer_state(&resumed.optim_state)
        .unwrap();
    assert_eq!(resumed_model.steps, 10);

    let replay_blob = resumed.replay.expect("buffer saved by default");
    let buffer = sp_replay::restore(
        &replay_blob,
        resumed.config.simulation.replay_capacity,
        resumed.config.simulation.seed,
    )
    .unwrap();
    assert!(buffer.size() >= config.simulation.replay_warmup.min(buffer.capacity()));
    let batch = buffer.sample(4).unwrap();
    assert_eq!(batch[schema::OBS].shape(), &[4, 1, 2, 2]);
}
