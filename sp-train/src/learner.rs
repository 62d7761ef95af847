//! Replay warmup and the epoch loop.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sp_checkpoint::Checkpoint;
use sp_core::config::Config;
use sp_core::history::CommandHistory;
use sp_core::model::TrainableModel;
use sp_logging::{CheckpointEventV1, NdjsonWriter, RateStatusEventV1, TrainEpochEventV1};
use sp_manager::ModelManager;

use crate::rate::RateBalancer;
use crate::TrainError;

const WARMUP_POLL: Duration = Duration::from_millis(200);

/// Block until the buffer holds at least `warmup` slots, printing progress.
///
/// Polls cooperatively: a terminate request is honored at every iteration.
pub fn warm_up_replay_buffer(
    manager: &ModelManager,
    warmup: usize,
    terminated: &AtomicBool,
) -> Result<(), TrainError> {
    let t_init = Instant::now();
    let mut prev_size = usize::MAX;
    loop {
        if terminated.load(Ordering::Relaxed) {
            return Err(TrainError::Terminated);
        }
        let size = manager.buffer_size();
        if size >= warmup {
            eprintln!(
                "replay buffer warmed up: {size}/{warmup} in {:.1}s",
                t_init.elapsed().as_secs_f64()
            );
            return Ok(());
        }
        if size != prev_size {
            prev_size = size;
            eprintln!(
                "warming up replay buffer: {}% ({size}/{warmup})",
                (size * 100) / warmup.max(1)
            );
        }
        std::thread::sleep(WARMUP_POLL);
    }
}

/// The learner loop for one training run.
pub struct TrainLoop<'a> {
    pub manager: &'a ModelManager,
    pub config: &'a Config,
    pub history: CommandHistory,
    pub events: NdjsonWriter,
    pub terminated: Arc<AtomicBool>,
}

impl TrainLoop<'_> {
    /// Run `optim.num_epoch` epochs starting after `start_epoch`; returns the
    /// last completed epoch. Checkpoints land every `saving_period` epochs
    /// and once more at the end.
    pub fn run(
        &mut self,
        model: &mut dyn TrainableModel,
        start_epoch: u64,
    ) -> Result<u64, TrainError> {
        let mut balancer = RateBalancer::new(&self.config.execution.rate);
        balancer.update(
            self.manager.buffer_num_add(),
            self.manager.buffer_num_sample(),
            Duration::from_secs(1),
        );

        let mut epoch = start_epoch;
        for _ in 0..self.config.optim.num_epoch {
            if self.terminated.load(Ordering::Relaxed) {
                break;
            }
            epoch += 1;
            if (epoch - start_epoch) % u64::from(self.config.execution.saving_period) == 0 {
                self.manager
                    .add_tournament_model(format!("e{epoch}"), model.weights());
                self.save_checkpoint(model, epoch)?;
            }
            self.train_epoch(model, epoch, &mut balancer)?;
        }

        self.save_checkpoint(model, epoch)?;
        Ok(epoch)
    }

    fn train_epoch(
        &mut self,
        model: &mut dyn TrainableModel,
        epoch: u64,
        balancer: &mut RateBalancer,
    ) -> Result<(), TrainError> {
        let epoch_len = u64::from(self.config.optim.epoch_len);
        let sync_period = u64::from(self.config.optim.sync_period);
        let t0 = Instant::now();

        // Epoch-boundary throttle: pause while sampling outruns generation.
        let was_throttled = balancer.throttled();
        while balancer.throttled() && !self.terminated.load(Ordering::Relaxed) {
            std::thread::sleep(balancer.backoff());
            balancer.update(
                self.manager.buffer_num_add(),
                self.manager.buffer_num_sample(),
                balancer.backoff(),
            );
        }
        if was_throttled {
            self.rate_event(balancer)?;
        }

        let mut last = Default::default();
        let mut sync_count = 0u32;
        for eid in 0..epoch_len {
            if self.terminated.load(Ordering::Relaxed) {
                return Ok(());
            }
            let batch = self.manager.sample(self.config.optim.batchsize)?;
            last = model.train_step(&batch)?;
            if ((epoch - 1) * epoch_len + eid + 1) % sync_period == 0 {
                self.manager.update_model(model.weights())?;
                sync_count += 1;
            }
        }

        let num_add = self.manager.buffer_num_add();
        let num_sample = self.manager.buffer_num_sample();
        balancer.update(num_add, num_sample, t0.elapsed());
        if balancer.throttled() {
            eprintln!(
                "warning: sample rate {:.1}/s outruns add rate {:.1}/s (threshold {:.2}x)",
                balancer.sample_rate(),
                balancer.add_rate(),
                balancer.threshold_factor()
            );
            self.rate_event(balancer)?;
        }

        self.events.write_event(&TrainEpochEventV1 {
            event: "train_epoch",
            ts_ms: sp_logging::now_ms(),
            epoch,
            loss_total: last.total,
            loss_policy: last.policy,
            loss_value: last.value,
            buffer_size: self.manager.buffer_size(),
            buffer_num_add: num_add,
            buffer_num_sample: num_sample,
            add_rate: balancer.add_rate(),
            sample_rate: balancer.sample_rate(),
            sync_count,
        })?;
        self.events.flush()?;
        Ok(())
    }

    fn rate_event(&mut self, balancer: &RateBalancer) -> Result<(), TrainError> {
        self.events.write_event(&RateStatusEventV1 {
            event: "rate_status",
            ts_ms: sp_logging::now_ms(),
            add_rate: balancer.add_rate(),
            sample_rate: balancer.sample_rate(),
            threshold_factor: balancer.threshold_factor(),
            throttled: balancer.throttled(),
        })?;
        Ok(())
    }

    fn save_checkpoint(
        &mut self,
        model: &mut dyn TrainableModel,
        epoch: u64,
    ) -> Result<(), TrainError> {
        let replay = if self.config.execution.save_replay_buffer {
            Some(self.manager.export_buffer()?)
        } else {
            None
        };
        let with_buffer = replay.is_some();
        let checkpoint = Checkpoint {
            epoch,
            config: self.config.clone(),
            history: self.history.clone(),
            weights: model.weights(),
            optim_state: model.optimizer_state(),
            replay,
        };
        let path = sp_checkpoint::save(
            checkpoint_dir(self.config),
            &checkpoint,
            self.config.execution.compression,
        )?;
        self.events.write_event(&CheckpointEventV1 {
            event: "checkpoint_saved",
            ts_ms: sp_logging::now_ms(),
            epoch,
            path: path.display().to_string(),
            with_buffer,
        })?;
        self.events.flush()?;
        Ok(())
    }
}

fn checkpoint_dir(config: &Config) -> &Path {
    config.execution.checkpoint_dir.as_path()
}

#[cfg(test)]
mod tests {
    use super::*;

    use sp_core::model::{EvalError, LossStats, WeightsSnapshot};
    use sp_core::schema;
    use sp_core::tensor::{NamedTensors, Tensor};
    use sp_manager::ManagerConfig;

    struct CountingModel {
        steps: u64,
    }

    impl TrainableModel for CountingModel {
        fn train_step(&mut self, batch: &NamedTensors) -> Result<LossStats, EvalError> {
            assert!(batch.contains_key(schema::OBS));
            self.steps += 1;
            Ok(LossStats {
                total: 1.0 / self.steps as f32,
                policy: 0.5,
                value: 0.25,
                grad_norm: 1.0,
            })
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
            NamedTensors::new()
        }

        fn load_optimizer_state(&mut self, _state: &NamedTensors) -> Result<(), EvalError> {
            Ok(())
        }
    }

    fn trajectory(n: usize) -> NamedTensors {
        let mut b = NamedTensors::new();
        b.insert(
            schema::OBS.to_string(),
            Tensor::from_f32(vec![n, 1, 2, 2], vec![0.0; n * 4]).unwrap(),
        );
        b.insert(
            schema::VALUE.to_string(),
            Tensor::from_f32(vec![n, 1], vec![0.0; n]).unwrap(),
        );
        b.insert(
            schema::POLICY.to_string(),
            Tensor::from_f32(vec![n, 4], vec![0.25; n * 4]).unwrap(),
        );
        b.insert(
            schema::POLICY_MASK.to_string(),
            Tensor::from_u8(vec![n, 4], vec![1; n * 4]).unwrap(),
        );
        b
    }

    fn manager() -> ModelManager {
        ModelManager::new(ManagerConfig {
            act_collect_timeout: Duration::from_millis(5),
            replay_capacity: 128,
            train_channel_slots: 8,
            train_channel_timeout: Duration::from_millis(5),
            seed: 1,
        })
    }

    #[test]
    fn warmup_returns_once_the_buffer_is_occupied() {
        let mgr = manager();
        let actor = mgr.actor_handle();
        let terminated = AtomicBool::new(false);
        actor.push_trajectory(trajectory(8)).unwrap();
        warm_up_replay_buffer(&mgr, 8, &terminated).unwrap();
        assert!(mgr.buffer_size() >= 8);
    }

    #[test]
    fn warmup_honors_termination() {
        let mgr = manager();
        let terminated = Arc::new(AtomicBool::new(false));
        let t = {
            let flag = Arc::clone(&terminated);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::Relaxed);
            })
        };
        let err = warm_up_replay_buffer(&mgr, 1_000_000, &terminated).unwrap_err();
        assert!(matches!(err, TrainError::Terminated));
        t.join().unwrap();
    }

    #[test]
    fn epochs_step_sync_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        mgr.actor_handle().push_trajectory(trajectory(16)).unwrap();
        while mgr.buffer_size() < 16 {
            std::thread::yield_now();
        }

        let mut config = Config::default();
        config.optim.batchsize = 4;
        config.optim.epoch_len = 4;
        config.optim.num_epoch = 2;
        config.optim.sync_period = 4;
        config.execution.saving_period = 1;
        config.execution.checkpoint_dir = dir.path().to_path_buf();
        config.execution.compression = sp_core::config::Compression::Uncompressed;

        let mut train = TrainLoop {
            manager: &mgr,
            config: &config,
            history: CommandHistory::from_invocation(Vec::<String>::new()),
            events: NdjsonWriter::open_append(dir.path().join("events.ndjson")).unwrap(),
            terminated: Arc::new(AtomicBool::new(false)),
        };
        let mut model = CountingModel { steps: 0 };
        let last_epoch = train.run(&mut model, 0).unwrap();

        assert_eq!(last_epoch, 2);
        assert_eq!(model.steps, 8);
        // Two optimizer steps per sync period of 4 over 8 steps.
        assert_eq!(
            mgr.current_weights().tensors["steps"].as_f32().unwrap()[0],
            8.0
        );
        assert_eq!(mgr.buffer_num_sample(), 8 * 4);

        let latest = sp_checkpoint::latest(dir.path()).unwrap().unwrap();
        let ckpt = sp_checkpoint::load(&latest).unwrap();
        assert_eq!(ckpt.epoch, 2);
        assert!(ckpt.replay.is_some());

        // The tournament registry holds the periodic frozen snapshots.
        assert_eq!(mgr.tournament_tags(), vec!["e1".to_string(), "e2".to_string()]);
    }
}
