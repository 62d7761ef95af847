//! Configuration groups for a training run.
//!
//! The same YAML file drives local training, server/client deployments and
//! resumption; resume-time merging with a checkpoint's stored groups lives in
//! the checkpoint crate and is driven by [`crate::CommandHistory`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{CommandHistory, MergeError, Reconcile};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("server_listen_endpoint and client_connect_endpoint are both set")]
    ConflictingEndpoints,
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optim: OptimConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// Identity of the game being trained on.
///
/// All fields except `name` are locked across resumptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Game variant name; the one identity field allowed to change on resume.
    pub name: String,
    /// Observation planes, `[C, H, W]`.
    pub obs_shape: [usize; 3],
    /// Action-space shape (spatial policy head shape).
    pub action_shape: Vec<usize>,
    /// Length of the value target vector (1 for a scalar).
    #[serde(default = "default_value_len")]
    pub value_len: usize,
    #[serde(default)]
    pub one_player: bool,
}

fn default_value_len() -> usize {
    1
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            name: "connect4".to_string(),
            obs_shape: [3, 6, 7],
            action_shape: vec![7],
            value_len: default_value_len(),
            one_player: false,
        }
    }
}

/// Model architecture identity; locked across resumptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Evaluator kind, resolved against the registry at start-up.
    #[serde(default = "default_model_kind")]
    pub kind: String,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: u32,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: u32,
    /// Sequence length for recurrent training; 0 means feedforward.
    #[serde(default)]
    pub seq_len: u32,
}

fn default_model_kind() -> String {
    "uniform".to_string()
}

fn default_hidden_dim() -> u32 {
    256
}

fn default_num_blocks() -> u32 {
    2
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: default_model_kind(),
            hidden_dim: default_hidden_dim(),
            num_blocks: default_num_blocks(),
            seq_len: 0,
        }
    }
}

/// Optimizer / learner loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    pub batchsize: usize,
    /// Optimizer steps per epoch.
    pub epoch_len: u32,
    pub num_epoch: u32,
    pub lr: f64,
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f32,
    /// Steps between weight publications to the actors.
    #[serde(default = "default_sync_period")]
    pub sync_period: u32,
}

fn default_grad_clip() -> f32 {
    1.0
}

fn default_sync_period() -> u32 {
    32
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            batchsize: 128,
            epoch_len: 1000,
            num_epoch: 100,
            lr: 1e-3,
            grad_clip: default_grad_clip(),
            sync_period: default_sync_period(),
        }
    }
}

/// Self-play generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Concurrently playing game instances.
    pub num_actor: usize,
    /// Max rows collected into one evaluation call.
    pub act_batchsize: usize,
    pub replay_capacity: usize,
    /// Minimum buffer occupancy before training may sample.
    pub replay_warmup: usize,
    pub train_channel_slots: usize,
    pub train_channel_timeout_ms: u64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_actor: 8,
            act_batchsize: 64,
            replay_capacity: 100_000,
            replay_warmup: 10_000,
            train_channel_slots: 128,
            train_channel_timeout_ms: 1000,
            seed: 1,
        }
    }
}

/// Checkpoint container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Uncompressed,
    Gzip,
    Zip,
}

/// Rate-balancer settings: throttle the learner while the smoothed sample
/// rate exceeds `threshold_factor` times the smoothed add rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_threshold_factor")]
    pub threshold_factor: f64,
    /// Per-second EWMA decay; history is discounted as `decay^elapsed_secs`.
    #[serde(default = "default_rate_decay")]
    pub decay: f64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_threshold_factor() -> f64 {
    1.4
}

fn default_rate_decay() -> f64 {
    0.9
}

fn default_backoff_ms() -> u64 {
    500
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            threshold_factor: default_threshold_factor(),
            decay: default_rate_decay(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Run orchestration: checkpointing, network role, throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub checkpoint_dir: PathBuf,
    /// Epochs between checkpoint saves.
    #[serde(default = "default_saving_period")]
    pub saving_period: u32,
    #[serde(default = "default_compression")]
    pub compression: Compression,
    #[serde(default = "default_save_replay_buffer")]
    pub save_replay_buffer: bool,
    /// `tcp://host:port` to listen on (server role).
    #[serde(default)]
    pub server_listen_endpoint: Option<String>,
    /// `tcp://host:port` to connect to (client role).
    #[serde(default)]
    pub client_connect_endpoint: Option<String>,
    /// Start from a pretrained checkpoint instead of a fresh model.
    #[serde(default)]
    pub init_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub rate: RateConfig,
}

fn default_saving_period() -> u32 {
    10
}

fn default_compression() -> Compression {
    Compression::Gzip
}

fn default_save_replay_buffer() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            saving_period: default_saving_period(),
            compression: default_compression(),
            save_replay_buffer: default_save_replay_buffer(),
            server_listen_endpoint: None,
            client_connect_endpoint: None,
            init_checkpoint: None,
            rate: RateConfig::default(),
        }
    }
}

/// Multi-process training group membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default)]
    pub rank: usize,
    /// `tcp://host:port` of rank 0's rendezvous listener.
    #[serde(default)]
    pub rendezvous: Option<String>,
    /// Let non-zero ranks prefetch their next shard over the wire.
    #[serde(default)]
    pub remote_replay: bool,
}

fn default_world_size() -> usize {
    1
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            rank: 0,
            rendezvous: None,
            remote_replay: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that must fail before any training step runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.server_listen_endpoint.is_some()
            && self.execution.client_connect_endpoint.is_some()
        {
            return Err(ConfigError::ConflictingEndpoints);
        }
        if self.simulation.replay_capacity == 0 {
            return Err(ConfigError::Invalid("replay_capacity must be > 0"));
        }
        if self.optim.batchsize == 0 {
            return Err(ConfigError::Invalid("batchsize must be > 0"));
        }
        if self.simulation.act_batchsize == 0 {
            return Err(ConfigError::Invalid("act_batchsize must be > 0"));
        }
        if self.optim.sync_period == 0 {
            return Err(ConfigError::Invalid("sync_period must be > 0"));
        }
        if !(self.execution.rate.threshold_factor > 0.0) {
            return Err(ConfigError::Invalid("rate.threshold_factor must be > 0"));
        }
        if !(self.execution.rate.decay > 0.0 && self.execution.rate.decay < 1.0) {
            return Err(ConfigError::Invalid("rate.decay must be in (0, 1)"));
        }
        if self.distributed.world_size == 0 {
            return Err(ConfigError::Invalid("world_size must be > 0"));
        }
        if self.distributed.rank >= self.distributed.world_size {
            return Err(ConfigError::Invalid("rank must be < world_size"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            game: GameConfig::default(),
            model: ModelConfig::default(),
            optim: OptimConfig::default(),
            simulation: SimulationConfig::default(),
            execution: ExecutionConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

impl Reconcile for OptimConfig {
    fn reconcile(h: &CommandHistory, resume: &Self, ckpt: &Self) -> Self {
        Self {
            batchsize: h.resolve("optim.batchsize", &resume.batchsize, &ckpt.batchsize),
            epoch_len: h.resolve("optim.epoch_len", &resume.epoch_len, &ckpt.epoch_len),
            num_epoch: h.resolve("optim.num_epoch", &resume.num_epoch, &ckpt.num_epoch),
            lr: h.resolve("optim.lr", &resume.lr, &ckpt.lr),
            grad_clip: h.resolve("optim.grad_clip", &resume.grad_clip, &ckpt.grad_clip),
            sync_period: h.resolve("optim.sync_period", &resume.sync_period, &ckpt.sync_period),
        }
    }
}

impl Reconcile for SimulationConfig {
    fn reconcile(h: &CommandHistory, resume: &Self, ckpt: &Self) -> Self {
        Self {
            num_actor: h.resolve("simulation.num_actor", &resume.num_actor, &ckpt.num_actor),
            act_batchsize: h.resolve(
                "simulation.act_batchsize",
                &resume.act_batchsize,
                &ckpt.act_batchsize,
            ),
            replay_capacity: h.resolve(
                "simulation.replay_capacity",
                &resume.replay_capacity,
                &ckpt.replay_capacity,
            ),
            replay_warmup: h.resolve(
                "simulation.replay_warmup",
                &resume.replay_warmup,
                &ckpt.replay_warmup,
            ),
            train_channel_slots: h.resolve(
                "simulation.train_channel_slots",
                &resume.train_channel_slots,
                &ckpt.train_channel_slots,
            ),
            train_channel_timeout_ms: h.resolve(
                "simulation.train_channel_timeout_ms",
                &resume.train_channel_timeout_ms,
                &ckpt.train_channel_timeout_ms,
            ),
            seed: h.resolve("simulation.seed", &resume.seed, &ckpt.seed),
        }
    }
}

impl Reconcile for RateConfig {
    fn reconcile(h: &CommandHistory, resume: &Self, ckpt: &Self) -> Self {
        Self {
            threshold_factor: h.resolve(
                "execution.rate.threshold_factor",
                &resume.threshold_factor,
                &ckpt.threshold_factor,
            ),
            decay: h.resolve("execution.rate.decay", &resume.decay, &ckpt.decay),
            backoff_ms: h.resolve("execution.rate.backoff_ms", &resume.backoff_ms, &ckpt.backoff_ms),
        }
    }
}

impl Reconcile for ExecutionConfig {
    fn reconcile(h: &CommandHistory, resume: &Self, ckpt: &Self) -> Self {
        Self {
            checkpoint_dir: h.resolve(
                "execution.checkpoint_dir",
                &resume.checkpoint_dir,
                &ckpt.checkpoint_dir,
            ),
            saving_period: h.resolve(
                "execution.saving_period",
                &resume.saving_period,
                &ckpt.saving_period,
            ),
            compression: h.resolve(
                "execution.compression",
                &resume.compression,
                &ckpt.compression,
            ),
            save_replay_buffer: h.resolve(
                "execution.save_replay_buffer",
                &resume.save_replay_buffer,
                &ckpt.save_replay_buffer,
            ),
            server_listen_endpoint: h.resolve(
                "execution.server_listen_endpoint",
                &resume.server_listen_endpoint,
                &ckpt.server_listen_endpoint,
            ),
            client_connect_endpoint: h.resolve(
                "execution.client_connect_endpoint",
                &resume.client_connect_endpoint,
                &ckpt.client_connect_endpoint,
            ),
            // A pretrained start never carries over into later resumptions.
            init_checkpoint: resume.init_checkpoint.clone(),
            rate: RateConfig::reconcile(h, &resume.rate, &ckpt.rate),
        }
    }
}

impl GameConfig {
    /// Adopt the checkpoint's stored game identity, asserting that any newly
    /// supplied locked field matches it. `game.name` may change.
    pub fn adopt_from_checkpoint(
        history: &CommandHistory,
        supplied: &Self,
        stored: &Self,
    ) -> Result<Self, MergeError> {
        history.check_locked("game.obs_shape", &supplied.obs_shape, &stored.obs_shape)?;
        history.check_locked(
            "game.action_shape",
            &supplied.action_shape,
            &stored.action_shape,
        )?;
        history.check_locked("game.value_len", &supplied.value_len, &stored.value_len)?;
        history.check_locked("game.one_player", &supplied.one_player, &stored.one_player)?;
        let mut out = stored.clone();
        if history.last_command_contains("game.name") {
            out.name = supplied.name.clone();
        }
        Ok(out)
    }
}

impl ModelConfig {
    /// Adopt the checkpoint's stored architecture; every field is locked.
    pub fn adopt_from_checkpoint(
        history: &CommandHistory,
        supplied: &Self,
        stored: &Self,
    ) -> Result<Self, MergeError> {
        history.check_locked("model.kind", &supplied.kind, &stored.kind)?;
        history.check_locked("model.hidden_dim", &supplied.hidden_dim, &stored.hidden_dim)?;
        history.check_locked("model.num_blocks", &supplied.num_blocks, &stored.num_blocks)?;
        history.check_locked("model.seq_len", &supplied.seq_len, &stored.seq_len)?;
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parse_yaml_with_defaults() {
        let yaml = r#"
game:
  name: "hex11"
  obs_shape: [2, 11, 11]
  action_shape: [11, 11]

optim:
  batchsize: 64
  epoch_len: 200
  num_epoch: 10
  lr: 0.0005

simulation:
  num_actor: 4
  act_batchsize: 16
  replay_capacity: 5000
  replay_warmup: 500
  train_channel_slots: 32
  train_channel_timeout_ms: 250
  seed: 7

execution:
  checkpoint_dir: "runs/hex11"
  compression: "zip"
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.game.name, "hex11");
        assert_eq!(cfg.game.value_len, 1);
        assert_eq!(cfg.optim.sync_period, 32);
        assert_eq!(cfg.execution.compression, Compression::Zip);
        assert!((cfg.execution.rate.threshold_factor - 1.4).abs() < 1e-9);
    }

    #[test]
    fn both_endpoints_is_fatal() {
        let mut cfg = Config::default();
        cfg.execution.server_listen_endpoint = Some("tcp://0.0.0.0:5611".to_string());
        cfg.execution.client_connect_endpoint = Some("tcp://10.0.0.1:5611".to_string());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ConflictingEndpoints)
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut cfg = Config::default();
        cfg.simulation.replay_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reconcile_prefers_checkpoint_for_formerly_set_field() {
        let mut h = CommandHistory::from_invocation(Vec::<String>::new());
        h.prepend(&CommandHistory::from_invocation(["optim.lr"]));

        let resume = OptimConfig::default();
        let mut ckpt = OptimConfig::default();
        ckpt.lr = 5e-4;
        let merged = OptimConfig::reconcile(&h, &resume, &ckpt);
        assert_eq!(merged.lr, 5e-4);
        assert_eq!(merged.batchsize, resume.batchsize);
    }

    #[test]
    fn game_name_may_change_but_shape_may_not() {
        let mut h = CommandHistory::from_invocation(["game.name", "game.obs_shape"]);
        h.prepend(&CommandHistory::from_invocation(Vec::<String>::new()));

        let stored = GameConfig::default();
        let mut supplied = stored.clone();
        supplied.name = "connect4_variant".to_string();
        supplied.obs_shape = [5, 6, 7];

        let err = GameConfig::adopt_from_checkpoint(&h, &supplied, &stored).unwrap_err();
        assert!(err.to_string().contains("game.obs_shape"));

        supplied.obs_shape = stored.obs_shape;
        let merged = GameConfig::adopt_from_checkpoint(&h, &supplied, &stored).unwrap();
        assert_eq!(merged.name, "connect4_variant");
    }
}
