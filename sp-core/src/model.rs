//! Evaluator/model capability interfaces and the start-up-validated registry.
//!
//! The coordination core never touches network numerics; it sees a model only
//! through these seams: `Evaluator` answers observation batches for the
//! actors, `TrainableModel` consumes sampled batches on the learner side.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::config::{GameConfig, ModelConfig};
use crate::schema;
use crate::tensor::{self, NamedTensors, Tensor, TensorError};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown evaluator kind '{0}'")]
    UnknownKind(String),
    #[error("evaluation batch is missing field '{0}'")]
    MissingField(&'static str),
    #[error("bad evaluation batch: {0}")]
    BadBatch(&'static str),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// An immutable set of model weights, swapped whole. "Latest wins": identity
/// is the Arc pointer, not an explicit version counter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightsSnapshot {
    pub tensors: NamedTensors,
}

impl WeightsSnapshot {
    pub fn new(tensors: NamedTensors) -> Self {
        Self { tensors }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TensorError> {
        tensor::to_safetensors(&self.tensors, None)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TensorError> {
        let (tensors, _meta) = tensor::from_safetensors(bytes)?;
        Ok(Self { tensors })
    }
}

/// Answers observation batches: `{s, pi_mask}` in, `{v, pi}` out, row for row.
pub trait Evaluator: Send + Sync {
    fn evaluate(
        &self,
        weights: &WeightsSnapshot,
        batch: &NamedTensors,
    ) -> Result<NamedTensors, EvalError>;
}

/// Learner-side seam: one optimizer step on a sampled batch, plus access to
/// the state a checkpoint needs.
pub trait TrainableModel: Send {
    fn train_step(&mut self, batch: &NamedTensors) -> Result<LossStats, EvalError>;
    fn weights(&self) -> WeightsSnapshot;
    fn load_weights(&mut self, weights: &WeightsSnapshot) -> Result<(), EvalError>;
    fn optimizer_state(&self) -> NamedTensors;
    fn load_optimizer_state(&mut self, state: &NamedTensors) -> Result<(), EvalError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LossStats {
    pub total: f32,
    pub policy: f32,
    pub value: f32,
    pub grad_norm: f32,
}

pub type EvaluatorCtor = fn(&GameConfig, &ModelConfig) -> Arc<dyn Evaluator>;

/// Name → constructor map, checked once at start-up so an unknown kind fails
/// before any thread is spawned.
pub struct EvaluatorRegistry {
    ctors: FxHashMap<String, EvaluatorCtor>,
}

impl EvaluatorRegistry {
    /// Registry with the built-in kinds.
    pub fn new() -> Self {
        let mut ctors: FxHashMap<String, EvaluatorCtor> = FxHashMap::default();
        ctors.insert("uniform".to_string(), uniform_ctor);
        Self { ctors }
    }

    pub fn register(&mut self, kind: impl Into<String>, ctor: EvaluatorCtor) {
        self.ctors.insert(kind.into(), ctor);
    }

    pub fn validate(&self, kind: &str) -> Result<(), EvalError> {
        if self.ctors.contains_key(kind) {
            Ok(())
        } else {
            Err(EvalError::UnknownKind(kind.to_string()))
        }
    }

    pub fn build(
        &self,
        game: &GameConfig,
        model: &ModelConfig,
    ) -> Result<Arc<dyn Evaluator>, EvalError> {
        let ctor = self
            .ctors
            .get(&model.kind)
            .ok_or_else(|| EvalError::UnknownKind(model.kind.clone()))?;
        Ok(ctor(game, model))
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn uniform_ctor(game: &GameConfig, _model: &ModelConfig) -> Arc<dyn Evaluator> {
    Arc::new(UniformEvaluator {
        value_len: game.value_len,
    })
}

/// Weight-free evaluator: uniform policy over the legal mask, zero value.
/// Useful for wiring tests and as the cold-start opponent.
struct UniformEvaluator {
    value_len: usize,
}

impl Evaluator for UniformEvaluator {
    fn evaluate(
        &self,
        _weights: &WeightsSnapshot,
        batch: &NamedTensors,
    ) -> Result<NamedTensors, EvalError> {
        let mask = batch
            .get(schema::POLICY_MASK)
            .ok_or(EvalError::MissingField(schema::POLICY_MASK))?;
        let rows = mask.rows()?;
        let mask_data = mask
            .as_u8()
            .ok_or(EvalError::BadBatch("pi_mask must be u8"))?;
        let per_row = if rows == 0 { 0 } else { mask_data.len() / rows };

        let mut pi = vec![0.0f32; mask_data.len()];
        for r in 0..rows {
            let row = &mask_data[r * per_row..(r + 1) * per_row];
            let legal = row.iter().filter(|&&m| m != 0).count();
            if legal == 0 {
                return Err(EvalError::BadBatch("row with no legal action"));
            }
            let p = 1.0 / legal as f32;
            for (i, &m) in row.iter().enumerate() {
                if m != 0 {
                    pi[r * per_row + i] = p;
                }
            }
        }

        let mut out = NamedTensors::new();
        out.insert(
            schema::POLICY.to_string(),
            Tensor::from_f32(mask.shape().to_vec(), pi)?,
        );
        out.insert(
            schema::VALUE.to_string(),
            Tensor::zeros_f32(vec![rows, self.value_len]),
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_kind() {
        let reg = EvaluatorRegistry::new();
        assert!(reg.validate("uniform").is_ok());
        assert!(matches!(
            reg.validate("resnet_v9"),
            Err(EvalError::UnknownKind(_))
        ));
    }

    #[test]
    fn uniform_evaluator_spreads_mass_over_legal_entries() {
        let reg = EvaluatorRegistry::new();
        let game = GameConfig::default();
        let model = ModelConfig::default();
        let eval = reg.build(&game, &model).unwrap();

        let mut batch = NamedTensors::new();
        batch.insert(
            schema::OBS.to_string(),
            Tensor::zeros_f32(vec![2, 3, 6, 7]),
        );
        batch.insert(
            schema::POLICY_MASK.to_string(),
            Tensor::from_u8(vec![2, 4], vec![1, 1, 0, 0, 1, 1, 1, 1]).unwrap(),
        );

        let reply = eval
            .evaluate(&WeightsSnapshot::default(), &batch)
            .unwrap();
        let pi = reply[schema::POLICY].as_f32().unwrap();
        assert_eq!(&pi[..4], &[0.5, 0.5, 0.0, 0.0]);
        assert_eq!(&pi[4..], &[0.25; 4]);
        assert_eq!(reply[schema::VALUE].shape(), &[2, 1]);
    }

    #[test]
    fn weights_roundtrip_bytes() {
        let mut tensors = NamedTensors::new();
        tensors.insert(
            "conv1.weight".to_string(),
            Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );
        let w = WeightsSnapshot::new(tensors);
        let bytes = w.to_bytes().unwrap();
        let back = WeightsSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back, w);
    }
}
