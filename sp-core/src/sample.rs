//! Training samples as produced by actors.
//!
//! A [`Sample`] is one labeled decision point; a [`SampleSeq`] is a
//! fixed-length run of steps from a single episode segment, used as the slot
//! unit for recurrent models. Both are immutable once built and convert into
//! a named batch whose ownership moves into the replay buffer.

use thiserror::Error;

use crate::schema;
use crate::tensor::{stack_named, Dtype, NamedTensors, Tensor, TensorError};

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("policy mask shape {got:?} does not match policy shape {expected:?}")]
    MaskShape { expected: Vec<usize>, got: Vec<usize> },
    #[error("field '{field}' must be {expected:?}")]
    FieldDtype { field: &'static str, expected: Dtype },
    #[error("aux mask shape {got:?} does not match aux target shape {expected:?}")]
    AuxMaskShape { expected: Vec<usize>, got: Vec<usize> },
    #[error("sequence is empty")]
    EmptySeq,
    #[error("continue mask length {got} does not match sequence length {expected}")]
    ContinueLen { expected: usize, got: usize },
    #[error("steps in a sequence disagree on optional fields or shapes")]
    MixedSteps,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// One observation with its training targets.
#[derive(Debug, Clone)]
pub struct Sample {
    obs: Tensor,
    value: Tensor,
    policy: Tensor,
    policy_mask: Tensor,
    aux: Option<(Tensor, Tensor)>,
    rnn_state: Option<Tensor>,
}

impl Sample {
    pub fn new(
        obs: Tensor,
        value: Tensor,
        policy: Tensor,
        policy_mask: Tensor,
    ) -> Result<Self, SampleError> {
        for (field, t) in [
            (schema::OBS, &obs),
            (schema::VALUE, &value),
            (schema::POLICY, &policy),
        ] {
            if t.dtype() != Dtype::F32 {
                return Err(SampleError::FieldDtype {
                    field,
                    expected: Dtype::F32,
                });
            }
        }
        if policy_mask.dtype() != Dtype::U8 {
            return Err(SampleError::FieldDtype {
                field: schema::POLICY_MASK,
                expected: Dtype::U8,
            });
        }
        if policy_mask.shape() != policy.shape() {
            return Err(SampleError::MaskShape {
                expected: policy.shape().to_vec(),
                got: policy_mask.shape().to_vec(),
            });
        }
        Ok(Self {
            obs,
            value,
            policy,
            policy_mask,
            aux: None,
            rnn_state: None,
        })
    }

    pub fn with_aux(mut self, target: Tensor, mask: Tensor) -> Result<Self, SampleError> {
        if mask.shape() != target.shape() {
            return Err(SampleError::AuxMaskShape {
                expected: target.shape().to_vec(),
                got: mask.shape().to_vec(),
            });
        }
        if mask.dtype() != Dtype::U8 {
            return Err(SampleError::FieldDtype {
                field: schema::AUX_MASK,
                expected: Dtype::U8,
            });
        }
        self.aux = Some((target, mask));
        Ok(self)
    }

    pub fn with_rnn_state(mut self, state: Tensor) -> Self {
        self.rnn_state = Some(state);
        self
    }

    /// Move the sample into the named-field layout the buffer stores.
    pub fn into_fields(self) -> NamedTensors {
        let mut out = NamedTensors::new();
        out.insert(schema::OBS.to_string(), self.obs);
        out.insert(schema::VALUE.to_string(), self.value);
        out.insert(schema::POLICY.to_string(), self.policy);
        out.insert(schema::POLICY_MASK.to_string(), self.policy_mask);
        if let Some((target, mask)) = self.aux {
            out.insert(schema::AUX.to_string(), target);
            out.insert(schema::AUX_MASK.to_string(), mask);
        }
        if let Some(state) = self.rnn_state {
            out.insert(schema::RNN_STATE.to_string(), state);
        }
        out
    }
}

/// A fixed-length sequence of steps from one episode segment.
///
/// The continue mask has one entry per step: 0 where a new segment starts,
/// 1 where the step continues the previous one. A sequence never spans two
/// independent episodes; truncation is expressed through the mask, not by
/// mixing data.
#[derive(Debug, Clone)]
pub struct SampleSeq {
    steps: Vec<Sample>,
    cont: Vec<u8>,
}

impl SampleSeq {
    pub fn new(steps: Vec<Sample>, cont: Vec<u8>) -> Result<Self, SampleError> {
        if steps.is_empty() {
            return Err(SampleError::EmptySeq);
        }
        if cont.len() != steps.len() {
            return Err(SampleError::ContinueLen {
                expected: steps.len(),
                got: cont.len(),
            });
        }
        let first = &steps[0];
        for s in &steps[1..] {
            let same = s.obs.shape() == first.obs.shape()
                && s.policy.shape() == first.policy.shape()
                && s.value.shape() == first.value.shape()
                && s.aux.is_some() == first.aux.is_some()
                && s.rnn_state.is_some() == first.rnn_state.is_some();
            if !same {
                return Err(SampleError::MixedSteps);
            }
        }
        Ok(Self { steps, cont })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Stack the steps into one slot batch with a leading sequence dim, plus
    /// the continue mask.
    pub fn into_fields(self) -> Result<NamedTensors, SampleError> {
        let len = self.steps.len();
        let per_step: Vec<NamedTensors> = self.steps.into_iter().map(Sample::into_fields).collect();
        let refs: Vec<&NamedTensors> = per_step.iter().collect();
        let mut out = stack_named(&refs)?;
        out.insert(
            schema::RNN_CONT.to_string(),
            Tensor::from_u8(vec![len], self.cont)?,
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(v: f32) -> Sample {
        Sample::new(
            Tensor::from_f32(vec![1, 2, 2], vec![v; 4]).unwrap(),
            Tensor::from_f32(vec![1], vec![v]).unwrap(),
            Tensor::from_f32(vec![4], vec![0.25; 4]).unwrap(),
            Tensor::from_u8(vec![4], vec![1; 4]).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn sample_fields_carry_required_keys() {
        let fields = step(0.5).into_fields();
        for key in schema::REQUIRED {
            assert!(fields.contains_key(key), "missing {key}");
        }
        assert!(!fields.contains_key(schema::AUX));
    }

    #[test]
    fn mask_shape_is_checked() {
        let err = Sample::new(
            Tensor::from_f32(vec![1, 2, 2], vec![0.0; 4]).unwrap(),
            Tensor::from_f32(vec![1], vec![0.0]).unwrap(),
            Tensor::from_f32(vec![4], vec![0.25; 4]).unwrap(),
            Tensor::from_u8(vec![5], vec![1; 5]).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, SampleError::MaskShape { .. }));
    }

    #[test]
    fn seq_stacks_steps_and_keeps_continue_mask() {
        let seq = SampleSeq::new(vec![step(0.0), step(1.0), step(2.0)], vec![0, 1, 1]).unwrap();
        let fields = seq.into_fields().unwrap();
        assert_eq!(fields[schema::OBS].shape(), &[3, 1, 2, 2]);
        assert_eq!(fields[schema::RNN_CONT].as_u8().unwrap(), &[0, 1, 1]);
    }

    #[test]
    fn seq_rejects_bad_continue_len() {
        let err = SampleSeq::new(vec![step(0.0), step(1.0)], vec![0]).unwrap_err();
        assert!(matches!(err, SampleError::ContinueLen { .. }));
    }
}
