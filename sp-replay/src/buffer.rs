//! Ring-structured sample store.
//!
//! One slot holds one batch-unit (a single step, or a fixed-length sequence
//! for recurrent training). Writers claim a ring position from an atomic
//! counter and only lock that slot, so producers don't serialize behind a
//! global lock; overwrite-on-full means an add never waits for space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use sp_core::tensor::{stack_named, Dtype, NamedTensors, Tensor};

use crate::ReplayError;

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

/// Slot layout, fixed by the first add.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSchema {
    pub fields: Vec<FieldSpec>,
}

impl SlotSchema {
    fn of(slot: &NamedTensors) -> Self {
        Self {
            fields: slot
                .iter()
                .map(|(name, t)| FieldSpec {
                    name: name.clone(),
                    shape: t.shape().to_vec(),
                    dtype: t.dtype(),
                })
                .collect(),
        }
    }

    fn check(&self, slot: &NamedTensors) -> Result<(), ReplayError> {
        if slot.len() != self.fields.len() {
            return Err(ReplayError::SchemaMismatch {
                field: "*".to_string(),
                detail: format!(
                    "expected {} fields, got {}",
                    self.fields.len(),
                    slot.len()
                ),
            });
        }
        for spec in &self.fields {
            let t = slot.get(&spec.name).ok_or_else(|| ReplayError::SchemaMismatch {
                field: spec.name.clone(),
                detail: "field missing".to_string(),
            })?;
            if t.shape() != spec.shape.as_slice() || t.dtype() != spec.dtype {
                return Err(ReplayError::SchemaMismatch {
                    field: spec.name.clone(),
                    detail: format!(
                        "expected {:?} {:?}, got {:?} {:?}",
                        spec.dtype,
                        spec.shape,
                        t.dtype(),
                        t.shape()
                    ),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    slots: Box<[Mutex<Option<NamedTensors>>]>,
    schema: OnceLock<SlotSchema>,
    num_added: AtomicU64,
    num_sampled: AtomicU64,
    rng: Mutex<ChaCha8Rng>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, seed: u64) -> Self {
        assert!(capacity > 0, "replay capacity must be > 0");
        let slots = (0..capacity)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            capacity,
            slots,
            schema: OnceLock::new(),
            num_added: AtomicU64::new(0),
            num_sampled: AtomicU64::new(0),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupied slot count; approximate while adds are in flight.
    pub fn size(&self) -> usize {
        (self.num_added.load(Ordering::Relaxed) as usize).min(self.capacity)
    }

    pub fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    /// Lifetime adds; monotonic, reset only at process start.
    pub fn num_added(&self) -> u64 {
        self.num_added.load(Ordering::Relaxed)
    }

    /// Lifetime sampled slots; monotonic, reset only at process start.
    pub fn num_sampled(&self) -> u64 {
        self.num_sampled.load(Ordering::Relaxed)
    }

    pub fn schema(&self) -> Option<&SlotSchema> {
        self.schema.get()
    }

    /// Insert one slot at the next ring position, overwriting the oldest
    /// entry once the buffer is full.
    pub fn add(&self, slot: NamedTensors) -> Result<(), ReplayError> {
        if slot.is_empty() {
            return Err(ReplayError::SchemaMismatch {
                field: "*".to_string(),
                detail: "empty slot".to_string(),
            });
        }
        let schema = self.schema.get_or_init(|| SlotSchema::of(&slot));
        schema.check(&slot)?;
        let pos = self.num_added.fetch_add(1, Ordering::AcqRel) as usize % self.capacity;
        *self.slots[pos].lock().unwrap() = Some(slot);
        Ok(())
    }

    /// Insert a finished trajectory (or any batch of slots).
    pub fn add_all<I: IntoIterator<Item = NamedTensors>>(&self, slots: I) -> Result<(), ReplayError> {
        for slot in slots {
            self.add(slot)?;
        }
        Ok(())
    }

    /// Draw `batchsize` slots uniformly at random with replacement over the
    /// resident region and stack them into one training batch.
    pub fn sample(&self, batchsize: usize) -> Result<NamedTensors, ReplayError> {
        let size = self.size();
        if size == 0 {
            return Err(ReplayError::InsufficientData);
        }
        let indices: Vec<usize> = {
            let mut rng = self.rng.lock().unwrap();
            (0..batchsize).map(|_| rng.random_range(0..size)).collect()
        };
        let mut drawn = Vec::with_capacity(batchsize);
        for idx in indices {
            drawn.push(self.take_resident(idx, size)?);
        }
        let refs: Vec<&NamedTensors> = drawn.iter().collect();
        let batch = stack_named(&refs)?;
        self.num_sampled.fetch_add(batchsize as u64, Ordering::Relaxed);
        Ok(batch)
    }

    /// Clone the slot at `idx`, probing forward past a slot whose write is
    /// still in flight.
    fn take_resident(&self, idx: usize, size: usize) -> Result<NamedTensors, ReplayError> {
        for probe in 0..size {
            let pos = (idx + probe) % size;
            if let Some(slot) = self.slots[pos].lock().unwrap().as_ref() {
                return Ok(slot.clone());
            }
        }
        Err(ReplayError::InsufficientData)
    }

    /// Resident slots, oldest first. Used by the snapshot writer.
    pub(crate) fn resident_slots(&self) -> Vec<NamedTensors> {
        let added = self.num_added.load(Ordering::Acquire) as usize;
        let size = added.min(self.capacity);
        let start = if added > self.capacity {
            added % self.capacity
        } else {
            0
        };
        let mut out = Vec::with_capacity(size);
        for i in 0..size {
            let pos = (start + i) % self.capacity;
            if let Some(slot) = self.slots[pos].lock().unwrap().as_ref() {
                out.push(slot.clone());
            }
        }
        out
    }

    /// Seed a freshly constructed buffer from restored slots.
    pub(crate) fn fill_from_restore(&self, slots: Vec<NamedTensors>) -> Result<(), ReplayError> {
        for slot in slots {
            self.add(slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use sp_core::schema;

    pub(crate) fn slot(step: f32) -> NamedTensors {
        let mut s = NamedTensors::new();
        s.insert(
            schema::OBS.to_string(),
            Tensor::from_f32(vec![1, 2, 2], vec![step; 4]).unwrap(),
        );
        s.insert(
            schema::VALUE.to_string(),
            Tensor::from_f32(vec![1], vec![step]).unwrap(),
        );
        s.insert(
            schema::POLICY.to_string(),
            Tensor::from_f32(vec![4], vec![0.25; 4]).unwrap(),
        );
        s.insert(
            schema::POLICY_MASK.to_string(),
            Tensor::from_u8(vec![4], vec![1; 4]).unwrap(),
        );
        s
    }

    #[test]
    fn size_never_exceeds_capacity_and_oldest_are_evicted() {
        let buf = ReplayBuffer::new(8, 1);
        for i in 0..20 {
            buf.add(slot(i as f32)).unwrap();
            assert!(buf.size() <= buf.capacity());
        }
        assert_eq!(buf.size(), 8);
        assert!(buf.is_full());
        assert_eq!(buf.num_added(), 20);

        // Only the most recent capacity() items remain.
        let resident = buf.resident_slots();
        let mut values: Vec<f32> = resident
            .iter()
            .map(|s| s[schema::VALUE].as_f32().unwrap()[0])
            .collect();
        values.sort_by(f32::total_cmp);
        let expected: Vec<f32> = (12..20).map(|i| i as f32).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn sample_on_empty_fails_cleanly() {
        let buf = ReplayBuffer::new(4, 1);
        assert!(matches!(buf.sample(1), Err(ReplayError::InsufficientData)));
    }

    #[test]
    fn sample_with_replacement_returns_exactly_n() {
        let buf = ReplayBuffer::new(16, 1);
        buf.add(slot(1.0)).unwrap();
        // One resident slot, batch of 5: only possible with replacement.
        let batch = buf.sample(5).unwrap();
        assert_eq!(batch[schema::OBS].shape(), &[5, 1, 2, 2]);
        assert_eq!(buf.num_sampled(), 5);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let buf = ReplayBuffer::new(4, 1);
        buf.add(slot(0.0)).unwrap();
        let mut bad = slot(1.0);
        bad.insert(
            schema::OBS.to_string(),
            Tensor::from_f32(vec![1, 3, 3], vec![0.0; 9]).unwrap(),
        );
        let err = buf.add(bad).unwrap_err();
        assert!(matches!(err, ReplayError::SchemaMismatch { .. }));
    }

    #[test]
    fn concurrent_add_and_sample() {
        let buf = Arc::new(ReplayBuffer::new(1024, 1));
        let done = Arc::new(AtomicBool::new(false));
        let producers = 8;
        let per_producer = 10_000;

        std::thread::scope(|s| {
            for p in 0..producers {
                let buf = Arc::clone(&buf);
                s.spawn(move || {
                    for i in 0..per_producer {
                        buf.add(slot((p * per_producer + i) as f32)).unwrap();
                    }
                });
            }
            for _ in 0..2 {
                let buf = Arc::clone(&buf);
                let done = Arc::clone(&done);
                s.spawn(move || loop {
                    match buf.sample(32) {
                        Ok(batch) => {
                            assert_eq!(batch[schema::OBS].shape()[0], 32);
                        }
                        Err(ReplayError::InsufficientData) => {}
                        Err(e) => panic!("unexpected sample error: {e}"),
                    }
                    assert!(buf.size() <= buf.capacity());
                    if done.load(Ordering::Relaxed) {
                        break;
                    }
                });
            }
            // Flip the flag once every add has landed so consumers drain out.
            {
                let buf = Arc::clone(&buf);
                let done = Arc::clone(&done);
                s.spawn(move || {
                    while buf.num_added() < (producers * per_producer) as u64 {
                        std::thread::yield_now();
                    }
                    done.store(true, Ordering::Relaxed);
                });
            }
        });

        assert_eq!(buf.num_added(), (producers * per_producer) as u64);
        assert_eq!(buf.size(), buf.capacity());
    }
}
