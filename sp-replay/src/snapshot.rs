//! Portable byte-blob export/import of the buffer's resident contents.
//!
//! The blob is a safetensors container: every field stacked over all resident
//! slots under a new leading dim, with capacity and slot count recorded in the
//! header metadata. Checkpointing stores the blob verbatim.

use std::collections::HashMap;

use sp_core::tensor::{self, unstack_named};

use crate::buffer::ReplayBuffer;
use crate::ReplayError;

const FORMAT_VERSION: &str = "1";

impl ReplayBuffer {
    /// Export the resident contents to a byte blob.
    pub fn export(&self) -> Result<Vec<u8>, ReplayError> {
        let slots = self.resident_slots();
        let mut meta = HashMap::new();
        meta.insert("format_version".to_string(), FORMAT_VERSION.to_string());
        meta.insert("capacity".to_string(), self.capacity().to_string());
        meta.insert("slots".to_string(), slots.len().to_string());
        if slots.is_empty() {
            let empty = sp_core::tensor::NamedTensors::new();
            return Ok(tensor::to_safetensors(&empty, Some(meta))?);
        }
        let refs: Vec<&_> = slots.iter().collect();
        let stacked = tensor::stack_named(&refs)?;
        Ok(tensor::to_safetensors(&stacked, Some(meta))?)
    }
}

fn meta_usize(meta: &HashMap<String, String>, key: &str) -> Result<usize, ReplayError> {
    meta.get(key)
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| ReplayError::IncompatibleBufferShape(format!("missing/bad '{key}' metadata")))
}

/// Reconstruct a buffer from an exported blob.
///
/// The restored contents must fit the configured buffer: the stored capacity
/// has to equal `capacity`, and the stored slot count cannot exceed it.
pub fn restore(bytes: &[u8], capacity: usize, seed: u64) -> Result<ReplayBuffer, ReplayError> {
    let (stacked, meta) = tensor::from_safetensors(bytes)?;
    let stored_capacity = meta_usize(&meta, "capacity")?;
    let stored_slots = meta_usize(&meta, "slots")?;
    if stored_capacity != capacity {
        return Err(ReplayError::IncompatibleBufferShape(format!(
            "stored capacity {stored_capacity}, configured capacity {capacity}"
        )));
    }
    if stored_slots > capacity {
        return Err(ReplayError::IncompatibleBufferShape(format!(
            "stored {stored_slots} slots exceed capacity {capacity}"
        )));
    }
    let buf = ReplayBuffer::new(capacity, seed);
    if stored_slots == 0 {
        return Ok(buf);
    }
    let slots = unstack_named(&stacked)?;
    if slots.len() != stored_slots {
        return Err(ReplayError::IncompatibleBufferShape(format!(
            "metadata says {stored_slots} slots, payload has {}",
            slots.len()
        )));
    }
    buf.fill_from_restore(slots)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_core::schema;
    use sp_core::tensor::{NamedTensors, Tensor};

    fn slot(step: f32) -> NamedTensors {
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

    fn resident_values(buf: &ReplayBuffer) -> Vec<f32> {
        let mut v: Vec<f32> = buf
            .resident_slots()
            .iter()
            .map(|s| s[schema::VALUE].as_f32().unwrap()[0])
            .collect();
        v.sort_by(f32::total_cmp);
        v
    }

    #[test]
    fn roundtrip_preserves_contents_and_sizes() {
        let buf = ReplayBuffer::new(16, 3);
        for i in 0..10 {
            buf.add(slot(i as f32)).unwrap();
        }
        let blob = buf.export().unwrap();
        let back = restore(&blob, 16, 99).unwrap();
        assert_eq!(back.size(), 10);
        assert_eq!(back.capacity(), 16);
        assert_eq!(resident_values(&back), resident_values(&buf));
    }

    #[test]
    fn roundtrip_of_wrapped_buffer_keeps_most_recent() {
        let buf = ReplayBuffer::new(4, 3);
        for i in 0..11 {
            buf.add(slot(i as f32)).unwrap();
        }
        let blob = buf.export().unwrap();
        let back = restore(&blob, 4, 99).unwrap();
        assert_eq!(back.size(), 4);
        assert_eq!(resident_values(&back), vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn capacity_mismatch_is_incompatible() {
        let buf = ReplayBuffer::new(8, 3);
        buf.add(slot(0.0)).unwrap();
        let blob = buf.export().unwrap();
        let err = restore(&blob, 16, 99).unwrap_err();
        assert!(matches!(err, ReplayError::IncompatibleBufferShape(_)));
    }

    #[test]
    fn empty_buffer_roundtrips() {
        let buf = ReplayBuffer::new(8, 3);
        let blob = buf.export().unwrap();
        let back = restore(&blob, 8, 99).unwrap();
        assert_eq!(back.size(), 0);
        assert!(matches!(back.sample(1), Err(ReplayError::InsufficientData)));
    }

    #[test]
    fn restored_buffer_keeps_sampling_and_ring_semantics() {
        let buf = ReplayBuffer::new(4, 3);
        for i in 0..4 {
            buf.add(slot(i as f32)).unwrap();
        }
        let back = restore(&buf.export().unwrap(), 4, 5).unwrap();
        let batch = back.sample(8).unwrap();
        assert_eq!(batch[schema::OBS].shape(), &[8, 1, 2, 2]);
        // Next add overwrites the oldest restored slot.
        back.add(slot(100.0)).unwrap();
        assert_eq!(back.size(), 4);
        assert_eq!(resident_values(&back), vec![1.0, 2.0, 3.0, 100.0]);
    }
}
