//! Small owned tensor type and the named-batch helpers built on it.
//!
//! Batches move between actors, the replay buffer, the wire codec and the
//! checkpoint format as maps from field name to tensor; safetensors is the
//! portable byte representation for all of them.

use std::collections::{BTreeMap, HashMap};

use bytemuck::cast_slice;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use thiserror::Error;

/// A batch (or a single slot) keyed by field name. `BTreeMap` keeps the
/// serialized byte representation deterministic.
pub type NamedTensors = BTreeMap<String, Tensor>;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("shape {shape:?} does not match data length {len}")]
    ShapeDataMismatch { shape: Vec<usize>, len: usize },
    #[error("expected shape {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("dtype mismatch")]
    DtypeMismatch,
    #[error("cannot {op} an empty set of tensors")]
    Empty { op: &'static str },
    #[error("row range {start}..{start_plus_len} out of bounds for leading dim {rows}")]
    RowRange {
        start: usize,
        start_plus_len: usize,
        rows: usize,
    },
    #[error("tensor of rank 0 has no leading dim")]
    NoLeadingDim,
    #[error("field sets differ between batches")]
    FieldMismatch,
    #[error("inconsistent leading dim across fields")]
    RaggedBatch,
    #[error("unsupported dtype in serialized tensor: {0}")]
    UnsupportedDtype(String),
    #[error("safetensors: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    U8,
}

#[derive(Debug, Clone, PartialEq)]
enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

/// Dense owned tensor, f32 or u8, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(TensorError::ShapeDataMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self {
            shape,
            data: TensorData::F32(data),
        })
    }

    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self, TensorError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(TensorError::ShapeDataMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self {
            shape,
            data: TensorData::U8(data),
        })
    }

    pub fn zeros_f32(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self {
            shape,
            data: TensorData::F32(vec![0.0; n]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> Dtype {
        match self.data {
            TensorData::F32(_) => Dtype::F32,
            TensorData::U8(_) => Dtype::U8,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::U8(_) => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    /// Leading dimension, treating the tensor as a stack of rows.
    pub fn rows(&self) -> Result<usize, TensorError> {
        self.shape.first().copied().ok_or(TensorError::NoLeadingDim)
    }

    fn row_numel(&self) -> Result<usize, TensorError> {
        let rows = self.rows()?;
        Ok(if rows == 0 { 0 } else { self.numel() / rows })
    }

    /// Stack identically-shaped tensors along a new leading dim.
    pub fn stack(items: &[&Tensor]) -> Result<Tensor, TensorError> {
        let first = items.first().ok_or(TensorError::Empty { op: "stack" })?;
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&first.shape);
        match &first.data {
            TensorData::F32(_) => {
                let mut out = Vec::with_capacity(items.len() * first.numel());
                for t in items {
                    if t.shape != first.shape {
                        return Err(TensorError::ShapeMismatch {
                            expected: first.shape.clone(),
                            got: t.shape.clone(),
                        });
                    }
                    out.extend_from_slice(t.as_f32().ok_or(TensorError::DtypeMismatch)?);
                }
                Tensor::from_f32(shape, out)
            }
            TensorData::U8(_) => {
                let mut out = Vec::with_capacity(items.len() * first.numel());
                for t in items {
                    if t.shape != first.shape {
                        return Err(TensorError::ShapeMismatch {
                            expected: first.shape.clone(),
                            got: t.shape.clone(),
                        });
                    }
                    out.extend_from_slice(t.as_u8().ok_or(TensorError::DtypeMismatch)?);
                }
                Tensor::from_u8(shape, out)
            }
        }
    }

    /// Concatenate along the existing leading dim.
    pub fn concat(items: &[&Tensor]) -> Result<Tensor, TensorError> {
        let first = items.first().ok_or(TensorError::Empty { op: "concat" })?;
        let tail = &first.shape[1..];
        let mut rows = 0usize;
        for t in items {
            if t.shape.is_empty() || &t.shape[1..] != tail {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.clone(),
                    got: t.shape.clone(),
                });
            }
            rows += t.shape[0];
        }
        let mut shape = Vec::with_capacity(first.shape.len());
        shape.push(rows);
        shape.extend_from_slice(tail);
        match &first.data {
            TensorData::F32(_) => {
                let mut out = Vec::with_capacity(rows * first.row_numel()?);
                for t in items {
                    out.extend_from_slice(t.as_f32().ok_or(TensorError::DtypeMismatch)?);
                }
                Tensor::from_f32(shape, out)
            }
            TensorData::U8(_) => {
                let mut out = Vec::with_capacity(rows * first.row_numel()?);
                for t in items {
                    out.extend_from_slice(t.as_u8().ok_or(TensorError::DtypeMismatch)?);
                }
                Tensor::from_u8(shape, out)
            }
        }
    }

    /// Copy out `len` rows starting at `start`.
    pub fn slice_rows(&self, start: usize, len: usize) -> Result<Tensor, TensorError> {
        let rows = self.rows()?;
        if start + len > rows {
            return Err(TensorError::RowRange {
                start,
                start_plus_len: start + len,
                rows,
            });
        }
        let rn = self.row_numel()?;
        let mut shape = self.shape.clone();
        shape[0] = len;
        match &self.data {
            TensorData::F32(v) => {
                Tensor::from_f32(shape, v[start * rn..(start + len) * rn].to_vec())
            }
            TensorData::U8(v) => Tensor::from_u8(shape, v[start * rn..(start + len) * rn].to_vec()),
        }
    }

    /// Split the leading dim into per-row tensors of shape `shape[1..]`.
    pub fn unstack(&self) -> Result<Vec<Tensor>, TensorError> {
        let rows = self.rows()?;
        let rn = self.row_numel()?;
        let tail = self.shape[1..].to_vec();
        let mut out = Vec::with_capacity(rows);
        for i in 0..rows {
            out.push(match &self.data {
                TensorData::F32(v) => Tensor::from_f32(tail.clone(), v[i * rn..(i + 1) * rn].to_vec())?,
                TensorData::U8(v) => Tensor::from_u8(tail.clone(), v[i * rn..(i + 1) * rn].to_vec())?,
            });
        }
        Ok(out)
    }
}

/// Leading dim of a named batch; every field must agree.
pub fn batch_rows(batch: &NamedTensors) -> Result<usize, TensorError> {
    let mut rows = None;
    for t in batch.values() {
        let r = t.rows()?;
        match rows {
            None => rows = Some(r),
            Some(prev) if prev != r => return Err(TensorError::RaggedBatch),
            Some(_) => {}
        }
    }
    rows.ok_or(TensorError::Empty { op: "batch_rows" })
}

fn check_same_fields(items: &[&NamedTensors]) -> Result<(), TensorError> {
    let first = items.first().ok_or(TensorError::Empty { op: "merge" })?;
    for b in &items[1..] {
        if b.len() != first.len() || !b.keys().eq(first.keys()) {
            return Err(TensorError::FieldMismatch);
        }
    }
    Ok(())
}

/// Stack slot-shaped batches into one batch with a new leading dim per field.
pub fn stack_named(items: &[&NamedTensors]) -> Result<NamedTensors, TensorError> {
    check_same_fields(items)?;
    let mut out = NamedTensors::new();
    for key in items[0].keys() {
        let parts: Vec<&Tensor> = items.iter().map(|b| &b[key]).collect();
        out.insert(key.clone(), Tensor::stack(&parts)?);
    }
    Ok(out)
}

/// Concatenate batches along the existing leading dim per field.
pub fn concat_named(items: &[&NamedTensors]) -> Result<NamedTensors, TensorError> {
    check_same_fields(items)?;
    let mut out = NamedTensors::new();
    for key in items[0].keys() {
        let parts: Vec<&Tensor> = items.iter().map(|b| &b[key]).collect();
        out.insert(key.clone(), Tensor::concat(&parts)?);
    }
    Ok(out)
}

/// Split a batch back into per-caller batches of `counts` rows each.
pub fn split_named(batch: &NamedTensors, counts: &[usize]) -> Result<Vec<NamedTensors>, TensorError> {
    let mut out: Vec<NamedTensors> = (0..counts.len()).map(|_| NamedTensors::new()).collect();
    for (key, t) in batch {
        let mut start = 0usize;
        for (i, &n) in counts.iter().enumerate() {
            out[i].insert(key.clone(), t.slice_rows(start, n)?);
            start += n;
        }
        if start != t.rows()? {
            return Err(TensorError::RaggedBatch);
        }
    }
    Ok(out)
}

/// Split the leading dim of every field into per-row batches.
pub fn unstack_named(batch: &NamedTensors) -> Result<Vec<NamedTensors>, TensorError> {
    let rows = batch_rows(batch)?;
    let mut out: Vec<NamedTensors> = (0..rows).map(|_| NamedTensors::new()).collect();
    for (key, t) in batch {
        for (i, row) in t.unstack()?.into_iter().enumerate() {
            out[i].insert(key.clone(), row);
        }
    }
    Ok(out)
}

fn st_dtype(d: Dtype) -> safetensors::tensor::Dtype {
    match d {
        Dtype::F32 => safetensors::tensor::Dtype::F32,
        Dtype::U8 => safetensors::tensor::Dtype::U8,
    }
}

/// Serialize a named batch to a safetensors blob, with optional string
/// metadata carried in the header.
pub fn to_safetensors(
    tensors: &NamedTensors,
    meta: Option<HashMap<String, String>>,
) -> Result<Vec<u8>, TensorError> {
    let mut views: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
    for (name, t) in tensors {
        let bytes: &[u8] = match &t.data {
            TensorData::F32(v) => cast_slice(v),
            TensorData::U8(v) => v,
        };
        views.insert(
            name.clone(),
            TensorView::new(st_dtype(t.dtype()), t.shape.clone(), bytes)?,
        );
    }
    Ok(safetensors::serialize(&views, &meta)?)
}

/// Inverse of [`to_safetensors`]; returns the tensors and the header metadata.
pub fn from_safetensors(bytes: &[u8]) -> Result<(NamedTensors, HashMap<String, String>), TensorError> {
    let st = SafeTensors::deserialize(bytes)?;
    let mut out = NamedTensors::new();
    for (name, view) in st.tensors() {
        let shape = view.shape().to_vec();
        let t = match view.dtype() {
            safetensors::tensor::Dtype::F32 => {
                let data: Vec<f32> = view
                    .data()
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Tensor::from_f32(shape, data)?
            }
            safetensors::tensor::Dtype::U8 => Tensor::from_u8(shape, view.data().to_vec())?,
            other => return Err(TensorError::UnsupportedDtype(format!("{other:?}"))),
        };
        out.insert(name.to_string(), t);
    }
    let (_header_len, header) = SafeTensors::read_metadata(bytes)?;
    let meta = header.metadata().clone().unwrap_or_default();
    Ok((out, meta))
}
