//! # Sample Batches
//!
//! Experience arrives as plain `ndarray` columns grouped per module. Backends turn
//! these into their own tensor type before the forward pass.

use crate::error::{Result, TrainerError};
use ndarray::{ArrayD, Axis, Slice};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Identifier of one module inside the multi-agent container.
pub type ModuleId = String;

/// Column name → array whose first axis is the row (timestep) axis.
pub type SampleBatch = BTreeMap<String, ArrayD<f32>>;

/// Per-module sample batches.
pub type MultiAgentBatch = BTreeMap<ModuleId, SampleBatch>;

/// Named tensors produced or consumed by one module.
pub type TensorDict<T> = BTreeMap<String, T>;

/// Module id → named tensors.
pub type NestedTensorDict<T> = BTreeMap<ModuleId, TensorDict<T>>;

/// Number of rows in `batch`. Every column must agree; an empty batch has zero rows.
pub fn num_rows(batch: &SampleBatch) -> Result<usize> {
    let mut rows: Option<(&str, usize)> = None;
    for (key, column) in batch {
        let n = column.shape().first().copied().ok_or_else(|| {
            TrainerError::Batch(format!("column `{}` is zero-dimensional", key))
        })?;
        match rows {
            None => rows = Some((key, n)),
            Some((first, expected)) if expected != n => {
                return Err(TrainerError::Batch(format!(
                    "column `{}` has {} rows but `{}` has {}",
                    key, n, first, expected
                )))
            }
            Some(_) => {}
        }
    }
    Ok(rows.map_or(0, |(_, n)| n))
}

/// Rows `[start, end)` of every column.
pub fn slice_rows(batch: &SampleBatch, start: usize, end: usize) -> SampleBatch {
    batch
        .iter()
        .map(|(key, column)| {
            let part = column.slice_axis(Axis(0), Slice::from(start..end)).to_owned();
            (key.clone(), part)
        })
        .collect()
}

/// `batch` without the modules that have no rows.
///
/// Modules without data take no part in an update; [`shard`] drops them the same way.
pub fn without_empty_modules(batch: &MultiAgentBatch) -> Result<Cow<'_, MultiAgentBatch>> {
    let mut empty = Vec::new();
    for (module_id, sample_batch) in batch {
        if num_rows(sample_batch)? == 0 {
            empty.push(module_id);
        }
    }
    if empty.is_empty() {
        return Ok(Cow::Borrowed(batch));
    }
    Ok(Cow::Owned(
        batch
            .iter()
            .filter(|(module_id, _)| !empty.contains(module_id))
            .map(|(module_id, sample_batch)| (module_id.clone(), sample_batch.clone()))
            .collect(),
    ))
}

/// Splits every module's batch into at most `num_shards` row ranges.
///
/// Shard `i` holds rows `[i * chunk, (i + 1) * chunk)` of each module with
/// `chunk = ceil(rows / num_shards)`. Shards that would be empty for every module
/// are dropped, so the result can be shorter than `num_shards`.
pub fn shard(batch: &MultiAgentBatch, num_shards: usize) -> Result<Vec<MultiAgentBatch>> {
    if num_shards == 0 {
        return Err(TrainerError::Batch("cannot split a batch into 0 shards".to_string()));
    }
    let mut rows = BTreeMap::new();
    for (module_id, sample_batch) in batch {
        rows.insert(module_id.as_str(), num_rows(sample_batch)?);
    }

    let mut shards = Vec::with_capacity(num_shards);
    for i in 0..num_shards {
        let mut part = MultiAgentBatch::new();
        for (module_id, sample_batch) in batch {
            let n = rows[module_id.as_str()];
            let chunk = (n + num_shards - 1) / num_shards;
            let start = (i * chunk).min(n);
            let end = ((i + 1) * chunk).min(n);
            if start < end {
                part.insert(module_id.clone(), slice_rows(sample_batch, start, end));
            }
        }
        if !part.is_empty() {
            shards.push(part);
        }
    }
    Ok(shards)
}
