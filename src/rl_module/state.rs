//! # Module State
//!
//! Backend-neutral snapshots of module weights.

use crate::batch::ModuleId;
use crate::utils::serialization::{SerializationError, TensorState};
use std::collections::BTreeMap;

/// Parameter name → weights of one module.
pub type ModuleState = BTreeMap<String, TensorState>;

/// Module id → module state for the whole container.
pub type MultiAgentState = BTreeMap<ModuleId, ModuleState>;

/// Moves `target` towards `online`: `target = tau * online + (1 - tau) * target`.
///
/// Both states must hold the same keys with the same shapes. Returns the mean
/// absolute distance between the two states after the update.
pub fn polyak_update(target: &mut ModuleState, online: &ModuleState, tau: f32) -> Result<f32, SerializationError> {
    if let Some(extra) = online.keys().find(|k| !target.contains_key(*k)) {
        return Err(SerializationError::UnexpectedKey(extra.clone()));
    }

    let mut distance = 0.0f32;
    let mut count = 0usize;
    for (key, t) in target.iter_mut() {
        let o = online
            .get(key)
            .ok_or_else(|| SerializationError::MissingKey(key.clone()))?;
        if o.shape != t.shape || o.data.len() != t.data.len() {
            return Err(SerializationError::ShapeMismatch {
                key: key.clone(),
                expected: t.shape.clone(),
                got: o.shape.clone(),
            });
        }
        for (tv, ov) in t.data.iter_mut().zip(&o.data) {
            *tv = tau * ov + (1.0 - tau) * *tv;
            distance += (ov - *tv).abs();
        }
        count += t.data.len();
    }
    Ok(if count == 0 { 0.0 } else { distance / count as f32 })
}
