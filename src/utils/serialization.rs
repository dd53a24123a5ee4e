//! # Checkpoint Serialization Utilities
//!
//! Converts tensors to a flat, serde-friendly form and writes trainer state to disk.
//! Uses `serde` for serialization and `bincode` as the binary format.

use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Tensor shape mismatch during loading: key '{key}', expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Missing key in state dict during loading: '{0}'")]
    MissingKey(String),
    #[error("Unexpected key in state dict during loading: '{0}'")]
    UnexpectedKey(String),
    #[error("Could not access tensor data")]
    TensorLockError,
}

// --- Serializable Tensor ---

/// Flat snapshot of one tensor: its shape plus the data in logical (row-major) order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub data: Vec<TensorData>,
}

impl TensorState {
    pub fn from_array(array: &ArrayD<TensorData>) -> Self {
        TensorState {
            shape: array.shape().to_vec(),
            // `iter()` walks logical order regardless of memory layout
            data: array.iter().copied().collect(),
        }
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self, SerializationError> {
        let guard = tensor.data().map_err(|_| SerializationError::TensorLockError)?;
        Ok(TensorState::from_array(&guard))
    }

    /// Rebuilds the array. `key` is only used for error reporting.
    pub fn to_array(&self, key: &str) -> Result<ArrayD<TensorData>, SerializationError> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone()).map_err(|_| {
            SerializationError::ShapeMismatch {
                key: key.to_string(),
                expected: self.shape.clone(),
                got: vec![self.data.len()],
            }
        })
    }

    /// Copies this state into `tensor` in place, keeping the tensor's identity.
    pub fn copy_into(&self, key: &str, tensor: &Tensor) -> Result<(), SerializationError> {
        if self.shape.as_slice() != tensor.shape() {
            return Err(SerializationError::ShapeMismatch {
                key: key.to_string(),
                expected: tensor.shape().to_vec(),
                got: self.shape.clone(),
            });
        }
        let values = self.to_array(key)?;
        let mut guard = tensor.data_mut().map_err(|_| SerializationError::TensorLockError)?;
        guard.assign(&values);
        Ok(())
    }
}

// --- Save / Load ---

/// Writes `value` to `path` with bincode, replacing any existing file.
pub fn save<T, P>(value: &T, path: P) -> Result<(), SerializationError>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Reads a value written by [`save`].
pub fn load<T, P>(path: P) -> Result<T, SerializationError>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    Ok(bincode::deserialize_from(reader)?)
}
