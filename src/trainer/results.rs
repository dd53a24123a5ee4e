//! # Update Results
//!
//! Diagnostics returned by `update` and `additional_update`, already converted to
//! plain numbers so callers never hold backend tensors.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metric {
    Scalar(f64),
    Vector(Vec<f64>),
    Nested(BTreeMap<String, Metric>),
}

pub type ResultDict = BTreeMap<String, Metric>;

impl Metric {
    /// Single-element arrays become scalars, everything else a flat vector.
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        if array.len() == 1 {
            Metric::Scalar(array.iter().next().copied().unwrap_or_default() as f64)
        } else {
            Metric::Vector(array.iter().map(|&v| v as f64).collect())
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Metric::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&BTreeMap<String, Metric>> {
        match self {
            Metric::Nested(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up `key` in a nested metric.
    pub fn get(&self, key: &str) -> Option<&Metric> {
        self.as_nested().and_then(|m| m.get(key))
    }
}

impl From<f64> for Metric {
    fn from(value: f64) -> Self {
        Metric::Scalar(value)
    }
}

impl From<f32> for Metric {
    fn from(value: f32) -> Self {
        Metric::Scalar(value as f64)
    }
}

impl From<BTreeMap<String, Metric>> for Metric {
    fn from(value: BTreeMap<String, Metric>) -> Self {
        Metric::Nested(value)
    }
}
