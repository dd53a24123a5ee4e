//! # Activation Function Modules

use crate::nn::functional as F;
use crate::nn::Module;
use crate::tensor::{Tensor, TensorError};
use std::collections::BTreeMap;

/// Applies the Rectified Linear Unit function element-wise.
/// `ReLU(x) = max(0, x)`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        F::relu(input)
    }

    /// ReLU has no parameters.
    fn parameters(&self) -> BTreeMap<String, Tensor> {
        BTreeMap::new()
    }
}

/// Applies the Tanh function element-wise.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Tanh {
    pub fn new() -> Self {
        Tanh
    }
}

impl Module for Tanh {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        F::tanh(input)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        BTreeMap::new()
    }
}
