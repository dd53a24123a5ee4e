//! # Loss Function Modules

use crate::nn::functional as F;
use crate::tensor::{Tensor, TensorError};

/// Creates a criterion that measures the mean squared error between
/// each element in the prediction `x` and target `y`: `mean((x_i - y_i)^2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss;

impl MSELoss {
    pub fn new() -> Self {
        MSELoss
    }

    /// Loss functions take two inputs, so they sit outside the `Module` trait.
    pub fn forward(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor, TensorError> {
        F::mse_loss(prediction, target)
    }
}
