//! # Neural Network Functional Interface (`nn::functional`)
//!
//! Stateless functions mirroring `torch.nn.functional`.

use crate::tensor::{ops, Tensor, TensorError};

// --- Activation Functions ---

/// Applies the Rectified Linear Unit (ReLU) function element-wise.
pub fn relu(input: &Tensor) -> Result<Tensor, TensorError> {
    ops::relu(input)
}

/// Applies the Hyperbolic Tangent (Tanh) function element-wise.
pub fn tanh(input: &Tensor) -> Result<Tensor, TensorError> {
    ops::tanh(input)
}

// --- Loss Functions ---

/// Mean squared error: `mean((input - target)^2)`.
pub fn mse_loss(input: &Tensor, target: &Tensor) -> Result<Tensor, TensorError> {
    if input.shape() != target.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: input.shape().to_vec(),
            got: target.shape().to_vec(),
        });
    }
    let diff = ops::sub(input, target)?;
    let squared = ops::mul(&diff, &diff)?;
    ops::mean(&squared)
}
