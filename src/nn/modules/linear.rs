//! # Linear Layer Module

use crate::nn::Module;
use crate::tensor::{self, ops, Tensor, TensorData, TensorError};
use rand::Rng;
use std::collections::BTreeMap;

/// Applies a linear transformation to the incoming data: `y = xA^T + b`.
///
/// Input shape: `(N, in_features)`
/// Output shape: `(N, out_features)`
#[derive(Debug)]
pub struct Linear {
    pub weight: Tensor,       // Shape: (out_features, in_features)
    pub bias: Option<Tensor>, // Shape: (out_features)

    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Creates a new Linear module.
    ///
    /// # Arguments
    /// * `in_features`: Size of each input sample.
    /// * `out_features`: Size of each output sample.
    /// * `bias`: Whether to include a bias term.
    /// * `rng`: Source of randomness for initialization.
    ///
    /// Weights and bias are drawn from `U(-k, k)` with `k = 1/sqrt(in_features)`,
    /// matching PyTorch's defaults.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Result<Self, TensorError> {
        if in_features == 0 || out_features == 0 {
            return Err(TensorError::Generic(format!(
                "Linear layer needs non-zero features, got {} -> {}",
                in_features, out_features
            )));
        }
        let k = (1.0 / in_features as TensorData).sqrt();
        let weight = tensor::uniform(&[out_features, in_features], -k, k, true, rng)?;
        let bias = if bias {
            Some(tensor::uniform(&[out_features], -k, k, true, rng)?)
        } else {
            None
        };

        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for Linear {
    /// Performs the forward pass: `input @ weight.T + bias`.
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        if input.ndim() != 2 || input.shape()[1] != self.in_features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![input.shape().first().copied().unwrap_or(0), self.in_features],
                got: input.shape().to_vec(),
            });
        }
        let weight_t = ops::transpose(&self.weight)?;
        let output = ops::matmul(input, &weight_t)?;
        match &self.bias {
            Some(b) => ops::add(&output, b),
            None => Ok(output),
        }
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        params.insert("weight".to_string(), self.weight.clone());
        if let Some(b) = &self.bias {
            params.insert("bias".to_string(), b.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_shape_and_gradients() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::new(3, 2, true, &mut rng).unwrap();
        let x = tensor::ones(&[5, 3], false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[5, 2]);

        ops::sum(&y).unwrap().backward().unwrap();
        let w_grad = layer.weight.grad().unwrap().unwrap();
        // d/dW sum(x W^T) with x = ones is the batch size everywhere
        assert!(w_grad.iter().all(|&g| (g - 5.0).abs() < 1e-6));
        let b_grad = layer.bias.as_ref().unwrap().grad().unwrap().unwrap();
        assert!(b_grad.iter().all(|&g| (g - 5.0).abs() < 1e-6));
    }

    #[test]
    fn rejects_wrong_input_width() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::new(3, 2, false, &mut rng).unwrap();
        let x = tensor::ones(&[5, 4], false);
        assert!(layer.forward(&x).is_err());
        assert_eq!(layer.parameters().len(), 1);
    }
}
