//! # Stochastic Gradient Descent (SGD) Optimizer

use super::{check_non_negative, Optimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use ndarray::ArrayD;
use std::collections::HashMap;

/// Implements the Stochastic Gradient Descent optimizer.
/// Supports momentum, dampening, weight decay, and Nesterov momentum.
pub struct SGD {
    params: Vec<Tensor>,
    lr: TensorData,
    momentum: TensorData,
    dampening: TensorData,
    weight_decay: TensorData,
    nesterov: bool,
    // Momentum buffers keyed by parameter id
    momentum_buffers: HashMap<usize, ArrayD<TensorData>>,
}

impl SGD {
    /// Creates a new SGD optimizer instance.
    ///
    /// # Arguments
    /// * `params`: The parameters (tensors that require grad) to optimize.
    /// * `lr`: Learning rate.
    /// * `momentum`: Momentum factor.
    /// * `dampening`: Dampening for momentum.
    /// * `weight_decay`: Weight decay (L2 penalty).
    /// * `nesterov`: Enables Nesterov momentum (requires momentum > 0 and no dampening).
    pub fn new<I>(
        params: I,
        lr: TensorData,
        momentum: TensorData,
        dampening: TensorData,
        weight_decay: TensorData,
        nesterov: bool,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        check_non_negative("learning rate", lr)?;
        check_non_negative("momentum", momentum)?;
        check_non_negative("weight_decay", weight_decay)?;
        if nesterov && (momentum <= 0.0 || dampening != 0.0) {
            return Err(TensorError::Generic(
                "Nesterov momentum requires momentum > 0 and dampening = 0".to_string(),
            ));
        }

        Ok(SGD {
            params: params.into_iter().collect(),
            lr,
            momentum,
            dampening,
            weight_decay,
            nesterov,
            momentum_buffers: HashMap::new(),
        })
    }

    /// Simplified constructor with only lr.
    pub fn simple<I>(params: I, lr: TensorData) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::new(params, lr, 0.0, 0.0, 0.0, false)
    }
}

impl Optimizer for SGD {
    fn step(&mut self) -> Result<(), TensorError> {
        for param in &self.params {
            if !param.requires_grad() {
                continue;
            }
            let mut grad = match param.grad()? {
                Some(g) => g,
                None => continue,
            };

            // grad = grad + weight_decay * param
            if self.weight_decay != 0.0 {
                grad = grad + &(&*param.data()? * self.weight_decay);
            }

            if self.momentum != 0.0 {
                let buf = match self.momentum_buffers.remove(&param.id()) {
                    // buf = momentum * buf + (1 - dampening) * grad
                    Some(prev) => prev * self.momentum + &(&grad * (1.0 - self.dampening)),
                    None => grad.clone(),
                };
                grad = if self.nesterov {
                    grad + &(&buf * self.momentum)
                } else {
                    buf.clone()
                };
                self.momentum_buffers.insert(param.id(), buf);
            }

            let mut data = param.data_mut()?;
            data.scaled_add(-self.lr, &grad);
        }
        Ok(())
    }

    fn params(&self) -> &[Tensor] {
        &self.params
    }

    fn learning_rate(&self) -> TensorData {
        self.lr
    }

    fn name(&self) -> &'static str {
        "sgd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;

    #[test]
    fn plain_step_moves_against_gradient() {
        let p = Tensor::from_vec(vec![1.0, 1.0], &[2], true).unwrap();
        p.set_grad(ArrayD::from_elem(IxDyn(&[2]), 0.5)).unwrap();
        let mut opt = SGD::simple(vec![p.clone()], 0.1).unwrap();
        opt.step().unwrap();
        for v in p.data().unwrap().iter() {
            assert_relative_eq!(*v, 0.95);
        }
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let p = Tensor::from_vec(vec![0.0], &[1], true).unwrap();
        let mut opt = SGD::new(vec![p.clone()], 1.0, 0.5, 0.0, 0.0, false).unwrap();
        p.set_grad(ArrayD::from_elem(IxDyn(&[1]), 1.0)).unwrap();
        opt.step().unwrap(); // buf = 1
        opt.step().unwrap(); // buf = 1.5
        assert_relative_eq!(p.item().unwrap(), -2.5);
    }

    #[test]
    fn skips_parameters_without_gradient() {
        let p = Tensor::from_vec(vec![3.0], &[1], true).unwrap();
        let mut opt = SGD::simple(vec![p.clone()], 0.1).unwrap();
        opt.step().unwrap();
        assert_eq!(p.item().unwrap(), 3.0);
    }

    #[test]
    fn nesterov_requires_momentum() {
        assert!(SGD::new(Vec::new(), 0.1, 0.0, 0.0, 0.0, true).is_err());
    }
}
