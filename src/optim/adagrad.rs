//! # Adagrad Optimizer

use super::{check_non_negative, Optimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Zip};
use std::collections::HashMap;

/// Implements the Adagrad algorithm.
/// Reference: Adaptive Subgradient Methods for Online Learning and Stochastic Optimization - http://jmlr.org/papers/v12/duchi11a.html
pub struct Adagrad {
    params: Vec<Tensor>,
    lr: TensorData,
    lr_decay: TensorData,
    weight_decay: TensorData,
    initial_accumulator_value: TensorData,
    eps: TensorData,

    // Sum of squared gradients per parameter id
    state: HashMap<usize, ArrayD<TensorData>>,
    t: usize,
}

impl Adagrad {
    /// Creates a new Adagrad optimizer instance.
    ///
    /// # Arguments
    /// * `params`: The parameters to optimize.
    /// * `lr`: Learning rate.
    /// * `lr_decay`: Learning rate decay.
    /// * `weight_decay`: Weight decay (L2 penalty).
    /// * `initial_accumulator_value`: Starting value for the accumulators.
    /// * `eps`: Term added to the denominator to improve numerical stability.
    pub fn new<I>(
        params: I,
        lr: TensorData,
        lr_decay: TensorData,
        weight_decay: TensorData,
        initial_accumulator_value: TensorData,
        eps: TensorData,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        check_non_negative("learning rate", lr)?;
        check_non_negative("lr_decay", lr_decay)?;
        check_non_negative("weight_decay", weight_decay)?;
        check_non_negative("initial_accumulator_value", initial_accumulator_value)?;
        check_non_negative("epsilon", eps)?;

        Ok(Adagrad {
            params: params.into_iter().collect(),
            lr,
            lr_decay,
            weight_decay,
            initial_accumulator_value,
            eps,
            state: HashMap::new(),
            t: 0,
        })
    }
}

impl Optimizer for Adagrad {
    fn step(&mut self) -> Result<(), TensorError> {
        self.t += 1;
        // clr = lr / (1 + (t - 1) * lr_decay)
        let clr = self.lr / (1.0 + (self.t - 1) as TensorData * self.lr_decay);

        for param in &self.params {
            if !param.requires_grad() {
                continue;
            }
            let mut grad = match param.grad()? {
                Some(g) => g,
                None => continue,
            };
            if self.weight_decay != 0.0 {
                grad = grad + &(&*param.data()? * self.weight_decay);
            }

            let init = self.initial_accumulator_value;
            let sum = self
                .state
                .entry(param.id())
                .or_insert_with(|| ArrayD::from_elem(grad.raw_dim(), init));
            Zip::from(&mut *sum).and(&grad).for_each(|s, &g| *s += g * g);

            let eps = self.eps;
            let mut data = param.data_mut()?;
            Zip::from(&mut *data)
                .and(&grad)
                .and(&*sum)
                .for_each(|p, &g, &s| *p -= clr * g / (s.sqrt() + eps));
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
        "adagrad"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::IxDyn;

    #[test]
    fn first_step_is_normalized() {
        let p = Tensor::from_vec(vec![0.0], &[1], true).unwrap();
        p.set_grad(ArrayD::from_elem(IxDyn(&[1]), 4.0)).unwrap();
        let mut opt = Adagrad::new(vec![p.clone()], 0.1, 0.0, 0.0, 0.0, 1e-10).unwrap();
        opt.step().unwrap();
        // g / sqrt(g^2) = 1
        assert_relative_eq!(p.item().unwrap(), -0.1, epsilon = 1e-6);
    }
}
