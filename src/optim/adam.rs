//! # Adam Optimizer

use super::{check_non_negative, Optimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Zip};
use std::collections::HashMap;

/// Implements the Adam algorithm.
/// Reference: Adam: A Method for Stochastic Optimization - https://arxiv.org/abs/1412.6980
pub struct Adam {
    params: Vec<Tensor>,
    lr: TensorData,
    betas: (TensorData, TensorData),
    eps: TensorData,
    weight_decay: TensorData,
    amsgrad: bool,

    // State stored per parameter id
    state: HashMap<usize, AdamParamState>,
    // Number of calls to step()
    t: i32,
}

#[derive(Clone, Debug)]
struct AdamParamState {
    exp_avg: ArrayD<TensorData>,                // m_t
    exp_avg_sq: ArrayD<TensorData>,             // v_t
    max_exp_avg_sq: Option<ArrayD<TensorData>>, // only with amsgrad
}

impl Adam {
    /// Creates a new Adam optimizer instance.
    ///
    /// # Arguments
    /// * `params`: The parameters to optimize.
    /// * `lr`: Learning rate.
    /// * `betas`: Coefficients for the running averages of the gradient and its square.
    /// * `eps`: Term added to the denominator to improve numerical stability.
    /// * `weight_decay`: Weight decay (L2 penalty).
    /// * `amsgrad`: Whether to use the AMSGrad variant of this algorithm.
    pub fn new<I>(
        params: I,
        lr: TensorData,
        betas: (TensorData, TensorData),
        eps: TensorData,
        weight_decay: TensorData,
        amsgrad: bool,
    ) -> Result<Self, TensorError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        check_non_negative("learning rate", lr)?;
        check_non_negative("epsilon", eps)?;
        check_non_negative("weight_decay", weight_decay)?;
        if !(0.0..1.0).contains(&betas.0) {
            return Err(TensorError::Generic("Invalid beta parameter at index 0".into()));
        }
        if !(0.0..1.0).contains(&betas.1) {
            return Err(TensorError::Generic("Invalid beta parameter at index 1".into()));
        }

        Ok(Adam {
            params: params.into_iter().collect(),
            lr,
            betas,
            eps,
            weight_decay,
            amsgrad,
            state: HashMap::new(),
            t: 0,
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<(), TensorError> {
        self.t += 1;
        let (beta1, beta2) = self.betas;
        let bias_correction1 = 1.0 - beta1.powi(self.t);
        let bias_correction2 = 1.0 - beta2.powi(self.t);
        let step_size = self.lr * bias_correction2.sqrt() / bias_correction1;

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

            let amsgrad = self.amsgrad;
            let state = self.state.entry(param.id()).or_insert_with(|| AdamParamState {
                exp_avg: ArrayD::zeros(grad.raw_dim()),
                exp_avg_sq: ArrayD::zeros(grad.raw_dim()),
                max_exp_avg_sq: if amsgrad { Some(ArrayD::zeros(grad.raw_dim())) } else { None },
            });

            // m_t = beta1 * m_{t-1} + (1 - beta1) * g_t
            Zip::from(&mut state.exp_avg)
                .and(&grad)
                .for_each(|m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            // v_t = beta2 * v_{t-1} + (1 - beta2) * g_t^2
            Zip::from(&mut state.exp_avg_sq)
                .and(&grad)
                .for_each(|v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            let second_moment = match state.max_exp_avg_sq.as_mut() {
                Some(max_v) => {
                    Zip::from(&mut *max_v)
                        .and(&state.exp_avg_sq)
                        .for_each(|mv, &v| *mv = mv.max(v));
                    &*max_v
                }
                None => &state.exp_avg_sq,
            };

            // param -= step_size * m_t / (sqrt(v_t) + eps)
            let eps = self.eps;
            let mut data = param.data_mut()?;
            Zip::from(&mut *data)
                .and(&state.exp_avg)
                .and(second_moment)
                .for_each(|p, &m, &v| *p -= step_size * m / (v.sqrt() + eps));
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
        "adam"
    }
}
