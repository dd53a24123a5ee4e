//! # Optimization Algorithms (`optim`)
//!
//! Implementations of common optimization algorithms used to update model parameters,
//! plus a serializable `OptimizerConfig` that plays the role of an "optimizer class"
//! when a trainer wires a freshly added module.

use crate::tensor::{Tensor, TensorData, TensorError};
use serde::{Deserialize, Serialize};

// --- Submodules ---
pub mod adagrad;
pub mod adam;
pub mod sgd;

pub use adagrad::Adagrad;
pub use adam::Adam;
pub use sgd::SGD;

// --- Optimizer Trait ---

/// Base trait for all optimizers.
pub trait Optimizer: Send {
    /// Performs a single optimization step using the gradients currently stored
    /// on the parameters this optimizer owns. Parameters without a gradient are skipped.
    fn step(&mut self) -> Result<(), TensorError>;

    /// Drops the gradients of all parameters managed by the optimizer.
    fn zero_grad(&mut self) -> Result<(), TensorError> {
        for param in self.params() {
            param.zero_grad()?;
        }
        Ok(())
    }

    /// The parameters this optimizer updates.
    fn params(&self) -> &[Tensor];

    fn learning_rate(&self) -> TensorData;

    /// Short algorithm name, used in logs.
    fn name(&self) -> &'static str;
}

fn check_non_negative(name: &str, value: TensorData) -> Result<(), TensorError> {
    if value < 0.0 || value.is_nan() {
        return Err(TensorError::Generic(format!(
            "Invalid {} value: {} (must be >= 0)",
            name, value
        )));
    }
    Ok(())
}

// --- Optimizer Configuration ---

/// Serializable description of an optimizer, built against a parameter set on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        lr: TensorData,
        #[serde(default)]
        momentum: TensorData,
        #[serde(default)]
        dampening: TensorData,
        #[serde(default)]
        weight_decay: TensorData,
        #[serde(default)]
        nesterov: bool,
    },
    Adam {
        #[serde(default = "default_adam_lr")]
        lr: TensorData,
        #[serde(default = "default_betas")]
        betas: (TensorData, TensorData),
        #[serde(default = "default_adam_eps")]
        eps: TensorData,
        #[serde(default)]
        weight_decay: TensorData,
        #[serde(default)]
        amsgrad: bool,
    },
    Adagrad {
        #[serde(default = "default_adagrad_lr")]
        lr: TensorData,
        #[serde(default)]
        lr_decay: TensorData,
        #[serde(default)]
        weight_decay: TensorData,
        #[serde(default)]
        initial_accumulator_value: TensorData,
        #[serde(default = "default_adagrad_eps")]
        eps: TensorData,
    },
}

fn default_adam_lr() -> TensorData {
    1e-3
}

fn default_betas() -> (TensorData, TensorData) {
    (0.9, 0.999)
}

fn default_adam_eps() -> TensorData {
    1e-8
}

fn default_adagrad_lr() -> TensorData {
    1e-2
}

fn default_adagrad_eps() -> TensorData {
    1e-10
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            lr: default_adam_lr(),
            betas: default_betas(),
            eps: default_adam_eps(),
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

impl OptimizerConfig {
    /// Plain SGD with the given learning rate.
    pub fn sgd(lr: TensorData) -> Self {
        OptimizerConfig::Sgd {
            lr,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }

    /// Adam with default betas and epsilon.
    pub fn adam(lr: TensorData) -> Self {
        match OptimizerConfig::default() {
            OptimizerConfig::Adam { betas, eps, .. } => OptimizerConfig::Adam {
                lr,
                betas,
                eps,
                weight_decay: 0.0,
                amsgrad: false,
            },
            other => other,
        }
    }

    /// Builds the configured optimizer over `params`.
    pub fn build(&self, params: Vec<Tensor>) -> Result<Box<dyn Optimizer>, TensorError> {
        Ok(match *self {
            OptimizerConfig::Sgd {
                lr,
                momentum,
                dampening,
                weight_decay,
                nesterov,
            } => Box::new(SGD::new(params, lr, momentum, dampening, weight_decay, nesterov)?),
            OptimizerConfig::Adam {
                lr,
                betas,
                eps,
                weight_decay,
                amsgrad,
            } => Box::new(Adam::new(params, lr, betas, eps, weight_decay, amsgrad)?),
            OptimizerConfig::Adagrad {
                lr,
                lr_decay,
                weight_decay,
                initial_accumulator_value,
                eps,
            } => Box::new(Adagrad::new(
                params,
                lr,
                lr_decay,
                weight_decay,
                initial_accumulator_value,
                eps,
            )?),
        })
    }
}
