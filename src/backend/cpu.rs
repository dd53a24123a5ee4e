//! # CPU Backend
//!
//! Binds the trainer to this crate's own autograd [`Tensor`] and [`optim`](crate::optim)
//! optimizers.

use super::{Backend, GradientMap, OptimizerHandle, OptimizerId};
use crate::batch::{MultiAgentBatch, NestedTensorDict};
use crate::error::{Result, TrainerError};
use crate::optim::{Optimizer, OptimizerConfig};
use crate::rl_module::RlModule;
use crate::tensor::{ops, Tensor};
use crate::trainer::hooks::LossResult;
use crate::trainer::registry::ParameterRegistry;
use ndarray::ArrayD;
use std::collections::BTreeSet;
use tracing::debug;

/// Identity of a CPU parameter: the address of its shared data cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuParamRef(usize);

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    type Tensor = Tensor;
    type Param = Tensor;
    type ParamRef = CpuParamRef;
    type Optimizer = Box<dyn Optimizer>;
    type OptimizerClass = OptimizerConfig;

    fn get_param_ref(&self, param: &Tensor) -> CpuParamRef {
        CpuParamRef(param.id())
    }

    fn get_parameters(&self, module: &dyn RlModule<Self>) -> Vec<Tensor> {
        module
            .named_parameters()
            .into_values()
            .filter(|p| p.requires_grad())
            .collect()
    }

    fn get_optimizer_obj(
        &self,
        module: &dyn RlModule<Self>,
        optimizer_class: &OptimizerConfig,
    ) -> Result<OptimizerHandle<Box<dyn Optimizer>>> {
        let optimizer = optimizer_class.build(self.get_parameters(module))?;
        Ok(OptimizerHandle::new(optimizer))
    }

    fn compute_gradients(
        &self,
        loss: &LossResult<Tensor>,
        registry: &ParameterRegistry<Self>,
    ) -> Result<GradientMap<Self>> {
        let mut gradients = GradientMap::<Self>::new();
        let total = match &loss.total_loss {
            Some(total) if total.requires_grad() => total,
            _ => return Ok(gradients),
        };

        // Gradients accumulate in place, so stale ones from the last update must go first.
        for (_, param) in registry.params() {
            param.zero_grad()?;
        }
        total.backward()?;

        for (param_ref, param) in registry.params() {
            if let Some(grad) = param.grad()? {
                gradients.insert(*param_ref, Tensor::new(grad, false));
            }
        }
        debug!(num_gradients = gradients.len(), "computed gradients");
        Ok(gradients)
    }

    fn apply_gradients(&self, gradients: &GradientMap<Self>, registry: &ParameterRegistry<Self>) -> Result<()> {
        let mut owners: BTreeSet<OptimizerId> = BTreeSet::new();
        for param_ref in gradients.keys() {
            let owner = registry.get_optimizer_id(param_ref).ok_or_else(|| {
                TrainerError::RegistryInconsistent(format!("gradient for unregistered parameter {:?}", param_ref))
            })?;
            owners.insert(owner);
        }

        // Only the post-processed gradients may reach the optimizers.
        for owner in &owners {
            if let Some(handle) = registry.get_optimizer(owner) {
                handle.lock()?.zero_grad()?;
            }
        }
        for (param_ref, grad) in gradients {
            let param = registry.get_param(param_ref).ok_or_else(|| {
                TrainerError::RegistryInconsistent(format!("no parameter behind {:?}", param_ref))
            })?;
            param.set_grad(grad.data_clone()?)?;
        }

        for owner in owners {
            let handle = registry.get_optimizer(&owner).ok_or_else(|| {
                TrainerError::RegistryInconsistent(format!("optimizer {:?} is not tracked", owner))
            })?;
            let mut optimizer = handle.lock()?;
            optimizer.step()?;
            debug!(optimizer = optimizer.name(), lr = optimizer.learning_rate(), "stepped optimizer");
        }
        Ok(())
    }

    fn convert_batch_type(&self, batch: &MultiAgentBatch) -> Result<NestedTensorDict<Tensor>> {
        Ok(batch
            .iter()
            .map(|(module_id, columns)| {
                let tensors = columns
                    .iter()
                    .map(|(key, array)| (key.clone(), Tensor::new(array.clone(), false)))
                    .collect();
                (module_id.clone(), tensors)
            })
            .collect())
    }

    fn add_losses(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        Ok(ops::add(a, b)?)
    }

    fn scale(&self, tensor: &Tensor, factor: f32) -> Result<Tensor> {
        Ok(ops::mul_scalar(tensor, factor)?)
    }

    fn to_ndarray(&self, tensor: &Tensor) -> Result<ArrayD<f32>> {
        Ok(tensor.data_clone()?)
    }
}

/// Euclidean norm over every gradient entry.
pub fn global_norm(gradients: &GradientMap<CpuBackend>) -> Result<f32> {
    let mut sum_sq = 0.0f32;
    for grad in gradients.values() {
        sum_sq += grad.data()?.iter().map(|g| g * g).sum::<f32>();
    }
    Ok(sum_sq.sqrt())
}

/// Rescales `gradients` so their global norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_by_global_norm(gradients: &mut GradientMap<CpuBackend>, max_norm: f32) -> Result<f32> {
    let norm = global_norm(gradients)?;
    if norm > max_norm && norm > 0.0 {
        let factor = max_norm / norm;
        for grad in gradients.values_mut() {
            let scaled = grad.data()?.mapv(|g| g * factor);
            *grad = Tensor::new(scaled, false);
        }
    }
    Ok(norm)
}
