//! # Numeric Backends
//!
//! The trainer never touches tensors directly. Everything that depends on how a
//! numeric library represents parameters, gradients and optimizers goes through
//! the [`Backend`] trait; one implementation exists per supported library.

use crate::batch::{MultiAgentBatch, NestedTensorDict};
use crate::error::{Result, TrainerError};
use crate::rl_module::RlModule;
use crate::trainer::hooks::LossResult;
use crate::trainer::registry::ParameterRegistry;
use ndarray::ArrayD;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

pub mod cpu;

pub use cpu::CpuBackend;

// --- Optimizer identity ---

/// Identity of an optimizer instance inside a trainer; used as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OptimizerId(usize);

/// Shared handle onto a backend optimizer.
///
/// Clones point at the same optimizer; [`OptimizerHandle::id`] is the address of
/// the shared cell, so it stays stable for as long as any clone is alive.
pub struct OptimizerHandle<O> {
    inner: Arc<Mutex<O>>,
}

impl<O> OptimizerHandle<O> {
    pub fn new(optimizer: O) -> Self {
        OptimizerHandle {
            inner: Arc::new(Mutex::new(optimizer)),
        }
    }

    pub fn id(&self) -> OptimizerId {
        OptimizerId(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, O>> {
        self.inner
            .lock()
            .map_err(|_| TrainerError::Backend("optimizer lock poisoned".to_string()))
    }
}

impl<O> Clone for OptimizerHandle<O> {
    fn clone(&self) -> Self {
        OptimizerHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O> Debug for OptimizerHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OptimizerHandle").field(&self.id()).finish()
    }
}

/// Parameter reference → gradient.
pub type GradientMap<B> = HashMap<<B as Backend>::ParamRef, <B as Backend>::Tensor>;

/// One optimizer together with the parameters it owns.
pub type ParamOptimizerPair<B> = (Vec<<B as Backend>::Param>, OptimizerHandle<<B as Backend>::Optimizer>);

// --- Backend trait ---

/// Backend-specific operations the trainer needs.
pub trait Backend: Send + Sync + Sized + 'static {
    /// Tensor type flowing through forward passes, losses and gradients.
    type Tensor: Clone + Debug + Send + Sync;
    /// Handle to one trainable array.
    type Param: Clone + Send + Sync;
    /// Hashable identity of a parameter. Distinct parameters must map to distinct refs.
    type ParamRef: Clone + Eq + Hash + Debug + Send + Sync;
    type Optimizer: Send;
    /// Description an optimizer can be built from.
    type OptimizerClass: Clone + Debug;

    fn get_param_ref(&self, param: &Self::Param) -> Self::ParamRef;

    fn get_parameters(&self, module: &dyn RlModule<Self>) -> Vec<Self::Param>;

    /// A fresh optimizer over all of `module`'s parameters.
    fn get_optimizer_obj(
        &self,
        module: &dyn RlModule<Self>,
        optimizer_class: &Self::OptimizerClass,
    ) -> Result<OptimizerHandle<Self::Optimizer>>;

    /// Gradients of `loss.total_loss` for every registered parameter that received one.
    fn compute_gradients(
        &self,
        loss: &LossResult<Self::Tensor>,
        registry: &ParameterRegistry<Self>,
    ) -> Result<GradientMap<Self>>;

    /// Writes `gradients` and steps each owning optimizer once.
    fn apply_gradients(&self, gradients: &GradientMap<Self>, registry: &ParameterRegistry<Self>) -> Result<()>;

    fn convert_batch_type(&self, batch: &MultiAgentBatch) -> Result<NestedTensorDict<Self::Tensor>>;

    /// Differentiable sum of two losses.
    fn add_losses(&self, a: &Self::Tensor, b: &Self::Tensor) -> Result<Self::Tensor>;

    /// Differentiable multiplication by a constant.
    fn scale(&self, tensor: &Self::Tensor, factor: f32) -> Result<Self::Tensor>;

    /// Detached numeric copy, used for diagnostics.
    fn to_ndarray(&self, tensor: &Self::Tensor) -> Result<ArrayD<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_identity_follows_the_shared_cell() {
        let a = OptimizerHandle::new(0u8);
        let b = a.clone();
        let c = OptimizerHandle::new(0u8);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        *b.lock().unwrap() = 7;
        assert_eq!(*a.lock().unwrap(), 7);
    }
}
