//! # Trainer Hooks
//!
//! Algorithm-specific extension points of the update pipeline. Only
//! `configure_optimizers` is required; every other hook either has a usable
//! default or fails with [`TrainerError::NotImplemented`] until overridden.

use super::results::{Metric, ResultDict};
use crate::backend::{Backend, GradientMap, ParamOptimizerPair};
use crate::batch::{ModuleId, MultiAgentBatch, NestedTensorDict, TensorDict};
use crate::config::TrainerConfig;
use crate::error::{Result, TrainerError};
use crate::rl_module::{ModuleSpec, MultiAgentRlModule, RlModule};
use crate::trainer::registry::ParameterRegistry;
use std::collections::BTreeMap;

/// Reserved key holding a module's loss, and the cross-module sum at the top level.
pub const TOTAL_LOSS_KEY: &str = "total_loss";

/// Named loss values of one module. Must contain [`TOTAL_LOSS_KEY`].
pub type LossStats<T> = BTreeMap<String, T>;

/// Per-module losses plus their sum.
#[derive(Debug, Clone)]
pub struct LossResult<T> {
    pub per_module: BTreeMap<ModuleId, LossStats<T>>,
    /// Sum of every module's `total_loss`; `None` when no module produced a loss.
    pub total_loss: Option<T>,
}

impl<T> LossResult<T> {
    pub fn empty() -> Self {
        LossResult {
            per_module: BTreeMap::new(),
            total_loss: None,
        }
    }
}

/// Caller-supplied arguments for `additional_update`.
#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl UpdateArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwarg_f64(&self, key: &str) -> Option<f64> {
        self.kwargs.get(key).and_then(|v| v.as_f64())
    }
}

/// Mutable view of a built trainer, handed to the distributed-update hook.
pub struct UpdateContext<'a, B: Backend> {
    pub backend: &'a B,
    pub module: &'a mut MultiAgentRlModule<B>,
    pub registry: &'a mut ParameterRegistry<B>,
    pub config: &'a TrainerConfig,
}

pub trait TrainerHooks<B: Backend>: Send {
    /// (parameters, optimizer) pairs covering the freshly built container.
    fn configure_optimizers(&mut self, backend: &B, module: &MultiAgentRlModule<B>) -> Result<Vec<ParamOptimizerPair<B>>>;

    /// Per-module losses and their sum. Defaults to [`compute_loss_default`].
    fn compute_loss(
        &self,
        backend: &B,
        fwd_out: &NestedTensorDict<B::Tensor>,
        batch: &NestedTensorDict<B::Tensor>,
    ) -> Result<LossResult<B::Tensor>> {
        compute_loss_default(self, backend, fwd_out, batch)
    }

    /// The algorithm's loss for one module.
    fn compute_loss_per_module(
        &self,
        _backend: &B,
        _module_id: &str,
        _fwd_out: &TensorDict<B::Tensor>,
        _batch: &TensorDict<B::Tensor>,
    ) -> Result<LossStats<B::Tensor>> {
        Err(TrainerError::NotImplemented("compute_loss_per_module"))
    }

    /// Transforms gradients before they are applied (clipping etc.). Identity by default.
    fn postprocess_gradients(&mut self, _backend: &B, gradients: GradientMap<B>) -> Result<GradientMap<B>> {
        Ok(gradients)
    }

    fn compile_results(
        &self,
        backend: &B,
        _batch: &MultiAgentBatch,
        _fwd_out: &NestedTensorDict<B::Tensor>,
        loss: &LossResult<B::Tensor>,
        gradients: &GradientMap<B>,
    ) -> Result<ResultDict> {
        compile_results_default(backend, loss, gradients)
    }

    /// Non-gradient maintenance for one module, e.g. target-network smoothing.
    fn additional_update_per_module(
        &mut self,
        _backend: &B,
        _module_id: &str,
        _module: &mut dyn RlModule<B>,
        _args: &UpdateArgs,
    ) -> Result<ResultDict> {
        Err(TrainerError::NotImplemented("additional_update_per_module"))
    }

    /// Builds the container when the trainer runs distributed.
    fn make_distributed_module(
        &mut self,
        _backend: &B,
        _module_spec: &ModuleSpec<B>,
        _config: &TrainerConfig,
    ) -> Result<MultiAgentRlModule<B>> {
        Err(TrainerError::NotImplemented("make_distributed_module"))
    }

    /// Runs one update when the trainer runs distributed.
    fn do_distributed_update(&mut self, _ctx: UpdateContext<'_, B>, _batch: &MultiAgentBatch) -> Result<ResultDict> {
        Err(TrainerError::NotImplemented("do_distributed_update"))
    }
}

/// Calls `compute_loss_per_module` for every module in `fwd_out` and sums the
/// modules' `total_loss` values into [`LossResult::total_loss`].
pub fn compute_loss_default<B, H>(
    hooks: &H,
    backend: &B,
    fwd_out: &NestedTensorDict<B::Tensor>,
    batch: &NestedTensorDict<B::Tensor>,
) -> Result<LossResult<B::Tensor>>
where
    B: Backend,
    H: TrainerHooks<B> + ?Sized,
{
    let mut result = LossResult::empty();
    let mut total: Option<B::Tensor> = None;

    for (module_id, module_out) in fwd_out {
        let module_batch = batch
            .get(module_id)
            .ok_or_else(|| TrainerError::Batch(format!("no batch for module `{}`", module_id)))?;
        let stats = hooks.compute_loss_per_module(backend, module_id, module_out, module_batch)?;
        let module_loss = stats
            .get(TOTAL_LOSS_KEY)
            .ok_or_else(|| TrainerError::MissingTotalLoss(module_id.clone()))?;
        total = Some(match total {
            Some(running) => backend.add_losses(&running, module_loss)?,
            None => module_loss.clone(),
        });
        result.per_module.insert(module_id.clone(), stats);
    }

    result.total_loss = total;
    Ok(result)
}

/// Numeric copies of all losses plus `mean_gradient`.
///
/// `mean_gradient` is the mean over parameters of each gradient's own mean, so
/// parameters of different sizes weigh the same. It is NaN when there are no gradients
/// or when any gradient has no elements.
pub fn compile_results_default<B: Backend>(
    backend: &B,
    loss: &LossResult<B::Tensor>,
    gradients: &GradientMap<B>,
) -> Result<ResultDict> {
    let mut losses = BTreeMap::new();
    for (module_id, stats) in &loss.per_module {
        let mut module_metrics = BTreeMap::new();
        for (name, value) in stats {
            module_metrics.insert(name.clone(), Metric::from_array(&backend.to_ndarray(value)?));
        }
        losses.insert(module_id.clone(), Metric::Nested(module_metrics));
    }
    if let Some(total) = &loss.total_loss {
        losses.insert(TOTAL_LOSS_KEY.to_string(), Metric::from_array(&backend.to_ndarray(total)?));
    }

    let mut sum_of_means = 0.0f64;
    for grad in gradients.values() {
        let array = backend.to_ndarray(grad)?;
        // An empty gradient has no mean.
        let mean = if array.is_empty() {
            f64::NAN
        } else {
            array.iter().map(|&v| v as f64).sum::<f64>() / array.len() as f64
        };
        sum_of_means += mean;
    }
    let mean_gradient = if gradients.is_empty() {
        f64::NAN
    } else {
        sum_of_means / gradients.len() as f64
    };

    let mut results = ResultDict::new();
    results.insert("loss".to_string(), Metric::Nested(losses));
    results.insert("mean_gradient".to_string(), Metric::Scalar(mean_gradient));
    Ok(results)
}
