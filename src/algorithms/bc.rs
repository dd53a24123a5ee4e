//! # Behaviour Cloning
//!
//! Regresses each module's predicted actions onto the actions in the batch with a
//! mean-squared-error loss. Also keeps a Polyak-averaged copy of every module's
//! weights, refreshed through `additional_update`.

use crate::backend::cpu::{clip_by_global_norm, global_norm};
use crate::backend::{Backend, CpuBackend, GradientMap, ParamOptimizerPair};
use crate::batch::{ModuleId, MultiAgentBatch, NestedTensorDict, TensorDict};
use crate::error::{Result, TrainerError};
use crate::nn::MSELoss;
use crate::optim::OptimizerConfig;
use crate::rl_module::{polyak_update, ModuleState, MultiAgentRlModule, RlModule};
use crate::tensor::Tensor;
use crate::trainer::hooks::compile_results_default;
use crate::trainer::{LossResult, LossStats, Metric, ResultDict, RlTrainer, TrainerHooks, UpdateArgs, TOTAL_LOSS_KEY};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub type BcTrainer = RlTrainer<CpuBackend, BcHooks>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BcConfig {
    /// Optimizer built for every module at build time.
    pub optimizer: OptimizerConfig,
    /// Forward-output column holding predicted actions.
    pub prediction_key: String,
    /// Batch column holding the demonstrated actions.
    pub target_key: String,
    /// Clip gradients to this global L2 norm.
    pub max_grad_norm: Option<f32>,
    /// Default Polyak coefficient for target smoothing.
    pub target_update_tau: f32,
}

impl Default for BcConfig {
    fn default() -> Self {
        BcConfig {
            optimizer: OptimizerConfig::default(),
            prediction_key: "action_pred".to_string(),
            target_key: "actions".to_string(),
            max_grad_norm: None,
            target_update_tau: 0.005,
        }
    }
}

#[derive(Debug, Default)]
pub struct BcHooks {
    config: BcConfig,
    // Global gradient norm of the last update, before clipping
    last_grad_norm: Option<f32>,
    targets: BTreeMap<ModuleId, ModuleState>,
}

impl BcHooks {
    pub fn new(config: BcConfig) -> Self {
        BcHooks {
            config,
            last_grad_norm: None,
            targets: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BcConfig {
        &self.config
    }

    /// Smoothed weights of `module_id`, once `additional_update` has run for it.
    pub fn target_state(&self, module_id: &str) -> Option<&ModuleState> {
        self.targets.get(module_id)
    }
}

impl TrainerHooks<CpuBackend> for BcHooks {
    fn configure_optimizers(
        &mut self,
        backend: &CpuBackend,
        module: &MultiAgentRlModule<CpuBackend>,
    ) -> Result<Vec<ParamOptimizerPair<CpuBackend>>> {
        self.targets.clear();
        let mut pairs = Vec::with_capacity(module.len());
        for (module_id, m) in module.iter() {
            let params = backend.get_parameters(m);
            if params.is_empty() {
                debug!(module_id = %module_id, "module has no trainable parameters");
                continue;
            }
            let optimizer = backend.get_optimizer_obj(m, &self.config.optimizer)?;
            pairs.push((params, optimizer));
        }
        Ok(pairs)
    }

    fn compute_loss_per_module(
        &self,
        _backend: &CpuBackend,
        module_id: &str,
        fwd_out: &TensorDict<Tensor>,
        batch: &TensorDict<Tensor>,
    ) -> Result<LossStats<Tensor>> {
        let prediction = fwd_out.get(&self.config.prediction_key).ok_or_else(|| {
            TrainerError::Batch(format!(
                "module `{}` produced no `{}`",
                module_id, self.config.prediction_key
            ))
        })?;
        let target = batch.get(&self.config.target_key).ok_or_else(|| {
            TrainerError::Batch(format!("batch for `{}` has no `{}`", module_id, self.config.target_key))
        })?;
        if prediction.shape() != target.shape() {
            return Err(TrainerError::Batch(format!(
                "module `{}`: prediction shape {:?} does not match target shape {:?}",
                module_id,
                prediction.shape(),
                target.shape()
            )));
        }

        let mse = MSELoss::new().forward(prediction, target)?;
        let mut stats = LossStats::new();
        stats.insert("mse_loss".to_string(), mse.clone());
        stats.insert(TOTAL_LOSS_KEY.to_string(), mse);
        Ok(stats)
    }

    fn postprocess_gradients(
        &mut self,
        _backend: &CpuBackend,
        mut gradients: GradientMap<CpuBackend>,
    ) -> Result<GradientMap<CpuBackend>> {
        let norm = match self.config.max_grad_norm {
            Some(max_norm) => clip_by_global_norm(&mut gradients, max_norm)?,
            None => global_norm(&gradients)?,
        };
        self.last_grad_norm = Some(norm);
        Ok(gradients)
    }

    fn compile_results(
        &self,
        backend: &CpuBackend,
        _batch: &MultiAgentBatch,
        _fwd_out: &NestedTensorDict<Tensor>,
        loss: &LossResult<Tensor>,
        gradients: &GradientMap<CpuBackend>,
    ) -> Result<ResultDict> {
        let mut results = compile_results_default(backend, loss, gradients)?;
        if let Some(norm) = self.last_grad_norm {
            results.insert("gradient_norm".to_string(), Metric::from(norm));
        }
        Ok(results)
    }

    /// Moves the module's target copy towards its online weights.
    ///
    /// The `tau` kwarg overrides [`BcConfig::target_update_tau`]. The first call
    /// for a module copies the online weights verbatim.
    fn additional_update_per_module(
        &mut self,
        _backend: &CpuBackend,
        module_id: &str,
        module: &mut dyn RlModule<CpuBackend>,
        args: &UpdateArgs,
    ) -> Result<ResultDict> {
        let tau = args
            .kwarg_f64("tau")
            .map(|t| t as f32)
            .unwrap_or(self.config.target_update_tau);
        if !(0.0..=1.0).contains(&tau) {
            return Err(TrainerError::Config(format!("tau must be in [0, 1], got {}", tau)));
        }

        let online = module.get_state()?;
        let distance = match self.targets.get_mut(module_id) {
            Some(target) => polyak_update(target, &online, tau)?,
            None => {
                self.targets.insert(module_id.to_string(), online);
                0.0
            }
        };

        let mut results = ResultDict::new();
        results.insert("tau".to_string(), Metric::from(tau));
        results.insert("target_distance".to_string(), Metric::from(distance));
        Ok(results)
    }
}
