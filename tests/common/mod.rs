//! Test doubles: a scalar backend that records every hook it sees.

#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use rl_trainer::backend::{Backend, GradientMap, OptimizerHandle};
use rl_trainer::batch::{MultiAgentBatch, NestedTensorDict, SampleBatch, TensorDict};
use rl_trainer::error::{Result, TrainerError};
use rl_trainer::rl_module::{
    ModuleClass, ModuleKwargs, ModuleSpec, ModuleState, MultiAgentModuleClass, MultiAgentRlModule, RlModule,
    SingleAgentModuleClass,
};
use rl_trainer::trainer::hooks::{compile_results_default, compute_loss_default};
use rl_trainer::trainer::{LossResult, LossStats, ParameterRegistry, ResultDict, TrainerHooks, TOTAL_LOSS_KEY};
use rl_trainer::utils::TensorState;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn record(log: &Log, event: &str) {
    log.lock().unwrap().push(event.to_string());
}

pub fn events(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

static NEXT_PARAM_ID: AtomicUsize = AtomicUsize::new(1);

/// A scalar parameter with reference semantics.
#[derive(Clone, Debug)]
pub struct FakeParam {
    pub id: usize,
    pub value: Arc<Mutex<f64>>,
}

impl FakeParam {
    pub fn new(value: f64) -> Self {
        FakeParam {
            id: NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed),
            value: Arc::new(Mutex::new(value)),
        }
    }

    pub fn get(&self) -> f64 {
        *self.value.lock().unwrap()
    }
}

#[derive(Debug)]
pub struct FakeOptimizer {
    pub label: String,
    pub param_ids: Vec<usize>,
    pub steps: usize,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub log: Log,
}

impl FakeBackend {
    pub fn new(log: Log) -> Self {
        FakeBackend { log }
    }
}

impl Backend for FakeBackend {
    type Tensor = f64;
    type Param = FakeParam;
    type ParamRef = usize;
    type Optimizer = FakeOptimizer;
    type OptimizerClass = String;

    fn get_param_ref(&self, param: &FakeParam) -> usize {
        param.id
    }

    fn get_parameters(&self, module: &dyn RlModule<Self>) -> Vec<FakeParam> {
        module.named_parameters().into_values().collect()
    }

    fn get_optimizer_obj(&self, module: &dyn RlModule<Self>, class: &String) -> Result<OptimizerHandle<FakeOptimizer>> {
        Ok(OptimizerHandle::new(FakeOptimizer {
            label: class.clone(),
            param_ids: self.get_parameters(module).iter().map(|p| p.id).collect(),
            steps: 0,
        }))
    }

    /// Every registered parameter gets the total loss as its gradient.
    fn compute_gradients(&self, loss: &LossResult<f64>, registry: &ParameterRegistry<Self>) -> Result<GradientMap<Self>> {
        record(&self.log, "compute_gradients");
        let mut grads = GradientMap::<Self>::new();
        if let Some(total) = loss.total_loss {
            for (param_ref, _) in registry.params() {
                grads.insert(*param_ref, total);
            }
        }
        Ok(grads)
    }

    fn apply_gradients(&self, gradients: &GradientMap<Self>, registry: &ParameterRegistry<Self>) -> Result<()> {
        record(&self.log, "apply_gradients");
        let mut stepped = std::collections::BTreeSet::new();
        for (param_ref, grad) in gradients {
            let param = registry
                .get_param(param_ref)
                .ok_or_else(|| TrainerError::RegistryInconsistent(format!("{}", param_ref)))?;
            *param.value.lock().unwrap() -= 0.1 * grad;
            if let Some(owner) = registry.get_optimizer_id(param_ref) {
                stepped.insert(owner);
            }
        }
        for owner in stepped {
            if let Some(handle) = registry.get_optimizer(&owner) {
                handle.lock()?.steps += 1;
            }
        }
        Ok(())
    }

    /// Each column collapses to the sum of its values.
    fn convert_batch_type(&self, batch: &MultiAgentBatch) -> Result<NestedTensorDict<f64>> {
        record(&self.log, "convert_batch");
        Ok(batch
            .iter()
            .map(|(id, columns)| {
                let converted = columns
                    .iter()
                    .map(|(key, array)| (key.clone(), array.iter().map(|&v| v as f64).sum()))
                    .collect();
                (id.clone(), converted)
            })
            .collect())
    }

    fn add_losses(&self, a: &f64, b: &f64) -> Result<f64> {
        Ok(a + b)
    }

    fn scale(&self, tensor: &f64, factor: f32) -> Result<f64> {
        Ok(tensor * factor as f64)
    }

    fn to_ndarray(&self, tensor: &f64) -> Result<ArrayD<f32>> {
        Ok(ArrayD::from_elem(IxDyn(&[]), *tensor as f32))
    }
}

// --- Modules ---

pub struct FakeModule {
    pub params: BTreeMap<String, FakeParam>,
    pub log: Log,
}

impl FakeModule {
    pub fn new(num_params: usize, init: f64, log: Log) -> Self {
        let params = (0..num_params)
            .map(|i| (format!("p{}", i), FakeParam::new(init + i as f64)))
            .collect();
        FakeModule { params, log }
    }
}

impl RlModule<FakeBackend> for FakeModule {
    /// `out` = sum of the batch's `obs` column plus the sum of all parameter values.
    fn forward_train(&self, batch: &TensorDict<f64>) -> Result<TensorDict<f64>> {
        record(&self.log, "forward_train");
        let obs = batch.get("obs").copied().unwrap_or(0.0);
        let weights: f64 = self.params.values().map(|p| p.get()).sum();
        let mut out = TensorDict::new();
        out.insert("out".to_string(), obs + weights);
        Ok(out)
    }

    fn named_parameters(&self) -> BTreeMap<String, FakeParam> {
        self.params.clone()
    }

    fn get_state(&self) -> Result<ModuleState> {
        Ok(self
            .params
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    TensorState {
                        shape: vec![1],
                        data: vec![p.get() as f32],
                    },
                )
            })
            .collect())
    }

    fn set_state(&mut self, state: &ModuleState) -> Result<()> {
        for (name, saved) in state {
            let param = self
                .params
                .get(name)
                .ok_or_else(|| TrainerError::Config(format!("unknown parameter {}", name)))?;
            *param.value.lock().unwrap() = saved.data[0] as f64;
        }
        Ok(())
    }
}

fn kwarg_usize(kwargs: &ModuleKwargs, key: &str, default: usize) -> usize {
    kwargs.get(key).and_then(|v| v.as_u64()).map_or(default, |v| v as usize)
}

/// Single-agent class. Kwargs: `{"num_params": n, "init": x}`.
pub struct FakeModuleClass {
    pub log: Log,
}

impl ModuleClass<FakeBackend> for FakeModuleClass {
    fn name(&self) -> &str {
        "FakeModule"
    }

    fn as_single_agent(&self) -> Option<&dyn SingleAgentModuleClass<FakeBackend>> {
        Some(self)
    }
}

impl SingleAgentModuleClass<FakeBackend> for FakeModuleClass {
    fn build_module(&self, kwargs: &ModuleKwargs) -> Result<Box<dyn RlModule<FakeBackend>>> {
        let init = kwargs.get("init").and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(Box::new(FakeModule::new(kwarg_usize(kwargs, "num_params", 2), init, self.log.clone())))
    }
}

/// Multi-agent class. Kwargs: `{"ids": ["a", "b"], "num_params": n}`.
pub struct FakeMultiClass {
    pub log: Log,
}

impl ModuleClass<FakeBackend> for FakeMultiClass {
    fn name(&self) -> &str {
        "FakeMulti"
    }

    fn as_multi_agent(&self) -> Option<&dyn MultiAgentModuleClass<FakeBackend>> {
        Some(self)
    }
}

impl MultiAgentModuleClass<FakeBackend> for FakeMultiClass {
    fn build_multi_agent(&self, kwargs: &ModuleKwargs) -> Result<MultiAgentRlModule<FakeBackend>> {
        let num_params = kwarg_usize(kwargs, "num_params", 2);
        let mut container = MultiAgentRlModule::new();
        for id in kwargs.get("ids").and_then(|v| v.as_array()).into_iter().flatten() {
            let id = id.as_str().unwrap_or_default().to_string();
            container.add_module(id, Box::new(FakeModule::new(num_params, 0.0, self.log.clone())))?;
        }
        Ok(container)
    }
}

/// Claims neither capability.
pub struct OpaqueClass;

impl ModuleClass<FakeBackend> for OpaqueClass {
    fn name(&self) -> &str {
        "Opaque"
    }
}

// --- Hooks ---

/// One optimizer per module; per-module loss is either fixed or the module's `out`.
pub struct RecordingHooks {
    pub log: Log,
    pub fixed_losses: BTreeMap<String, f64>,
}

impl RecordingHooks {
    pub fn new(log: Log) -> Self {
        RecordingHooks {
            log,
            fixed_losses: BTreeMap::new(),
        }
    }
}

impl TrainerHooks<FakeBackend> for RecordingHooks {
    fn configure_optimizers(
        &mut self,
        backend: &FakeBackend,
        module: &MultiAgentRlModule<FakeBackend>,
    ) -> Result<Vec<rl_trainer::backend::ParamOptimizerPair<FakeBackend>>> {
        record(&self.log, "configure_optimizers");
        let mut pairs = Vec::new();
        for (id, m) in module.iter() {
            let params = backend.get_parameters(m);
            if params.is_empty() {
                continue;
            }
            pairs.push((params, backend.get_optimizer_obj(m, &format!("opt-{}", id))?));
        }
        Ok(pairs)
    }

    fn compute_loss(
        &self,
        backend: &FakeBackend,
        fwd_out: &NestedTensorDict<f64>,
        batch: &NestedTensorDict<f64>,
    ) -> Result<LossResult<f64>> {
        record(&self.log, "compute_loss");
        compute_loss_default(self, backend, fwd_out, batch)
    }

    fn compute_loss_per_module(
        &self,
        _backend: &FakeBackend,
        module_id: &str,
        fwd_out: &TensorDict<f64>,
        _batch: &TensorDict<f64>,
    ) -> Result<LossStats<f64>> {
        let loss = match self.fixed_losses.get(module_id) {
            Some(v) => *v,
            None => fwd_out.get("out").copied().unwrap_or(0.0),
        };
        let mut stats = LossStats::new();
        stats.insert(TOTAL_LOSS_KEY.to_string(), loss);
        stats.insert("aux".to_string(), loss * 10.0);
        Ok(stats)
    }

    fn postprocess_gradients(&mut self, _backend: &FakeBackend, gradients: GradientMap<FakeBackend>) -> Result<GradientMap<FakeBackend>> {
        record(&self.log, "postprocess_gradients");
        Ok(gradients)
    }

    fn compile_results(
        &self,
        backend: &FakeBackend,
        _batch: &MultiAgentBatch,
        _fwd_out: &NestedTensorDict<f64>,
        loss: &LossResult<f64>,
        gradients: &GradientMap<FakeBackend>,
    ) -> Result<ResultDict> {
        record(&self.log, "compile_results");
        compile_results_default(backend, loss, gradients)
    }
}

/// Implements only the required hook, so every default is exercised.
pub struct MinimalHooks;

impl TrainerHooks<FakeBackend> for MinimalHooks {
    fn configure_optimizers(
        &mut self,
        _backend: &FakeBackend,
        _module: &MultiAgentRlModule<FakeBackend>,
    ) -> Result<Vec<rl_trainer::backend::ParamOptimizerPair<FakeBackend>>> {
        Ok(Vec::new())
    }
}

// --- Builders ---

pub fn single_spec(log: &Log, num_params: usize) -> ModuleSpec<FakeBackend> {
    ModuleSpec::new(
        Arc::new(FakeModuleClass { log: log.clone() }),
        serde_json::json!({ "num_params": num_params }),
    )
}

pub fn multi_spec(log: &Log, ids: &[&str], num_params: usize) -> ModuleSpec<FakeBackend> {
    ModuleSpec::new(
        Arc::new(FakeMultiClass { log: log.clone() }),
        serde_json::json!({ "ids": ids, "num_params": num_params }),
    )
}

/// One row of `obs` for each listed module.
pub fn batch_for(ids: &[&str], obs: f32) -> MultiAgentBatch {
    ids.iter()
        .map(|id| {
            let mut columns = SampleBatch::new();
            columns.insert("obs".to_string(), ArrayD::from_elem(IxDyn(&[1, 1]), obs));
            (id.to_string(), columns)
        })
        .collect()
}
