//! # MLP Module
//!
//! A feed-forward policy network for the CPU backend, plus the module classes that
//! build it from JSON kwargs.

use super::{
    ModuleClass, ModuleKwargs, ModuleState, MultiAgentModuleClass, MultiAgentRlModule, RlModule,
    SingleAgentModuleClass,
};
use crate::backend::CpuBackend;
use crate::batch::{ModuleId, TensorDict};
use crate::error::{Result, TrainerError};
use crate::nn::{Linear, Module, ReLU, Sequential, Tanh};
use crate::tensor::Tensor;
use crate::utils::serialization::{SerializationError, TensorState};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub activation: Activation,
    pub seed: u64,
    /// Batch column fed to the network.
    pub input_key: String,
    /// Output column written by the forward pass.
    pub output_key: String,
}

impl Default for MlpConfig {
    fn default() -> Self {
        MlpConfig {
            input_dim: 1,
            output_dim: 1,
            hidden_dims: vec![64, 64],
            activation: Activation::Tanh,
            seed: 0,
            input_key: "obs".to_string(),
            output_key: "action_pred".to_string(),
        }
    }
}

impl MlpConfig {
    pub fn new(input_dim: usize, output_dim: usize, hidden_dims: Vec<usize>) -> Self {
        MlpConfig {
            input_dim,
            output_dim,
            hidden_dims,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn from_kwargs(kwargs: &ModuleKwargs) -> Result<Self> {
        serde_json::from_value(kwargs.clone()).map_err(|e| TrainerError::Config(format!("invalid MLP kwargs: {}", e)))
    }
}

/// Linear layers with an activation between each pair.
#[derive(Debug)]
pub struct MlpModule {
    config: MlpConfig,
    net: Sequential,
}

impl MlpModule {
    pub fn new(config: MlpConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut dims = vec![config.input_dim];
        dims.extend(&config.hidden_dims);
        dims.push(config.output_dim);

        let mut net = Sequential::new();
        for (i, pair) in dims.windows(2).enumerate() {
            net.add_module(Box::new(Linear::new(pair[0], pair[1], true, &mut rng)?));
            let is_last = i + 2 == dims.len();
            if !is_last {
                match config.activation {
                    Activation::Relu => net.add_module(Box::new(ReLU::new())),
                    Activation::Tanh => net.add_module(Box::new(Tanh::new())),
                }
            }
        }
        Ok(MlpModule { config, net })
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }
}

impl RlModule<CpuBackend> for MlpModule {
    fn forward_train(&self, batch: &TensorDict<Tensor>) -> Result<TensorDict<Tensor>> {
        let input = batch.get(&self.config.input_key).ok_or_else(|| {
            TrainerError::Batch(format!("missing input column `{}`", self.config.input_key))
        })?;
        let output = self.net.forward(input)?;
        let mut out = TensorDict::new();
        out.insert(self.config.output_key.clone(), output);
        Ok(out)
    }

    fn named_parameters(&self) -> BTreeMap<String, Tensor> {
        self.net.parameters()
    }

    fn get_state(&self) -> Result<ModuleState> {
        let mut state = ModuleState::new();
        for (name, param) in self.net.parameters() {
            state.insert(name, TensorState::from_tensor(&param)?);
        }
        Ok(state)
    }

    fn set_state(&mut self, state: &ModuleState) -> Result<()> {
        let params = self.net.parameters();
        if let Some(extra) = state.keys().find(|k| !params.contains_key(*k)) {
            return Err(SerializationError::UnexpectedKey(extra.clone()).into());
        }
        // Check everything before writing anything.
        for (name, param) in &params {
            let saved = state.get(name).ok_or_else(|| SerializationError::MissingKey(name.clone()))?;
            if saved.shape.as_slice() != param.shape() {
                return Err(SerializationError::ShapeMismatch {
                    key: name.clone(),
                    expected: param.shape().to_vec(),
                    got: saved.shape.clone(),
                }
                .into());
            }
        }
        for (name, param) in &params {
            if let Some(saved) = state.get(name) {
                saved.copy_into(name, param)?;
            }
        }
        Ok(())
    }
}

// --- Module classes ---

/// Builds one [`MlpModule`] from [`MlpConfig`] kwargs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MlpModuleClass;

impl ModuleClass<CpuBackend> for MlpModuleClass {
    fn name(&self) -> &str {
        "MlpModule"
    }

    fn as_single_agent(&self) -> Option<&dyn SingleAgentModuleClass<CpuBackend>> {
        Some(self)
    }
}

impl SingleAgentModuleClass<CpuBackend> for MlpModuleClass {
    fn build_module(&self, kwargs: &ModuleKwargs) -> Result<Box<dyn RlModule<CpuBackend>>> {
        Ok(Box::new(MlpModule::new(MlpConfig::from_kwargs(kwargs)?)?))
    }
}

/// Builds a container of MLPs from `{"modules": {"<id>": <MlpConfig>, ...}}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiMlpModuleClass;

#[derive(Deserialize)]
struct MultiMlpKwargs {
    modules: BTreeMap<ModuleId, MlpConfig>,
}

impl ModuleClass<CpuBackend> for MultiMlpModuleClass {
    fn name(&self) -> &str {
        "MultiMlpModule"
    }

    fn as_multi_agent(&self) -> Option<&dyn MultiAgentModuleClass<CpuBackend>> {
        Some(self)
    }
}

impl MultiAgentModuleClass<CpuBackend> for MultiMlpModuleClass {
    fn build_multi_agent(&self, kwargs: &ModuleKwargs) -> Result<MultiAgentRlModule<CpuBackend>> {
        let parsed: MultiMlpKwargs = serde_json::from_value(kwargs.clone())
            .map_err(|e| TrainerError::Config(format!("invalid multi-MLP kwargs: {}", e)))?;
        let mut container = MultiAgentRlModule::new();
        for (module_id, config) in parsed.modules {
            container.add_module(module_id, Box::new(MlpModule::new(config)?))?;
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl_module::{ModuleSpec, DEFAULT_MODULE_ID};
    use serde_json::json;
    use std::sync::Arc;

    fn obs_batch(rows: usize, dim: usize) -> TensorDict<Tensor> {
        let mut batch = TensorDict::new();
        batch.insert("obs".to_string(), crate::tensor::ones(&[rows, dim], false));
        batch
    }

    #[test]
    fn forward_writes_output_key() {
        let module = MlpModule::new(MlpConfig::new(3, 2, vec![8])).unwrap();
        let out = module.forward_train(&obs_batch(5, 3)).unwrap();
        assert_eq!(out["action_pred"].shape(), &[5, 2]);
        assert_eq!(module.named_parameters().len(), 4);
    }

    #[test]
    fn missing_input_column_is_a_batch_error() {
        let module = MlpModule::new(MlpConfig::new(3, 2, vec![])).unwrap();
        let err = module.forward_train(&TensorDict::new()).unwrap_err();
        assert!(matches!(err, TrainerError::Batch(_)));
    }

    #[test]
    fn set_state_keeps_parameter_identity() {
        let source = MlpModule::new(MlpConfig::new(2, 1, vec![4]).with_seed(1)).unwrap();
        let mut dest = MlpModule::new(MlpConfig::new(2, 1, vec![4]).with_seed(2)).unwrap();
        let ids_before: Vec<usize> = dest.named_parameters().values().map(|p| p.id()).collect();

        dest.set_state(&source.get_state().unwrap()).unwrap();

        let ids_after: Vec<usize> = dest.named_parameters().values().map(|p| p.id()).collect();
        assert_eq!(ids_before, ids_after);
        assert_eq!(dest.get_state().unwrap(), source.get_state().unwrap());
    }

    #[test]
    fn set_state_rejects_wrong_shapes_without_writing() {
        let mut small = MlpModule::new(MlpConfig::new(2, 1, vec![4])).unwrap();
        let before = small.get_state().unwrap();
        let big = MlpModule::new(MlpConfig::new(2, 1, vec![5])).unwrap();
        assert!(small.set_state(&big.get_state().unwrap()).is_err());
        assert_eq!(small.get_state().unwrap(), before);
    }

    #[test]
    fn single_class_is_wrapped_under_default_id() {
        let spec = ModuleSpec::new(Arc::new(MlpModuleClass), json!({"input_dim": 2, "output_dim": 1}));
        let container = spec.make_module().unwrap();
        assert_eq!(container.keys().collect::<Vec<_>>(), vec![DEFAULT_MODULE_ID]);
    }

    #[test]
    fn multi_class_builds_every_module() {
        let spec = ModuleSpec::new(
            Arc::new(MultiMlpModuleClass),
            json!({"modules": {"a": {"input_dim": 2}, "b": {"input_dim": 3, "seed": 4}}}),
        );
        let container = spec.make_module().unwrap();
        assert_eq!(container.len(), 2);
        assert!(container.contains("a") && container.contains("b"));
    }

    #[test]
    fn container_forward_rejects_unknown_module() {
        let container = MultiAgentRlModule::from_single("a", Box::new(MlpModule::new(MlpConfig::new(3, 1, vec![])).unwrap()) as Box<dyn RlModule<CpuBackend>>);
        let mut batch = crate::batch::NestedTensorDict::new();
        batch.insert("b".to_string(), obs_batch(1, 3));
        assert!(matches!(container.forward_train(&batch), Err(TrainerError::UnknownModule(id)) if id == "b"));
    }

    #[test]
    fn bad_kwargs_are_config_errors() {
        let spec = ModuleSpec::new(Arc::new(MlpModuleClass), json!({"input_dim": "three"}));
        assert!(matches!(spec.make_module(), Err(TrainerError::Config(_))));
    }
}
