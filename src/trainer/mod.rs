//! # RL Trainer
//!
//! Owns the module container and the parameter registry, and drives one update:
//!
//! ```text
//! convert batch -> forward_train -> compute_loss -> compute_gradients
//!     -> postprocess_gradients -> apply_gradients -> compile_results
//! ```
//!
//! Backend specifics live behind [`Backend`]; algorithm specifics behind [`TrainerHooks`].

use crate::backend::{Backend, ParamOptimizerPair};
use crate::batch::{without_empty_modules, ModuleId, MultiAgentBatch, NestedTensorDict};
use crate::config::TrainerConfig;
use crate::error::{Result, TrainerError};
use crate::rl_module::{build_single, ModuleClass, ModuleKwargs, ModuleSpec, MultiAgentRlModule, MultiAgentState, RlModule};
use crate::utils::serialization;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, debug_span, info, warn};

pub mod hooks;
pub mod registry;
pub mod results;

pub use hooks::{LossResult, LossStats, TrainerHooks, UpdateArgs, UpdateContext, TOTAL_LOSS_KEY};
pub use registry::ParameterRegistry;
pub use results::{Metric, ResultDict};

/// Custom optimizer wiring for a module added at runtime.
pub type SetOptimizerFn<B> = dyn Fn(&B, &dyn RlModule<B>) -> Result<Vec<ParamOptimizerPair<B>>>;

/// Persisted trainer state. Optimizer internals are not part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    #[serde(default)]
    pub module_state: MultiAgentState,
}

pub struct RlTrainer<B: Backend, H: TrainerHooks<B>> {
    backend: B,
    hooks: H,
    module_spec: ModuleSpec<B>,
    config: TrainerConfig,
    // Set by build()
    module: Option<MultiAgentRlModule<B>>,
    registry: ParameterRegistry<B>,
}

impl<B: Backend, H: TrainerHooks<B>> RlTrainer<B, H> {
    pub fn new(backend: B, hooks: H, module_spec: ModuleSpec<B>, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(RlTrainer {
            backend,
            hooks,
            module_spec,
            config,
            module: None,
            registry: ParameterRegistry::new(),
        })
    }

    // --- Accessors ---

    /// The module container, or `None` before [`build`](Self::build).
    pub fn module(&self) -> Option<&MultiAgentRlModule<B>> {
        self.module.as_ref()
    }

    pub fn registry(&self) -> &ParameterRegistry<B> {
        &self.registry
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn module_spec(&self) -> &ModuleSpec<B> {
        &self.module_spec
    }

    pub fn is_built(&self) -> bool {
        self.module.is_some()
    }

    // --- Lifecycle ---

    /// Builds the module container and registers the optimizers for it.
    ///
    /// Calling this again discards the current modules and registry.
    pub fn build(&mut self) -> Result<()> {
        if self.module.take().is_some() {
            warn!("rebuilding trainer; existing modules and optimizers are discarded");
        }
        self.registry.clear();

        let module = if self.config.distributed {
            self.hooks
                .make_distributed_module(&self.backend, &self.module_spec, &self.config)?
        } else {
            self.module_spec.make_module()?
        };

        let pairs = self.hooks.configure_optimizers(&self.backend, &module)?;
        let mut registry = ParameterRegistry::new();
        registry.validate_pairs(&self.backend, &pairs)?;
        for (params, optimizer) in &pairs {
            registry.register(&self.backend, params, optimizer)?;
        }

        info!(
            module_class = self.module_spec.module_class.name(),
            num_modules = module.len(),
            num_optimizers = registry.num_optimizers(),
            num_params = registry.num_params(),
            distributed = self.config.distributed,
            "built trainer"
        );
        self.registry = registry;
        self.module = Some(module);
        Ok(())
    }

    /// Instantiates a module and wires its optimizers.
    ///
    /// Wiring comes from `set_optimizer_fn` when given; otherwise one optimizer of
    /// `optimizer_class` is built over all of the module's parameters. On error
    /// neither the registry nor the container changes.
    pub fn add_module(
        &mut self,
        module_id: impl Into<ModuleId>,
        module_class: &dyn ModuleClass<B>,
        module_kwargs: &ModuleKwargs,
        set_optimizer_fn: Option<&SetOptimizerFn<B>>,
        optimizer_class: Option<&B::OptimizerClass>,
    ) -> Result<()> {
        let container = self.module.as_mut().ok_or(TrainerError::NotBuilt)?;
        let module_id = module_id.into();
        if container.contains(&module_id) {
            return Err(TrainerError::DuplicateModule(module_id));
        }

        let (module, pairs) = match (set_optimizer_fn, optimizer_class) {
            (Some(wire), _) => {
                let module = build_single(module_class, module_kwargs)?;
                let pairs = wire(&self.backend, module.as_ref())?;
                (module, pairs)
            }
            (None, Some(class)) => {
                let module = build_single(module_class, module_kwargs)?;
                let params = self.backend.get_parameters(module.as_ref());
                let optimizer = self.backend.get_optimizer_obj(module.as_ref(), class)?;
                (module, vec![(params, optimizer)])
            }
            (None, None) => {
                return Err(TrainerError::Config(
                    "either set_optimizer_fn or optimizer_class must be provided".to_string(),
                ))
            }
        };

        self.registry.validate_pairs(&self.backend, &pairs)?;
        for (params, optimizer) in &pairs {
            self.registry.register(&self.backend, params, optimizer)?;
        }
        container.add_module(module_id.clone(), module)?;

        info!(module_id = %module_id, num_optimizers = pairs.len(), "added module");
        Ok(())
    }

    /// Unregisters the module's parameters, then drops it from the container.
    pub fn remove_module(&mut self, module_id: &str) -> Result<()> {
        let container = self.module.as_mut().ok_or(TrainerError::NotBuilt)?;
        let module = container
            .get(module_id)
            .ok_or_else(|| TrainerError::UnknownModule(module_id.to_string()))?;
        let removed = self.registry.unregister(&self.backend, module);
        container.remove_module(module_id)?;

        info!(module_id, removed_params = removed, "removed module");
        Ok(())
    }

    // --- Updates ---

    /// Runs one gradient update on `batch` and returns its diagnostics.
    pub fn update(&mut self, batch: &MultiAgentBatch) -> Result<ResultDict> {
        let module = self.module.as_mut().ok_or(TrainerError::NotBuilt)?;
        let span = debug_span!("update", distributed = self.config.distributed);
        let _guard = span.enter();

        if self.config.distributed {
            let ctx = UpdateContext {
                backend: &self.backend,
                module,
                registry: &mut self.registry,
                config: &self.config,
            };
            return self.hooks.do_distributed_update(ctx, batch);
        }
        local_update(&self.backend, &mut self.hooks, module, &self.registry, batch)
    }

    /// Runs the per-module non-gradient hook for every module.
    pub fn additional_update(&mut self, args: &UpdateArgs) -> Result<BTreeMap<ModuleId, ResultDict>> {
        let container = self.module.as_mut().ok_or(TrainerError::NotBuilt)?;
        let module_ids: Vec<ModuleId> = container.keys().cloned().collect();

        let mut results = BTreeMap::new();
        for module_id in module_ids {
            let module = container
                .get_mut(&module_id)
                .ok_or_else(|| TrainerError::UnknownModule(module_id.clone()))?;
            let module_results = self
                .hooks
                .additional_update_per_module(&self.backend, &module_id, module, args)?;
            results.insert(module_id, module_results);
        }
        Ok(results)
    }

    // --- State ---

    pub fn get_state(&self) -> Result<TrainerState> {
        let module = self.module.as_ref().ok_or(TrainerError::NotBuilt)?;
        Ok(TrainerState {
            module_state: module.get_state()?,
        })
    }

    pub fn set_state(&mut self, state: &TrainerState) -> Result<()> {
        let module = self.module.as_mut().ok_or(TrainerError::NotBuilt)?;
        module.set_state(&state.module_state)
    }

    /// Writes [`get_state`](Self::get_state) to `path`.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = self.get_state()?;
        serialization::save(&state, path.as_ref())?;
        info!(path = %path.as_ref().display(), "saved checkpoint");
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        if !self.is_built() {
            return Err(TrainerError::NotBuilt);
        }
        let state: TrainerState = serialization::load(path.as_ref())?;
        self.set_state(&state)?;
        info!(path = %path.as_ref().display(), "loaded checkpoint");
        Ok(())
    }
}

impl<B: Backend, H: TrainerHooks<B>> fmt::Debug for RlTrainer<B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RlTrainer")
            .field("module_spec", &self.module_spec)
            .field("config", &self.config)
            .field("module", &self.module)
            .field("registry", &self.registry)
            .finish()
    }
}

// --- Pipeline ---

/// The single-process pipeline: convert, forward, loss, then [`finish_update`].
///
/// Modules whose batch has no rows are left out of the forward pass and the loss.
pub fn local_update<B, H>(
    backend: &B,
    hooks: &mut H,
    module: &MultiAgentRlModule<B>,
    registry: &ParameterRegistry<B>,
    batch: &MultiAgentBatch,
) -> Result<ResultDict>
where
    B: Backend,
    H: TrainerHooks<B> + ?Sized,
{
    let active = without_empty_modules(batch)?;
    let tensors = backend.convert_batch_type(&active)?;
    let fwd_out = module.forward_train(&tensors)?;
    let loss = hooks.compute_loss(backend, &fwd_out, &tensors)?;
    finish_update(backend, hooks, registry, batch, &fwd_out, &loss)
}

/// Gradient half of the pipeline, shared by local and distributed updates.
pub fn finish_update<B, H>(
    backend: &B,
    hooks: &mut H,
    registry: &ParameterRegistry<B>,
    batch: &MultiAgentBatch,
    fwd_out: &NestedTensorDict<B::Tensor>,
    loss: &LossResult<B::Tensor>,
) -> Result<ResultDict>
where
    B: Backend,
    H: TrainerHooks<B> + ?Sized,
{
    let gradients = backend.compute_gradients(loss, registry)?;
    let gradients = hooks.postprocess_gradients(backend, gradients)?;
    backend.apply_gradients(&gradients, registry)?;
    let results = hooks.compile_results(backend, batch, fwd_out, loss, &gradients)?;
    debug!(
        num_modules = loss.per_module.len(),
        num_gradients = gradients.len(),
        "update finished"
    );
    Ok(results)
}
