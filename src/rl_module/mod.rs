//! # RL Modules
//!
//! A module is a trainable function approximator with its own parameters. The
//! trainer only sees modules through [`RlModule`], and only builds them through a
//! [`ModuleClass`] whose capabilities (single-agent or multi-agent) are checked when
//! the container is made.

use crate::backend::Backend;
use crate::batch::TensorDict;
use crate::error::{Result, TrainerError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod marl;
pub mod mlp;
pub mod state;

pub use marl::MultiAgentRlModule;
pub use mlp::{MlpConfig, MlpModule, MlpModuleClass, MultiMlpModuleClass};
pub use state::{polyak_update, ModuleState, MultiAgentState};

/// Id a single-agent module gets when it is wrapped into a container.
pub const DEFAULT_MODULE_ID: &str = "default_policy";

/// Constructor arguments for a module class (a JSON object, parsed by the class).
pub type ModuleKwargs = serde_json::Value;

// --- Module trait ---

pub trait RlModule<B: Backend>: Send + Sync {
    /// Training-mode forward pass over one module's converted batch.
    fn forward_train(&self, batch: &TensorDict<B::Tensor>) -> Result<TensorDict<B::Tensor>>;

    /// Parameters keyed by name, in a deterministic order.
    fn named_parameters(&self) -> BTreeMap<String, B::Param>;

    fn get_state(&self) -> Result<ModuleState>;

    /// Restores weights in place. Parameter identity must survive a restore.
    fn set_state(&mut self, state: &ModuleState) -> Result<()>;
}

// --- Module classes ---

/// Something that knows how to build modules. Capabilities are opt-in.
pub trait ModuleClass<B: Backend>: Send + Sync {
    fn name(&self) -> &str;

    fn as_single_agent(&self) -> Option<&dyn SingleAgentModuleClass<B>> {
        None
    }

    fn as_multi_agent(&self) -> Option<&dyn MultiAgentModuleClass<B>> {
        None
    }
}

/// Builds exactly one module.
pub trait SingleAgentModuleClass<B: Backend>: ModuleClass<B> {
    fn build_module(&self, kwargs: &ModuleKwargs) -> Result<Box<dyn RlModule<B>>>;
}

/// Builds a whole container of modules.
pub trait MultiAgentModuleClass<B: Backend>: ModuleClass<B> {
    fn build_multi_agent(&self, kwargs: &ModuleKwargs) -> Result<MultiAgentRlModule<B>>;
}

/// Instantiates the single-agent capability of `class`, or fails with a config error.
pub fn build_single<B: Backend>(class: &dyn ModuleClass<B>, kwargs: &ModuleKwargs) -> Result<Box<dyn RlModule<B>>> {
    let single = class.as_single_agent().ok_or_else(|| {
        TrainerError::Config(format!("module class `{}` cannot build a single module", class.name()))
    })?;
    single.build_module(kwargs)
}

// --- Module spec ---

/// The configured module class plus the kwargs to build it with.
pub struct ModuleSpec<B: Backend> {
    pub module_class: Arc<dyn ModuleClass<B>>,
    pub module_kwargs: ModuleKwargs,
}

impl<B: Backend> ModuleSpec<B> {
    pub fn new(module_class: Arc<dyn ModuleClass<B>>, module_kwargs: ModuleKwargs) -> Self {
        ModuleSpec {
            module_class,
            module_kwargs,
        }
    }

    /// Builds the multi-agent container.
    ///
    /// A multi-agent class is used as is; a single-agent class is wrapped under
    /// [`DEFAULT_MODULE_ID`]. A class with neither capability is a config error.
    pub fn make_module(&self) -> Result<MultiAgentRlModule<B>> {
        let class = self.module_class.as_ref();
        if let Some(multi) = class.as_multi_agent() {
            return multi.build_multi_agent(&self.module_kwargs);
        }
        if let Some(single) = class.as_single_agent() {
            let module = single.build_module(&self.module_kwargs)?;
            return Ok(MultiAgentRlModule::from_single(DEFAULT_MODULE_ID, module));
        }
        Err(TrainerError::Config(format!(
            "module class `{}` is neither a single-agent nor a multi-agent module class",
            class.name()
        )))
    }
}

impl<B: Backend> Clone for ModuleSpec<B> {
    fn clone(&self) -> Self {
        ModuleSpec {
            module_class: Arc::clone(&self.module_class),
            module_kwargs: self.module_kwargs.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for ModuleSpec<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSpec")
            .field("module_class", &self.module_class.name())
            .field("module_kwargs", &self.module_kwargs)
            .finish()
    }
}
