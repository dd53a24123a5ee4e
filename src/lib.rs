//! # rl_trainer
//!
//! Training core for multi-module reinforcement-learning policies.
//!
//! An [`RlTrainer`](trainer::RlTrainer) owns a container of policy modules and a
//! [`ParameterRegistry`](trainer::ParameterRegistry) that tracks which optimizer
//! owns which parameter while modules are added and removed at runtime. Each
//! `update` runs forward pass, loss, gradient computation, gradient
//! post-processing, gradient application and result compilation in that order.
//!
//! Numeric specifics sit behind the [`Backend`](backend::Backend) trait, with a CPU
//! implementation built on the crate's own autograd [`tensor`] module. Algorithm
//! specifics sit behind [`TrainerHooks`](trainer::TrainerHooks); see
//! [`algorithms::bc`] for a complete example.

pub mod algorithms;
pub mod backend;
pub mod batch;
pub mod bindings;
pub mod config;
pub mod error;
pub mod nn;
pub mod optim;
pub mod rl_module;
pub mod tensor;
pub mod trainer;
pub mod utils;

pub use error::{Result, TrainerError};

pub mod prelude {
    pub use crate::algorithms::{BcConfig, BcHooks, BcTrainer};
    pub use crate::backend::{Backend, CpuBackend, OptimizerHandle, OptimizerId};
    pub use crate::batch::{ModuleId, MultiAgentBatch, SampleBatch};
    pub use crate::config::{ScalingConfig, TrainerConfig};
    pub use crate::error::{Result, TrainerError};
    pub use crate::optim::OptimizerConfig;
    pub use crate::rl_module::{MlpConfig, MlpModuleClass, ModuleSpec, MultiMlpModuleClass, RlModule};
    pub use crate::trainer::{Metric, ResultDict, RlTrainer, TrainerHooks, TrainerState, UpdateArgs};
    pub use crate::utils::DataParallel;
}
