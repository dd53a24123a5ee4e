//! # Trainer Errors
//!
//! Every fallible trainer operation returns [`TrainerError`]. Nothing here is retried;
//! failures surface to whoever drives the training loop.

use crate::backend::OptimizerId;
use crate::batch::ModuleId;
use crate::tensor::TensorError;
use crate::utils::serialization::SerializationError;

#[derive(thiserror::Error, Debug)]
pub enum TrainerError {
    #[error("RlTrainer::build() must be called before using the trainer")]
    NotBuilt,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("`{0}` is not implemented for this trainer")]
    NotImplemented(&'static str),
    #[error("Parameter {param} is already owned by optimizer {owner:?}; unregister it first")]
    ParameterAlreadyOwned { param: String, owner: OptimizerId },
    #[error("Parameter registry is inconsistent: {0}")]
    RegistryInconsistent(String),
    #[error("Unknown module id `{0}`")]
    UnknownModule(ModuleId),
    #[error("Module id `{0}` is already present")]
    DuplicateModule(ModuleId),
    #[error("Loss for module `{0}` has no `total_loss` entry")]
    MissingTotalLoss(ModuleId),
    #[error("Invalid batch: {0}")]
    Batch(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

pub type Result<T> = std::result::Result<T, TrainerError>;
