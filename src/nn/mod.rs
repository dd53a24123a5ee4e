//! # Neural Network Module (`nn`)
//!
//! Building blocks for the function approximators that RL modules are made of:
//! layers, containers, loss functions and a functional interface.

use crate::tensor::{Tensor, TensorError};
use std::collections::BTreeMap;
use std::fmt::Debug;

// --- Submodules ---
pub mod functional;
pub mod loss;
pub mod modules;

// Re-export common items
pub use loss::MSELoss;
pub use modules::*;

// --- Core Trait: Module ---

/// Base trait for all neural network modules (layers, containers, etc.).
pub trait Module: Debug + Send + Sync + 'static {
    /// Performs the forward pass of the module.
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError>;

    /// Returns the module's parameters keyed by a descriptive name
    /// (e.g. "weight", "bias"). BTreeMap keeps the order deterministic.
    fn parameters(&self) -> BTreeMap<String, Tensor>;
}

// --- Containers ---

/// A sequential container. The forward pass applies each module in order.
#[derive(Debug, Default)]
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    /// Creates a new empty Sequential container.
    pub fn new() -> Self {
        Sequential { modules: Vec::new() }
    }

    /// Creates a Sequential container from a vector of modules.
    pub fn from_modules(modules: Vec<Box<dyn Module>>) -> Self {
        Sequential { modules }
    }

    /// Adds a module to the end of the sequence.
    pub fn add_module(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        let mut current = input.clone();
        for module in &self.modules {
            current = module.forward(&current)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> BTreeMap<String, Tensor> {
        let mut params = BTreeMap::new();
        for (i, module) in self.modules.iter().enumerate() {
            for (name, param) in module.parameters() {
                // Prefix parameter names with module index for uniqueness
                params.insert(format!("{}.{}", i, name), param);
            }
        }
        params
    }
}
