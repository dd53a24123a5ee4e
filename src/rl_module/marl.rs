//! # Multi-Agent Module Container
//!
//! An ordered map from module id to module. Adding or removing one entry never
//! touches the others.

use super::{MultiAgentState, RlModule};
use crate::backend::Backend;
use crate::batch::{ModuleId, NestedTensorDict};
use crate::error::{Result, TrainerError};
use std::collections::BTreeMap;
use std::fmt;

pub struct MultiAgentRlModule<B: Backend> {
    modules: BTreeMap<ModuleId, Box<dyn RlModule<B>>>,
}

impl<B: Backend> MultiAgentRlModule<B> {
    pub fn new() -> Self {
        MultiAgentRlModule {
            modules: BTreeMap::new(),
        }
    }

    /// Wraps a single module under `module_id`.
    pub fn from_single(module_id: impl Into<ModuleId>, module: Box<dyn RlModule<B>>) -> Self {
        let mut container = Self::new();
        container.modules.insert(module_id.into(), module);
        container
    }

    pub fn add_module(&mut self, module_id: impl Into<ModuleId>, module: Box<dyn RlModule<B>>) -> Result<()> {
        let module_id = module_id.into();
        if self.modules.contains_key(&module_id) {
            return Err(TrainerError::DuplicateModule(module_id));
        }
        self.modules.insert(module_id, module);
        Ok(())
    }

    pub fn remove_module(&mut self, module_id: &str) -> Result<Box<dyn RlModule<B>>> {
        self.modules
            .remove(module_id)
            .ok_or_else(|| TrainerError::UnknownModule(module_id.to_string()))
    }

    pub fn get(&self, module_id: &str) -> Option<&dyn RlModule<B>> {
        self.modules.get(module_id).map(|m| m.as_ref())
    }

    pub fn get_mut(&mut self, module_id: &str) -> Option<&mut (dyn RlModule<B> + 'static)> {
        self.modules.get_mut(module_id).map(|m| m.as_mut())
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.modules.contains_key(module_id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ModuleId> {
        self.modules.keys()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModuleId, &dyn RlModule<B>)> {
        self.modules.iter().map(|(id, m)| (id, m.as_ref()))
    }

    /// Runs every module that has data in `batch`. Modules without data are skipped.
    pub fn forward_train(&self, batch: &NestedTensorDict<B::Tensor>) -> Result<NestedTensorDict<B::Tensor>> {
        let mut outputs = NestedTensorDict::new();
        for (module_id, module_batch) in batch {
            let module = self
                .modules
                .get(module_id)
                .ok_or_else(|| TrainerError::UnknownModule(module_id.clone()))?;
            outputs.insert(module_id.clone(), module.forward_train(module_batch)?);
        }
        Ok(outputs)
    }

    pub fn get_state(&self) -> Result<MultiAgentState> {
        self.modules
            .iter()
            .map(|(id, module)| Ok((id.clone(), module.get_state()?)))
            .collect()
    }

    /// Restores every module named in `state`; modules not named keep their weights.
    pub fn set_state(&mut self, state: &MultiAgentState) -> Result<()> {
        if let Some(unknown) = state.keys().find(|id| !self.modules.contains_key(*id)) {
            return Err(TrainerError::UnknownModule(unknown.clone()));
        }
        for (module_id, module_state) in state {
            if let Some(module) = self.modules.get_mut(module_id) {
                module.set_state(module_state)?;
            }
        }
        Ok(())
    }
}

impl<B: Backend> Default for MultiAgentRlModule<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> fmt::Debug for MultiAgentRlModule<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiAgentRlModule")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}
