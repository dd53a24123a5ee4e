//! # Parameter Registry
//!
//! Bidirectional index between optimizers and the parameters they update.
//!
//! Three maps are kept in lock-step:
//! - optimizer → ordered refs it owns
//! - ref → parameter
//! - ref → owning optimizer
//!
//! Every ref in the parameter map has exactly one owner, and that owner's list
//! contains the ref. Optimizers whose list becomes empty are dropped.

use crate::backend::{Backend, OptimizerHandle, OptimizerId, ParamOptimizerPair};
use crate::error::{Result, TrainerError};
use crate::rl_module::RlModule;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

pub struct ParameterRegistry<B: Backend> {
    optim_to_param: HashMap<OptimizerId, Vec<B::ParamRef>>,
    optimizers: HashMap<OptimizerId, OptimizerHandle<B::Optimizer>>,
    param_to_optim: HashMap<B::ParamRef, OptimizerId>,
    params: HashMap<B::ParamRef, B::Param>,
}

impl<B: Backend> ParameterRegistry<B> {
    pub fn new() -> Self {
        ParameterRegistry {
            optim_to_param: HashMap::new(),
            optimizers: HashMap::new(),
            param_to_optim: HashMap::new(),
            params: HashMap::new(),
        }
    }

    /// Checks that `params` could be registered under `optimizer` without
    /// stealing a parameter from another optimizer. Nothing is mutated.
    pub fn validate(&self, backend: &B, params: &[B::Param], optimizer: &OptimizerHandle<B::Optimizer>) -> Result<()> {
        let id = optimizer.id();
        for param in params {
            let param_ref = backend.get_param_ref(param);
            if let Some(owner) = self.param_to_optim.get(&param_ref) {
                if *owner != id {
                    return Err(TrainerError::ParameterAlreadyOwned {
                        param: format!("{:?}", param_ref),
                        owner: *owner,
                    });
                }
            }
        }
        Ok(())
    }

    /// Validates several pairs together, including clashes between the pairs themselves.
    pub fn validate_pairs(&self, backend: &B, pairs: &[ParamOptimizerPair<B>]) -> Result<()> {
        let mut claimed: HashMap<B::ParamRef, OptimizerId> = HashMap::new();
        for (params, optimizer) in pairs {
            self.validate(backend, params, optimizer)?;
            for param in params {
                let param_ref = backend.get_param_ref(param);
                match claimed.get(&param_ref) {
                    Some(owner) if *owner != optimizer.id() => {
                        return Err(TrainerError::ParameterAlreadyOwned {
                            param: format!("{:?}", param_ref),
                            owner: *owner,
                        })
                    }
                    _ => {
                        claimed.insert(param_ref, optimizer.id());
                    }
                }
            }
        }
        Ok(())
    }

    /// Records `params` as owned by `optimizer`.
    ///
    /// Fails without mutating anything if a parameter already belongs to a
    /// different optimizer; call [`unregister`](Self::unregister) first.
    ///
    /// An optimizer that ends up owning no parameters, such as one registered
    /// with an empty `params`, is not tracked: every tracked optimizer owns at
    /// least one parameter.
    pub fn register(&mut self, backend: &B, params: &[B::Param], optimizer: &OptimizerHandle<B::Optimizer>) -> Result<()> {
        self.validate(backend, params, optimizer)?;

        let id = optimizer.id();
        self.optimizers.entry(id).or_insert_with(|| optimizer.clone());
        let owned = self.optim_to_param.entry(id).or_default();
        for param in params {
            let param_ref = backend.get_param_ref(param);
            if !self.param_to_optim.contains_key(&param_ref) {
                owned.push(param_ref.clone());
            }
            self.param_to_optim.insert(param_ref.clone(), id);
            self.params.insert(param_ref, param.clone());
        }
        if owned.is_empty() {
            self.optim_to_param.remove(&id);
            self.optimizers.remove(&id);
        }
        debug!(optimizer = ?id, num_params = params.len(), "registered parameters");
        Ok(())
    }

    /// Forgets every parameter of `module`. Returns how many were actually removed.
    pub fn unregister(&mut self, backend: &B, module: &dyn RlModule<B>) -> usize {
        let refs: Vec<B::ParamRef> = backend
            .get_parameters(module)
            .iter()
            .map(|p| backend.get_param_ref(p))
            .collect();
        self.unregister_refs(&refs)
    }

    /// Forgets the given refs. Refs that are not registered are skipped.
    pub fn unregister_refs(&mut self, refs: &[B::ParamRef]) -> usize {
        let mut removed = 0;
        for param_ref in refs {
            self.params.remove(param_ref);
            let owner = match self.param_to_optim.remove(param_ref) {
                Some(owner) => owner,
                None => continue,
            };
            removed += 1;
            if let Some(owned) = self.optim_to_param.get_mut(&owner) {
                owned.retain(|r| r != param_ref);
                if owned.is_empty() {
                    self.optim_to_param.remove(&owner);
                    self.optimizers.remove(&owner);
                    debug!(optimizer = ?owner, "dropped optimizer with no parameters left");
                }
            }
        }
        debug!(removed, "unregistered parameters");
        removed
    }

    // --- Lookups ---

    pub fn get_param_refs(&self, optimizer: &OptimizerId) -> Option<&[B::ParamRef]> {
        self.optim_to_param.get(optimizer).map(|v| v.as_slice())
    }

    pub fn get_param(&self, param_ref: &B::ParamRef) -> Option<&B::Param> {
        self.params.get(param_ref)
    }

    pub fn get_optimizer_id(&self, param_ref: &B::ParamRef) -> Option<OptimizerId> {
        self.param_to_optim.get(param_ref).copied()
    }

    pub fn get_optimizer(&self, optimizer: &OptimizerId) -> Option<&OptimizerHandle<B::Optimizer>> {
        self.optimizers.get(optimizer)
    }

    pub fn contains(&self, param_ref: &B::ParamRef) -> bool {
        self.params.contains_key(param_ref)
    }

    pub fn params(&self) -> impl Iterator<Item = (&B::ParamRef, &B::Param)> {
        self.params.iter()
    }

    pub fn optimizer_ids(&self) -> impl Iterator<Item = &OptimizerId> {
        self.optim_to_param.keys()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_optimizers(&self) -> usize {
        self.optim_to_param.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.optim_to_param.is_empty()
    }

    pub fn clear(&mut self) {
        self.optim_to_param.clear();
        self.optimizers.clear();
        self.param_to_optim.clear();
        self.params.clear();
    }

    /// Verifies that the three maps agree with each other.
    pub fn check_consistency(&self) -> Result<()> {
        let fail = |msg: String| Err(TrainerError::RegistryInconsistent(msg));

        if self.params.len() != self.param_to_optim.len() {
            return fail(format!(
                "{} parameters but {} owner entries",
                self.params.len(),
                self.param_to_optim.len()
            ));
        }
        for (param_ref, owner) in &self.param_to_optim {
            if !self.params.contains_key(param_ref) {
                return fail(format!("{:?} has an owner but no parameter", param_ref));
            }
            match self.optim_to_param.get(owner) {
                Some(owned) if owned.contains(param_ref) => {}
                _ => return fail(format!("{:?} is not listed under its owner {:?}", param_ref, owner)),
            }
        }

        let mut seen = HashSet::new();
        for (owner, owned) in &self.optim_to_param {
            if owned.is_empty() {
                return fail(format!("optimizer {:?} owns nothing", owner));
            }
            if !self.optimizers.contains_key(owner) {
                return fail(format!("optimizer {:?} has no handle", owner));
            }
            for param_ref in owned {
                if !seen.insert(param_ref) {
                    return fail(format!("{:?} is listed more than once", param_ref));
                }
                if self.param_to_optim.get(param_ref) != Some(owner) {
                    return fail(format!("{:?} is listed under {:?} but owned elsewhere", param_ref, owner));
                }
            }
        }
        if self.optimizers.len() != self.optim_to_param.len() {
            return fail("stale optimizer handles".to_string());
        }
        Ok(())
    }
}

impl<B: Backend> Default for ParameterRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> fmt::Debug for ParameterRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("num_optimizers", &self.optim_to_param.len())
            .field("num_params", &self.params.len())
            .finish()
    }
}
