mod common;

use common::*;
use rl_trainer::backend::{Backend, OptimizerHandle, ParamOptimizerPair};
use rl_trainer::config::TrainerConfig;
use rl_trainer::error::{Result, TrainerError};
use rl_trainer::rl_module::{ModuleSpec, RlModule, DEFAULT_MODULE_ID};
use rl_trainer::trainer::{RlTrainer, SetOptimizerFn, TrainerState};
use std::collections::HashSet;
use std::sync::Arc;

type FakeTrainer = RlTrainer<FakeBackend, RecordingHooks>;

fn trainer_with(spec: ModuleSpec<FakeBackend>, log: &Log) -> FakeTrainer {
    let mut trainer = RlTrainer::new(
        FakeBackend::new(log.clone()),
        RecordingHooks::new(log.clone()),
        spec,
        TrainerConfig::local(),
    )
    .unwrap();
    trainer.build().unwrap();
    trainer
}

fn refs_of(trainer: &FakeTrainer, module_id: &str) -> Vec<usize> {
    let module = trainer.module().unwrap().get(module_id).unwrap();
    trainer
        .backend()
        .get_parameters(module)
        .iter()
        .map(|p| trainer.backend().get_param_ref(p))
        .collect()
}

#[test]
fn build_wraps_single_module_and_registers_its_optimizer() {
    let log = new_log();
    let trainer = trainer_with(single_spec(&log, 3), &log);

    let module = trainer.module().unwrap();
    assert_eq!(module.keys().collect::<Vec<_>>(), vec![DEFAULT_MODULE_ID]);
    assert_eq!(trainer.registry().num_optimizers(), 1);
    assert_eq!(trainer.registry().num_params(), 3);
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn build_rejects_class_without_capability() {
    let log = new_log();
    let spec = ModuleSpec::new(Arc::new(OpaqueClass), serde_json::json!({}));
    let mut trainer =
        RlTrainer::new(FakeBackend::new(log.clone()), RecordingHooks::new(log.clone()), spec, TrainerConfig::local()).unwrap();
    assert!(matches!(trainer.build(), Err(TrainerError::Config(_))));
    assert!(!trainer.is_built());
}

#[test]
fn rebuild_starts_from_a_clean_registry() {
    let log = new_log();
    let mut trainer = trainer_with(multi_spec(&log, &["a", "b"], 2), &log);
    let old_refs: HashSet<usize> = refs_of(&trainer, "a").into_iter().collect();

    trainer.build().unwrap();

    assert_eq!(trainer.registry().num_params(), 4);
    assert_eq!(trainer.registry().num_optimizers(), 2);
    assert!(old_refs.iter().all(|r| !trainer.registry().contains(r)));
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn default_wiring_creates_one_optimizer_over_all_params() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 2), &log);
    let class = FakeModuleClass { log: log.clone() };
    let before: HashSet<_> = trainer.registry().optimizer_ids().copied().collect();

    trainer
        .add_module("new", &class, &serde_json::json!({"num_params": 4}), None, Some(&"adam".to_string()))
        .unwrap();

    let after: HashSet<_> = trainer.registry().optimizer_ids().copied().collect();
    let added: Vec<_> = after.difference(&before).collect();
    assert_eq!(added.len(), 1);

    let owned: HashSet<usize> = trainer.registry().get_param_refs(added[0]).unwrap().iter().copied().collect();
    let expected: HashSet<usize> = refs_of(&trainer, "new").into_iter().collect();
    assert_eq!(owned, expected);
    assert_eq!(owned.len(), 4);

    let handle = trainer.registry().get_optimizer(added[0]).unwrap();
    assert_eq!(handle.lock().unwrap().label, "adam");
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn custom_wiring_can_split_parameters() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 1), &log);
    let class = FakeModuleClass { log: log.clone() };

    let wire: Box<SetOptimizerFn<FakeBackend>> = Box::new(|backend: &FakeBackend, module: &dyn RlModule<FakeBackend>| -> Result<Vec<ParamOptimizerPair<FakeBackend>>> {
        let params = backend.get_parameters(module);
        let (head, tail) = params.split_at(1);
        let optimizer = |label: &str, ps: &[FakeParam]| {
            OptimizerHandle::new(FakeOptimizer {
                label: label.to_string(),
                param_ids: ps.iter().map(|p| p.id).collect(),
                steps: 0,
            })
        };
        Ok(vec![
            (head.to_vec(), optimizer("head", head)),
            (tail.to_vec(), optimizer("tail", tail)),
        ])
    });

    trainer
        .add_module("split", &class, &serde_json::json!({"num_params": 3}), Some(wire.as_ref()), None)
        .unwrap();

    assert_eq!(trainer.registry().num_optimizers(), 3);
    assert_eq!(trainer.registry().num_params(), 4);
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn add_module_needs_some_wiring() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 1), &log);
    let class = FakeModuleClass { log: log.clone() };

    let err = trainer
        .add_module("x", &class, &serde_json::json!({}), None, None)
        .unwrap_err();
    assert!(matches!(err, TrainerError::Config(_)));
    assert!(!trainer.module().unwrap().contains("x"));
    assert_eq!(trainer.registry().num_optimizers(), 1);
}

#[test]
fn add_module_rejects_duplicate_ids() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 1), &log);
    let class = FakeModuleClass { log: log.clone() };
    let err = trainer
        .add_module(DEFAULT_MODULE_ID, &class, &serde_json::json!({}), None, Some(&"sgd".to_string()))
        .unwrap_err();
    assert!(matches!(err, TrainerError::DuplicateModule(_)));
    assert_eq!(trainer.registry().num_params(), 1);
}

#[test]
fn add_module_requires_single_agent_class() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 1), &log);
    let multi = FakeMultiClass { log: log.clone() };
    let err = trainer
        .add_module("m", &multi, &serde_json::json!({"ids": ["q"]}), None, Some(&"sgd".to_string()))
        .unwrap_err();
    assert!(matches!(err, TrainerError::Config(_)));
}

#[test]
fn wiring_that_steals_parameters_changes_nothing() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 2), &log);
    let class = FakeModuleClass { log: log.clone() };
    let stolen = trainer
        .backend()
        .get_parameters(trainer.module().unwrap().get(DEFAULT_MODULE_ID).unwrap());

    let wire = move |backend: &FakeBackend, module: &dyn RlModule<FakeBackend>| -> Result<Vec<ParamOptimizerPair<FakeBackend>>> {
        let mut params = backend.get_parameters(module);
        params.extend(stolen.iter().cloned());
        let optimizer = OptimizerHandle::new(FakeOptimizer {
            label: "greedy".to_string(),
            param_ids: params.iter().map(|p| p.id).collect(),
            steps: 0,
        });
        Ok(vec![(params, optimizer)])
    };

    let err = trainer
        .add_module("greedy", &class, &serde_json::json!({}), Some(&wire), None)
        .unwrap_err();
    assert!(matches!(err, TrainerError::ParameterAlreadyOwned { .. }));
    assert!(!trainer.module().unwrap().contains("greedy"));
    assert_eq!(trainer.registry().num_params(), 2);
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn remove_module_clears_params_and_empty_optimizers() {
    let log = new_log();
    let mut trainer = trainer_with(multi_spec(&log, &["a", "b"], 2), &log);
    let a_refs = refs_of(&trainer, "a");

    trainer.remove_module("a").unwrap();

    assert!(!trainer.module().unwrap().contains("a"));
    assert_eq!(trainer.registry().num_optimizers(), 1);
    assert_eq!(trainer.registry().num_params(), 2);
    for r in &a_refs {
        assert!(!trainer.registry().contains(r));
        assert!(trainer.registry().get_optimizer_id(r).is_none());
    }
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn remove_unknown_module_fails_without_side_effects() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 2), &log);
    let err = trainer.remove_module("ghost").unwrap_err();
    assert!(matches!(err, TrainerError::UnknownModule(id) if id == "ghost"));
    assert_eq!(trainer.registry().num_params(), 2);
}

#[test]
fn removed_module_can_be_added_back() {
    let log = new_log();
    let mut trainer = trainer_with(multi_spec(&log, &["a", "b"], 1), &log);
    let class = FakeModuleClass { log: log.clone() };
    trainer.remove_module("a").unwrap();
    trainer
        .add_module("a", &class, &serde_json::json!({"num_params": 2}), None, Some(&"sgd".to_string()))
        .unwrap();
    assert_eq!(trainer.registry().num_params(), 3);
    assert_eq!(trainer.registry().num_optimizers(), 2);
    trainer.registry().check_consistency().unwrap();
}

#[test]
fn set_state_of_get_state_is_identity() {
    let log = new_log();
    let mut trainer = trainer_with(multi_spec(&log, &["a", "b"], 2), &log);
    trainer.update(&batch_for(&["a", "b"], 1.0)).unwrap();

    let state = trainer.get_state().unwrap();
    trainer.set_state(&state).unwrap();
    assert_eq!(trainer.get_state().unwrap(), state);
}

#[test]
fn set_state_restores_earlier_weights() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 2), &log);
    let snapshot = trainer.get_state().unwrap();

    trainer.update(&batch_for(&[DEFAULT_MODULE_ID], 1.0)).unwrap();
    assert_ne!(trainer.get_state().unwrap(), snapshot);

    trainer.set_state(&snapshot).unwrap();
    assert_eq!(trainer.get_state().unwrap(), snapshot);
}

#[test]
fn state_without_module_state_key_is_a_no_op() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 2), &log);
    let before = trainer.get_state().unwrap();
    let empty: TrainerState = serde_json::from_str("{}").unwrap();
    trainer.set_state(&empty).unwrap();
    assert_eq!(trainer.get_state().unwrap(), before);
}

#[test]
fn set_state_for_unknown_module_fails() {
    let log = new_log();
    let mut trainer = trainer_with(single_spec(&log, 1), &log);
    let mut state = trainer.get_state().unwrap();
    let module_state = state.module_state[DEFAULT_MODULE_ID].clone();
    state.module_state.insert("ghost".to_string(), module_state);
    assert!(matches!(trainer.set_state(&state), Err(TrainerError::UnknownModule(_))));
}
