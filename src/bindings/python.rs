//! # Python Bindings (`rl_trainer`)
//!
//! Exposes a behaviour-cloning trainer over MLP modules to Python. Batches are
//! passed as `{module_id: {column: [[f32, ...], ...]}}` and results come back as
//! nested dicts.

use pyo3::exceptions::{PyKeyError, PyNotImplementedError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algorithms::{BcConfig, BcHooks, BcTrainer};
use crate::backend::CpuBackend;
use crate::batch::{MultiAgentBatch, SampleBatch};
use crate::config::TrainerConfig;
use crate::error::TrainerError;
use crate::optim::OptimizerConfig;
use crate::rl_module::{ModuleClass, ModuleKwargs, ModuleSpec, MlpModuleClass, MultiMlpModuleClass};
use crate::trainer::{Metric, ResultDict, TrainerState, UpdateArgs};

// --- Error conversion ---

impl From<TrainerError> for PyErr {
    fn from(err: TrainerError) -> PyErr {
        let msg = err.to_string();
        match err {
            TrainerError::Config(_) | TrainerError::Batch(_) | TrainerError::DuplicateModule(_) => {
                PyValueError::new_err(msg)
            }
            TrainerError::UnknownModule(_) => PyKeyError::new_err(msg),
            TrainerError::NotImplemented(_) => PyNotImplementedError::new_err(msg),
            _ => PyRuntimeError::new_err(msg),
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, json: &str) -> PyResult<T> {
    serde_json::from_str(json).map_err(|e| PyValueError::new_err(format!("invalid {}: {}", what, e)))
}

/// Picks the multi-agent class when kwargs carry a `modules` table.
fn module_class_for(kwargs: &ModuleKwargs) -> Arc<dyn ModuleClass<CpuBackend>> {
    if kwargs.get("modules").is_some() {
        Arc::new(MultiMlpModuleClass)
    } else {
        Arc::new(MlpModuleClass)
    }
}

fn rows_to_array(key: &str, rows: Vec<Vec<f32>>) -> PyResult<ndarray::ArrayD<f32>> {
    let width = rows.first().map_or(0, |r| r.len());
    if rows.iter().any(|r| r.len() != width) {
        return Err(PyValueError::new_err(format!("column `{}` is ragged", key)));
    }
    let n = rows.len();
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[n, width]), flat)
        .map_err(|e| PyValueError::new_err(format!("column `{}`: {}", key, e)))
}

fn metric_to_py(py: Python<'_>, metric: &Metric) -> PyResult<PyObject> {
    Ok(match metric {
        Metric::Scalar(v) => (*v).into_py(py),
        Metric::Vector(values) => PyList::new_bound(py, values).into_py(py),
        Metric::Nested(map) => {
            let dict = PyDict::new_bound(py);
            for (key, value) in map {
                dict.set_item(key, metric_to_py(py, value)?)?;
            }
            dict.into_py(py)
        }
    })
}

fn results_to_py(py: Python<'_>, results: &ResultDict) -> PyResult<PyObject> {
    metric_to_py(py, &Metric::Nested(results.clone()))
}

// --- Trainer wrapper (`rl_trainer.BcTrainer`) ---

#[pyclass(name = "BcTrainer", unsendable)]
pub struct PyBcTrainer {
    inner: BcTrainer,
}

#[pymethods]
impl PyBcTrainer {
    /// `module_kwargs` and `bc_config` are JSON strings.
    #[new]
    #[pyo3(signature = (module_kwargs, bc_config=None))]
    fn py_new(module_kwargs: &str, bc_config: Option<&str>) -> PyResult<Self> {
        let kwargs: ModuleKwargs = parse_json("module kwargs", module_kwargs)?;
        let config: BcConfig = match bc_config {
            Some(json) => parse_json("BC config", json)?,
            None => BcConfig::default(),
        };
        let spec = ModuleSpec::new(module_class_for(&kwargs), kwargs);
        let inner = BcTrainer::new(CpuBackend, BcHooks::new(config), spec, TrainerConfig::local())?;
        Ok(PyBcTrainer { inner })
    }

    fn build(&mut self) -> PyResult<()> {
        Ok(self.inner.build()?)
    }

    fn is_built(&self) -> bool {
        self.inner.is_built()
    }

    fn module_ids(&self) -> Vec<String> {
        self.inner
            .module()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn update(&mut self, py: Python<'_>, batch: BTreeMap<String, BTreeMap<String, Vec<Vec<f32>>>>) -> PyResult<PyObject> {
        let mut converted = MultiAgentBatch::new();
        for (module_id, columns) in batch {
            let mut sample_batch = SampleBatch::new();
            for (key, rows) in columns {
                let array = rows_to_array(&key, rows)?;
                sample_batch.insert(key, array);
            }
            converted.insert(module_id, sample_batch);
        }
        let results = self.inner.update(&converted)?;
        results_to_py(py, &results)
    }

    #[pyo3(signature = (tau=None))]
    fn additional_update(&mut self, py: Python<'_>, tau: Option<f64>) -> PyResult<PyObject> {
        let mut args = UpdateArgs::new();
        if let Some(tau) = tau {
            args = args.with_kwarg("tau", tau);
        }
        let results = self.inner.additional_update(&args)?;
        let dict = PyDict::new_bound(py);
        for (module_id, module_results) in &results {
            dict.set_item(module_id, results_to_py(py, module_results)?)?;
        }
        Ok(dict.into_py(py))
    }

    /// Adds an MLP module. Uses the trainer's optimizer unless `optimizer_config` is given.
    #[pyo3(signature = (module_id, module_kwargs, optimizer_config=None))]
    fn add_module(&mut self, module_id: &str, module_kwargs: &str, optimizer_config: Option<&str>) -> PyResult<()> {
        let kwargs: ModuleKwargs = parse_json("module kwargs", module_kwargs)?;
        let optimizer: OptimizerConfig = match optimizer_config {
            Some(json) => parse_json("optimizer config", json)?,
            None => self.inner.hooks().config().optimizer.clone(),
        };
        self.inner
            .add_module(module_id, &MlpModuleClass, &kwargs, None, Some(&optimizer))?;
        Ok(())
    }

    fn remove_module(&mut self, module_id: &str) -> PyResult<()> {
        Ok(self.inner.remove_module(module_id)?)
    }

    fn get_state(&self) -> PyResult<String> {
        let state = self.inner.get_state()?;
        serde_json::to_string(&state).map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    fn set_state(&mut self, state: &str) -> PyResult<()> {
        let state: TrainerState = parse_json("trainer state", state)?;
        Ok(self.inner.set_state(&state)?)
    }

    fn save_checkpoint(&self, path: &str) -> PyResult<()> {
        Ok(self.inner.save_checkpoint(path)?)
    }

    fn load_checkpoint(&mut self, path: &str) -> PyResult<()> {
        Ok(self.inner.load_checkpoint(path)?)
    }

    fn __repr__(&self) -> String {
        format!("BcTrainer(modules={:?})", self.module_ids())
    }
}

// --- Module definition ---

#[pymodule]
fn rl_trainer(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyBcTrainer>()?;
    Ok(())
}
