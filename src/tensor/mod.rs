//! # Tensor Module
//!
//! This module defines the core `Tensor` struct used by the CPU backend,
//! including storage, differentiable operations, and automatic differentiation.

use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// --- Submodules ---
pub mod autograd;
pub mod ops;

// --- Re-exports ---
pub use autograd::{AutogradContext, BackwardOp};

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("Incompatible shapes for operation {op}: {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Vec<usize>,
        shape2: Vec<usize>,
    },
    #[error("Operation requires gradient but tensor does not have it")]
    RequiresGradNotSet,
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Autograd error: {0}")]
    AutogradError(String),
    #[error("Tensor lock poisoned")]
    LockPoisoned,
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Element type of every tensor.
pub type TensorData = f32;

/// # Tensor
///
/// Wraps an `ndarray::ArrayD` together with the metadata autograd needs.
///
/// Cloning a tensor is cheap and yields a handle onto the *same* data and
/// gradient cells, so a parameter cloned into an optimizer or a registry is
/// still the parameter the module reads in its forward pass.
#[derive(Clone)]
pub struct Tensor {
    data: Arc<RwLock<ArrayD<TensorData>>>,
    shape: Vec<usize>,
    // Gradient cell shared by every clone of a leaf tensor.
    grad: Arc<Mutex<Option<ArrayD<TensorData>>>>,
    // Node of the computation graph that produced this tensor (None for leaves).
    grad_context: Option<Arc<AutogradContext>>,
    requires_grad: bool,
}

impl Tensor {
    /// Creates a new leaf Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            shape,
            grad: Arc::new(Mutex::new(None)),
            grad_context: None,
            requires_grad,
        }
    }

    /// Creates a Tensor that is the result of a recorded operation.
    pub(crate) fn from_op(data: ArrayD<TensorData>, grad_context: Arc<AutogradContext>) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            shape,
            grad: Arc::new(Mutex::new(None)),
            grad_context: Some(grad_context),
            requires_grad: true,
        }
    }

    /// Creates a 0-dimensional tensor holding `value`.
    pub fn scalar(value: TensorData) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), value), false)
    }

    /// Creates a tensor from a flat vector and a shape.
    pub fn from_vec(values: Vec<TensorData>, shape: &[usize], requires_grad: bool) -> Result<Self, TensorError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Tensor::new(data, requires_grad))
    }

    /// Stable identity of this tensor: the address of its shared data cell.
    ///
    /// Two handles compare equal here iff they are clones of one another.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.grad_context.is_none()
    }

    pub(crate) fn grad_context(&self) -> Option<&Arc<AutogradContext>> {
        self.grad_context.as_ref()
    }

    /// Read access to the underlying data.
    pub fn data(&self) -> Result<RwLockReadGuard<'_, ArrayD<TensorData>>, TensorError> {
        self.data.read().map_err(|_| TensorError::LockPoisoned)
    }

    /// Write access to the underlying data.
    ///
    /// Writes are not tracked by autograd; use for parameter updates and state restores.
    pub fn data_mut(&self) -> Result<RwLockWriteGuard<'_, ArrayD<TensorData>>, TensorError> {
        self.data.write().map_err(|_| TensorError::LockPoisoned)
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> Result<ArrayD<TensorData>, TensorError> {
        Ok(self.data()?.clone())
    }

    /// Returns the single value of a one-element tensor.
    pub fn item(&self) -> Result<TensorData, TensorError> {
        if self.size() != 1 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![],
                got: self.shape.clone(),
            });
        }
        let data = self.data()?;
        data.iter()
            .next()
            .copied()
            .ok_or_else(|| TensorError::Generic("Empty tensor".to_string()))
    }

    fn grad_cell(&self) -> Result<MutexGuard<'_, Option<ArrayD<TensorData>>>, TensorError> {
        self.grad.lock().map_err(|_| TensorError::LockPoisoned)
    }

    /// Retrieves a detached copy of the accumulated gradient, if any.
    pub fn grad(&self) -> Result<Option<ArrayD<TensorData>>, TensorError> {
        Ok(self.grad_cell()?.clone())
    }

    /// Overwrites the gradient. Shapes must match the tensor.
    pub fn set_grad(&self, grad: ArrayD<TensorData>) -> Result<(), TensorError> {
        if grad.shape() != self.shape.as_slice() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: grad.shape().to_vec(),
            });
        }
        *self.grad_cell()? = Some(grad);
        Ok(())
    }

    /// Adds `incoming` into the gradient cell, creating it if absent.
    pub(crate) fn accumulate_grad(&self, incoming: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Ok(());
        }
        if incoming.shape() != self.shape.as_slice() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: incoming.shape().to_vec(),
            });
        }
        let mut cell = self.grad_cell()?;
        match cell.as_mut() {
            Some(existing) => *existing += incoming,
            None => *cell = Some(incoming.clone()),
        }
        Ok(())
    }

    /// Drops the gradient (PyTorch's `set_to_none=True`).
    pub fn zero_grad(&self) -> Result<(), TensorError> {
        *self.grad_cell()? = None;
        Ok(())
    }

    /// Runs the backward pass from this tensor, which must hold a single value.
    pub fn backward(&self) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Err(TensorError::RequiresGradNotSet);
        }
        if self.size() != 1 {
            return Err(TensorError::Generic(
                "Backward can only be called on single-element tensors".to_string(),
            ));
        }
        let seed = ArrayD::ones(IxDyn(&self.shape));
        autograd::backward(self, seed)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("is_leaf", &self.is_leaf())
            .finish()
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor with values drawn uniformly from `[low, high)`.
pub fn uniform<R: Rng + ?Sized>(
    shape: &[usize],
    low: TensorData,
    high: TensorData,
    requires_grad: bool,
    rng: &mut R,
) -> Result<Tensor, TensorError> {
    if !(low < high) {
        return Err(TensorError::Generic(format!(
            "Invalid uniform range [{}, {})",
            low, high
        )));
    }
    let dist = Uniform::new(low, high);
    let size = shape.iter().product();
    let values: Vec<TensorData> = (0..size).map(|_| dist.sample(rng)).collect();
    Tensor::from_vec(values, shape, requires_grad)
}
