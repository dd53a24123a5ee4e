//! # Tensor Operations
//!
//! Implements mathematical operations for Tensors, including autograd support.

use super::autograd::op_abstractions::{
    AddBackward, CatBackward, MatMulBackward, MeanBackward, MulBackward, MulScalarBackward, ReluBackward,
    SubBackward, SumBackward, TanhBackward, TransposeBackward,
};
use super::autograd::{AutogradContext, BackwardOp};
use super::{Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Axis, Ix2, IxDyn, Zip};
use std::sync::Arc;

// --- Helper Function for Autograd Setup ---

/// Creates a new tensor resulting from an operation, setting up autograd context if needed.
fn create_op_result(
    result_data: ArrayD<TensorData>,
    inputs: Vec<Tensor>,
    backward_op: Box<dyn BackwardOp>,
) -> Tensor {
    if inputs.iter().any(|t| t.requires_grad()) {
        let ctx = Arc::new(AutogradContext::new(inputs, backward_op));
        Tensor::from_op(result_data, ctx)
    } else {
        Tensor::new(result_data, false)
    }
}

// --- Broadcasting ---

/// Checks if tensor shapes can be broadcast together following NumPy broadcasting rules
pub fn can_broadcast(shape1: &[usize], shape2: &[usize]) -> bool {
    shape1
        .iter()
        .rev()
        .zip(shape2.iter().rev())
        .all(|(&s1, &s2)| s1 == s2 || s1 == 1 || s2 == 1)
}

/// Determines the output shape after broadcasting two tensors
pub fn broadcast_shapes(shape1: &[usize], shape2: &[usize]) -> Result<Vec<usize>, TensorError> {
    if !can_broadcast(shape1, shape2) {
        return Err(TensorError::IncompatibleShapes {
            op: "broadcast".to_string(),
            shape1: shape1.to_vec(),
            shape2: shape2.to_vec(),
        });
    }

    let max_dims = shape1.len().max(shape2.len());
    let padded_shape1 = pad_shape_left(shape1, max_dims);
    let padded_shape2 = pad_shape_left(shape2, max_dims);

    // A size-1 dimension stretches to the other size, including 0.
    Ok(padded_shape1
        .iter()
        .zip(&padded_shape2)
        .map(|(&a, &b)| if a == 1 { b } else { a })
        .collect())
}

/// Pads a shape with 1s on the left to match the target length
fn pad_shape_left(shape: &[usize], target_len: usize) -> Vec<usize> {
    let mut padded = vec![1; target_len.saturating_sub(shape.len())];
    padded.extend_from_slice(shape);
    padded
}

/// Sums a broadcast gradient back down to `shape`.
pub(crate) fn unbroadcast(mut grad: ArrayD<TensorData>, shape: &[usize]) -> ArrayD<TensorData> {
    while grad.ndim() > shape.len() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    grad
}

fn broadcast_binary<F>(op: &str, a: &Tensor, b: &Tensor, f: F) -> Result<ArrayD<TensorData>, TensorError>
where
    F: Fn(TensorData, TensorData) -> TensorData,
{
    // Owned copies: `a` and `b` may be the same tensor.
    let a_data = a.data_clone()?;
    let b_data = b.data_clone()?;
    let out_shape = broadcast_shapes(a.shape(), b.shape())?;
    let incompatible = || TensorError::IncompatibleShapes {
        op: op.to_string(),
        shape1: a.shape().to_vec(),
        shape2: b.shape().to_vec(),
    };
    let a_view = a_data.broadcast(IxDyn(&out_shape)).ok_or_else(incompatible)?;
    let b_view = b_data.broadcast(IxDyn(&out_shape)).ok_or_else(incompatible)?;
    Ok(Zip::from(&a_view).and(&b_view).map_collect(|&x, &y| f(x, y)))
}

// --- Arithmetic Operations ---

/// Element-wise addition with broadcasting.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let data = broadcast_binary("add", a, b, |x, y| x + y)?;
    Ok(create_op_result(data, vec![a.clone(), b.clone()], Box::new(AddBackward)))
}

/// Element-wise subtraction with broadcasting.
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let data = broadcast_binary("sub", a, b, |x, y| x - y)?;
    Ok(create_op_result(data, vec![a.clone(), b.clone()], Box::new(SubBackward)))
}

/// Element-wise multiplication with broadcasting.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let data = broadcast_binary("mul", a, b, |x, y| x * y)?;
    Ok(create_op_result(data, vec![a.clone(), b.clone()], Box::new(MulBackward)))
}

/// Multiplies every element by a constant.
pub fn mul_scalar(a: &Tensor, scalar: TensorData) -> Result<Tensor, TensorError> {
    let data = a.data()?.mapv(|x| x * scalar);
    Ok(create_op_result(data, vec![a.clone()], Box::new(MulScalarBackward { scalar })))
}

/// Matrix product of two 2-D tensors.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    if a.ndim() != 2 || b.ndim() != 2 || a.shape()[1] != b.shape()[0] {
        return Err(TensorError::IncompatibleShapes {
            op: "matmul".to_string(),
            shape1: a.shape().to_vec(),
            shape2: b.shape().to_vec(),
        });
    }
    let result = {
        let a_data = a.data_clone()?;
        let b_data = b.data_clone()?;
        let a2 = a_data.view().into_dimensionality::<Ix2>()?;
        let b2 = b_data.view().into_dimensionality::<Ix2>()?;
        a2.dot(&b2).into_dyn()
    };
    Ok(create_op_result(result, vec![a.clone(), b.clone()], Box::new(MatMulBackward)))
}

/// Transpose of a 2-D tensor.
pub fn transpose(a: &Tensor) -> Result<Tensor, TensorError> {
    let data = a.data()?.view().into_dimensionality::<Ix2>()?.t().to_owned().into_dyn();
    Ok(create_op_result(data, vec![a.clone()], Box::new(TransposeBackward)))
}

// --- Reductions ---

/// Sum of all elements as a 0-d tensor.
pub fn sum(a: &Tensor) -> Result<Tensor, TensorError> {
    let total = a.data()?.sum();
    let data = ArrayD::from_elem(IxDyn(&[]), total);
    Ok(create_op_result(data, vec![a.clone()], Box::new(SumBackward)))
}

/// Mean of all elements as a 0-d tensor.
pub fn mean(a: &Tensor) -> Result<Tensor, TensorError> {
    if a.size() == 0 {
        return Err(TensorError::Generic("Cannot take the mean of an empty tensor".to_string()));
    }
    let value = a.data()?.sum() / a.size() as TensorData;
    let data = ArrayD::from_elem(IxDyn(&[]), value);
    Ok(create_op_result(data, vec![a.clone()], Box::new(MeanBackward)))
}

// --- Joining ---

/// Concatenates tensors along `axis`. All other dimensions must agree.
pub fn cat(tensors: &[Tensor], axis: usize) -> Result<Tensor, TensorError> {
    let first = tensors
        .first()
        .ok_or_else(|| TensorError::Generic("Cannot concatenate empty list of tensors".to_string()))?;
    if axis >= first.ndim() {
        return Err(TensorError::Generic(format!(
            "Concatenation axis {} out of range for {} dims",
            axis,
            first.ndim()
        )));
    }
    let arrays = tensors
        .iter()
        .map(|t| t.data_clone())
        .collect::<Result<Vec<_>, _>>()?;
    let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
    let data = ndarray::concatenate(Axis(axis), &views)?;
    Ok(create_op_result(data, tensors.to_vec(), Box::new(CatBackward { axis })))
}

// --- Activations ---

pub fn relu(a: &Tensor) -> Result<Tensor, TensorError> {
    let data = a.data()?.mapv(|x| x.max(0.0));
    Ok(create_op_result(data, vec![a.clone()], Box::new(ReluBackward)))
}

pub fn tanh(a: &Tensor) -> Result<Tensor, TensorError> {
    let data = a.data()?.mapv(|x| x.tanh());
    Ok(create_op_result(data, vec![a.clone()], Box::new(TanhBackward)))
}
