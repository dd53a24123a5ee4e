//! # Automatic Differentiation (Autograd)
//!
//! Implements the reverse-mode automatic differentiation engine.
//! Every differentiable op records an `AutogradContext` on its output; `backward`
//! walks those contexts in reverse topological order and accumulates gradients
//! into the leaf tensors.

use super::{Tensor, TensorData, TensorError};
use ndarray::ArrayD;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

// --- Backward Operation Trait ---

/// Trait defining the backward pass for an operation.
pub trait BackwardOp: Debug + Send + Sync + 'static {
    /// Computes the gradients with respect to the inputs of the operation.
    ///
    /// # Arguments
    /// * `inputs` - The input tensors of the forward operation.
    /// * `output_grad` - The gradient flowing back into the operation's output.
    ///
    /// # Returns
    /// One gradient per input, in the same order as `inputs`.
    fn backward(
        &self,
        inputs: &[Tensor],
        output_grad: &ArrayD<TensorData>,
    ) -> Result<Vec<ArrayD<TensorData>>, TensorError>;
}

// --- Autograd Context ---

/// One node of the computation graph, attached to the output of an operation.
#[derive(Debug)]
pub struct AutogradContext {
    op: Box<dyn BackwardOp>,
    inputs: Vec<Tensor>,
}

impl AutogradContext {
    pub fn new(inputs: Vec<Tensor>, op: Box<dyn BackwardOp>) -> Self {
        AutogradContext { op, inputs }
    }

    fn key(ctx: &Arc<AutogradContext>) -> usize {
        Arc::as_ptr(ctx) as usize
    }
}

/// Orders every context reachable from `root` so that a node always comes
/// before the nodes that produced its inputs.
fn topological_order(root: &Arc<AutogradContext>) -> Vec<Arc<AutogradContext>> {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut post_order = Vec::new();
    // (node, children_pushed)
    let mut stack: Vec<(Arc<AutogradContext>, bool)> = vec![(Arc::clone(root), false)];

    while let Some((ctx, expanded)) = stack.pop() {
        if expanded {
            post_order.push(ctx);
            continue;
        }
        if !visited.insert(AutogradContext::key(&ctx)) {
            continue;
        }
        stack.push((Arc::clone(&ctx), true));
        for input in &ctx.inputs {
            if let Some(child) = input.grad_context() {
                if !visited.contains(&AutogradContext::key(child)) {
                    stack.push((Arc::clone(child), false));
                }
            }
        }
    }

    post_order.reverse();
    post_order
}

// --- Main Backward Function ---

/// Performs the backward pass starting from `root`, seeded with `initial_gradient`.
pub fn backward(root: &Tensor, initial_gradient: ArrayD<TensorData>) -> Result<(), TensorError> {
    if !root.requires_grad() {
        return Ok(());
    }

    let root_ctx = match root.grad_context() {
        Some(ctx) => Arc::clone(ctx),
        // A leaf root simply receives the seed.
        None => return root.accumulate_grad(&initial_gradient),
    };

    let mut pending: HashMap<usize, ArrayD<TensorData>> = HashMap::new();
    pending.insert(AutogradContext::key(&root_ctx), initial_gradient);

    for ctx in topological_order(&root_ctx) {
        let output_grad = match pending.remove(&AutogradContext::key(&ctx)) {
            Some(g) => g,
            None => continue,
        };

        let input_grads = ctx.op.backward(&ctx.inputs, &output_grad)?;
        if input_grads.len() != ctx.inputs.len() {
            return Err(TensorError::AutogradError(format!(
                "Backward op {:?} produced {} gradients, but expected {}",
                ctx.op,
                input_grads.len(),
                ctx.inputs.len()
            )));
        }

        for (input, grad) in ctx.inputs.iter().zip(input_grads) {
            if !input.requires_grad() {
                continue;
            }
            if grad.shape() != input.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: input.shape().to_vec(),
                    got: grad.shape().to_vec(),
                });
            }
            match input.grad_context() {
                Some(child) => {
                    let slot = pending.entry(AutogradContext::key(child));
                    match slot {
                        std::collections::hash_map::Entry::Occupied(mut e) => *e.get_mut() += &grad,
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(grad);
                        }
                    }
                }
                None => input.accumulate_grad(&grad)?,
            }
        }
    }

    Ok(())
}

// --- Concrete BackwardOp Implementations ---

pub mod op_abstractions {
    use super::*;
    use crate::tensor::ops::unbroadcast;
    use ndarray::{Axis, Ix2, IxDyn, Slice};

    // ---- Add ----
    #[derive(Debug)]
    pub struct AddBackward;
    impl BackwardOp for AddBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![
                unbroadcast(output_grad.clone(), inputs[0].shape()),
                unbroadcast(output_grad.clone(), inputs[1].shape()),
            ])
        }
    }

    // ---- Sub ----
    #[derive(Debug)]
    pub struct SubBackward;
    impl BackwardOp for SubBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![
                unbroadcast(output_grad.clone(), inputs[0].shape()),
                unbroadcast(output_grad.mapv(|g| -g), inputs[1].shape()),
            ])
        }
    }

    // ---- Mul ----
    #[derive(Debug)]
    pub struct MulBackward;
    impl BackwardOp for MulBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // dA = dOut * B, dB = dOut * A
            let a = inputs[0].data_clone()?;
            let b = inputs[1].data_clone()?;
            let grad_a = output_grad * &b;
            let grad_b = output_grad * &a;
            Ok(vec![
                unbroadcast(grad_a, inputs[0].shape()),
                unbroadcast(grad_b, inputs[1].shape()),
            ])
        }
    }

    // ---- MulScalar ----
    #[derive(Debug)]
    pub struct MulScalarBackward {
        pub scalar: TensorData,
    }
    impl BackwardOp for MulScalarBackward {
        fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            Ok(vec![output_grad * self.scalar])
        }
    }

    // ---- Sum ----
    #[derive(Debug)]
    pub struct SumBackward;
    impl BackwardOp for SumBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let g = output_grad.iter().next().copied().unwrap_or(0.0);
            Ok(vec![ArrayD::from_elem(IxDyn(inputs[0].shape()), g)])
        }
    }

    // ---- Mean ----
    #[derive(Debug)]
    pub struct MeanBackward;
    impl BackwardOp for MeanBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let n = inputs[0].size().max(1) as TensorData;
            let g = output_grad.iter().next().copied().unwrap_or(0.0) / n;
            Ok(vec![ArrayD::from_elem(IxDyn(inputs[0].shape()), g)])
        }
    }

    // ---- MatMul ----
    #[derive(Debug)]
    pub struct MatMulBackward;
    impl BackwardOp for MatMulBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // A @ B = C  =>  dA = dC @ B^T, dB = A^T @ dC
            let a = inputs[0].data_clone()?.into_dimensionality::<Ix2>()?;
            let b = inputs[1].data_clone()?.into_dimensionality::<Ix2>()?;
            let d_c = output_grad.clone().into_dimensionality::<Ix2>()?;
            let grad_a = d_c.dot(&b.t()).into_dyn();
            let grad_b = a.t().dot(&d_c).into_dyn();
            Ok(vec![grad_a, grad_b])
        }
    }

    // ---- Transpose ----
    #[derive(Debug)]
    pub struct TransposeBackward;
    impl BackwardOp for TransposeBackward {
        fn backward(&self, _inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            let g = output_grad.clone().into_dimensionality::<Ix2>()?;
            Ok(vec![g.reversed_axes().into_dyn()])
        }
    }

    // ---- Cat ----
    #[derive(Debug)]
    pub struct CatBackward {
        pub axis: usize,
    }
    impl BackwardOp for CatBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // Each input receives its own slab of the output gradient.
            let mut start = 0;
            let mut grads = Vec::with_capacity(inputs.len());
            for input in inputs {
                let len = input.shape()[self.axis];
                let slab = output_grad.slice_axis(Axis(self.axis), Slice::from(start..start + len));
                grads.push(slab.to_owned());
                start += len;
            }
            Ok(grads)
        }
    }

    // ---- ReLU ----
    #[derive(Debug)]
    pub struct ReluBackward;
    impl BackwardOp for ReluBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // dIn = dOut * (in > 0)
            let mask = inputs[0].data()?.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
            Ok(vec![output_grad * &mask])
        }
    }

    // ---- Tanh ----
    #[derive(Debug)]
    pub struct TanhBackward;
    impl BackwardOp for TanhBackward {
        fn backward(&self, inputs: &[Tensor], output_grad: &ArrayD<TensorData>) -> Result<Vec<ArrayD<TensorData>>, TensorError> {
            // dIn = dOut * (1 - tanh(in)^2)
            let local = inputs[0].data()?.mapv(|x| 1.0 - x.tanh().powi(2));
            Ok(vec![output_grad * &local])
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::{ops, Tensor};
    use approx::assert_relative_eq;

    #[test]
    fn gradient_of_shared_input_accumulates() {
        // y = sum(x * x) => dy/dx = 2x
        let x = Tensor::from_vec(vec![1.0, -2.0, 3.0], &[3], true).unwrap();
        let y = ops::sum(&ops::mul(&x, &x).unwrap()).unwrap();
        y.backward().unwrap();
        let g = x.grad().unwrap().unwrap();
        assert_eq!(g.iter().copied().collect::<Vec<_>>(), vec![2.0, -4.0, 6.0]);
    }

    #[test]
    fn diamond_graph_visits_each_node_once() {
        // a = 2x; y = sum(a + a) => dy/dx = 4
        let x = Tensor::from_vec(vec![0.5, 1.5], &[2], true).unwrap();
        let a = ops::mul_scalar(&x, 2.0).unwrap();
        let y = ops::sum(&ops::add(&a, &a).unwrap()).unwrap();
        y.backward().unwrap();
        for g in x.grad().unwrap().unwrap().iter() {
            assert_relative_eq!(*g, 4.0);
        }
    }

    #[test]
    fn leaf_root_receives_seed() {
        let x = Tensor::from_vec(vec![3.0], &[1], true).unwrap();
        x.backward().unwrap();
        assert_eq!(x.grad().unwrap().unwrap().iter().copied().collect::<Vec<_>>(), vec![1.0]);
    }

    #[test]
    fn inputs_without_grad_are_skipped() {
        let x = Tensor::from_vec(vec![1.0, 2.0], &[2], true).unwrap();
        let c = Tensor::from_vec(vec![5.0, 5.0], &[2], false).unwrap();
        let y = ops::sum(&ops::mul(&x, &c).unwrap()).unwrap();
        y.backward().unwrap();
        assert!(c.grad().unwrap().is_none());
        assert_eq!(x.grad().unwrap().unwrap().iter().copied().collect::<Vec<_>>(), vec![5.0, 5.0]);
    }
}
