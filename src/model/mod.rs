//! Capability contracts of the model-computation collaborator.
//!
//! The federated machinery never looks inside a model: it only needs a forward
//! pass, a backward pass that leaves gradients on the parameters, and mutable
//! access to the parameters in a stable order.

mod linear;
mod mse;

use std::sync::Arc;

use ndarray::ArrayD;
use rand::rngs::StdRng;

use crate::error::Result;

pub use linear::Linear;
pub use mse::Mse;

/// Dynamic dimension tensor used across the collaborator boundary.
pub type Tensor = ArrayD<f32>;

/// Builds a fresh model replica from a seeded rng.
///
/// Every worker calls it with an rng seeded the same way, so all replicas start identical.
pub type ModelFactory = Arc<dyn Fn(&mut StdRng) -> Box<dyn DifferentiableModel> + Send + Sync>;

/// Role of a parameter inside its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Weight,
    Bias,
}

/// A trainable tensor and its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub data: Tensor,
    /// `None` until the first backward pass touches this parameter.
    pub grad: Option<Tensor>,
    pub requires_grad: bool,
}

impl Parameter {
    /// Creates a new trainable `Parameter` with no gradient.
    pub fn new(name: impl Into<String>, kind: ParamKind, data: Tensor) -> Self {
        Self {
            name: name.into(),
            kind,
            data,
            grad: None,
            requires_grad: true,
        }
    }

    /// Amount of scalars in this parameter.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Adds `delta` into the gradient, allocating it on first use.
    pub fn accumulate_grad(&mut self, delta: &Tensor) {
        match self.grad.as_mut() {
            Some(grad) => *grad += delta,
            None => self.grad = Some(delta.clone()),
        }
    }

    /// Zeroes the gradient in place, if there is one.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.fill(0.0);
        }
    }
}

/// A pair of input and target tensors for one participant.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

/// A differentiable model replica owned by a single worker.
pub trait DifferentiableModel: Send {
    /// Runs the forward pass, remembering whatever the backward pass needs.
    fn forward(&mut self, inputs: &Tensor) -> Result<Tensor>;

    /// Back-propagates `grad_outputs` through the last forward pass and
    /// accumulates the result into each parameter's gradient.
    fn backward(&mut self, grad_outputs: &Tensor) -> Result<()>;

    /// Parameters in their fixed traversal order.
    fn parameters(&self) -> &[Parameter];

    /// Mutable parameters in the same order as `parameters`.
    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Switches between training and evaluation behaviour.
    fn set_training(&mut self, _training: bool) {}
}

/// A loss function evaluated on a worker.
pub trait Criterion: Send {
    /// Scalar loss of `outputs` against `targets`.
    fn loss(&self, outputs: &Tensor, targets: &Tensor) -> Result<f32>;

    /// Derivative of the loss with respect to `outputs`.
    fn loss_grad(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor>;
}
