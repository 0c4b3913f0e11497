use crate::graph::{Gradients, Graph, Tensor, Var};
use ndarray::Array4;
use std::fmt::{Debug, Formatter};

/// Named trainable tensor.
///
/// A parameter is bound to a [`Graph`] as a leaf for every forward pass; after the backward pass
/// [`Parameter::collect_gradient`] sums the gradients of every binding into `grad`.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    grad: Option<Tensor>,
    requires_grad: bool,
    bindings: Vec<Var>,
}

impl Debug for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parameter(name={}, shape={:?}, requires_grad={}, has_grad={})",
            self.name,
            self.value.shape(),
            self.requires_grad,
            self.grad.is_some()
        )
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Parameter {
            name: name.into(),
            value,
            grad: None,
            requires_grad: true,
            bindings: Vec::new(),
        }
    }

    /// `1 × 1 × 1 × 1` parameter.
    pub fn scalar(name: impl Into<String>, value: f32) -> Self {
        Self::new(name, Array4::from_elem((1, 1, 1, 1), value))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// First element, for scalar parameters.
    pub fn item(&self) -> f32 {
        self.value.iter().next().copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut Tensor> {
        self.grad.as_mut()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Adds the parameter to `graph` as a leaf and remembers the handle.
    pub fn bind(&mut self, graph: &mut Graph) -> Var {
        let var = graph.leaf(self.value.clone(), self.requires_grad);
        self.bindings.push(var);
        var
    }

    /// Moves the gradients of all bindings out of `grads` and accumulates them.
    pub fn collect_gradient(&mut self, grads: &mut Gradients) {
        for var in self.bindings.drain(..) {
            if let Some(g) = grads.take(var) {
                match self.grad.as_mut() {
                    Some(acc) => *acc += &g,
                    None => self.grad = Some(g),
                }
            }
        }
    }

    /// Adds `g` to the stored gradient, for penalties evaluated outside the graph.
    pub fn accumulate_gradient(&mut self, g: &Tensor) {
        match self.grad.as_mut() {
            Some(acc) => *acc += g,
            None => self.grad = Some(g.clone()),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
        self.bindings.clear();
    }
}
