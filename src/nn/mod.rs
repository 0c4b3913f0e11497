//! Trainable building blocks on top of [`crate::graph`].

pub mod layers;
pub mod parameter;

use crate::config::ProcessConfig;
use crate::error::{LenslessError, Result};
use crate::graph::{Gradients, Graph, Var};
pub use layers::Conv3x3;
pub use parameter::Parameter;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Component with trainable parameters that maps one graph value to another.
pub trait Module {
    fn forward(&mut self, graph: &mut Graph, input: Var) -> Result<Var>;

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter));

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter));

    /// Freezes (`false`) or unfreezes (`true`) every parameter.
    fn set_requires_grad(&mut self, requires_grad: bool) {
        self.visit_parameters_mut(&mut |p| p.set_requires_grad(requires_grad));
    }

    /// Number of scalar values that receive gradients.
    fn num_trainable(&self) -> usize {
        let mut count = 0;
        self.visit_parameters(&mut |p| {
            if p.requires_grad() {
                count += p.len();
            }
        });
        count
    }

    fn collect_gradients(&mut self, grads: &mut Gradients) {
        self.visit_parameters_mut(&mut |p| p.collect_gradient(grads));
    }

    fn zero_grad(&mut self) {
        self.visit_parameters_mut(&mut |p| p.zero_grad());
    }
}

/// Residual CNN `x + f(x)`, with `f` a stack of 3×3 convolutions and ReLUs.
///
/// The last convolution starts at zero so a freshly inserted network is the identity.
#[derive(Debug, Clone)]
pub struct ProcessNetwork {
    name: String,
    layers: Vec<Conv3x3>,
}

impl ProcessNetwork {
    /// # Arguments
    /// - `name`: Prefix of the parameter names, e.g. `"pre_process"`.
    /// - `channels`: Image channels, in and out.
    /// - `config`: Depth (number of convolutions, at least 2), width and seed.
    pub fn new(name: &str, channels: usize, config: &ProcessConfig) -> Result<Self> {
        if config.depth < 2 {
            return Err(LenslessError::Configuration(format!(
                "{name}: depth must be at least 2, got {}",
                config.depth
            )));
        }
        if config.hidden_channels == 0 || channels == 0 {
            return Err(LenslessError::Configuration(format!(
                "{name}: channel counts must be positive"
            )));
        }
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut layers = Vec::with_capacity(config.depth);
        layers.push(Conv3x3::new(
            &format!("{name}.conv0"),
            channels,
            config.hidden_channels,
            &mut rng,
        ));
        for i in 1..config.depth - 1 {
            layers.push(Conv3x3::new(
                &format!("{name}.conv{i}"),
                config.hidden_channels,
                config.hidden_channels,
                &mut rng,
            ));
        }
        layers.push(Conv3x3::zeroed(
            &format!("{name}.conv{}", config.depth - 1),
            config.hidden_channels,
            channels,
        ));
        Ok(ProcessNetwork {
            name: name.to_string(),
            layers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Image channels the network maps.
    pub fn channels(&self) -> usize {
        self.layers.first().map(|l| l.in_channels()).unwrap_or(0)
    }
}

impl Module for ProcessNetwork {
    fn forward(&mut self, graph: &mut Graph, input: Var) -> Result<Var> {
        let last = self.layers.len() - 1;
        let mut h = input;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            h = layer.forward(graph, h)?;
            if i < last {
                h = graph.relu(h);
            }
        }
        graph.add(input, h)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        for layer in &self.layers {
            layer.visit_parameters(visitor);
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn config(depth: usize) -> ProcessConfig {
        ProcessConfig {
            depth,
            hidden_channels: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_network_is_identity() {
        let mut net = ProcessNetwork::new("post_process", 3, &config(3)).unwrap();
        let mut graph = Graph::new();
        let input = Array4::from_shape_fn((2, 5, 5, 3), |(b, i, j, c)| (b + i + j + c) as f32);
        let x = graph.constant(input.clone());
        let y = net.forward(&mut graph, x).unwrap();
        assert_eq!(graph.value(y), &input);
    }

    #[test]
    fn test_freeze_changes_trainable_count() {
        let mut net = ProcessNetwork::new("pre_process", 1, &config(2)).unwrap();
        let total = (4 * 9 + 4) + (4 * 9 + 1);
        assert_eq!(net.num_trainable(), total);
        net.set_requires_grad(false);
        assert_eq!(net.num_trainable(), 0);
        net.set_requires_grad(true);
        assert_eq!(net.num_trainable(), total);
    }

    #[test]
    fn test_last_layer_receives_gradient() {
        let mut net = ProcessNetwork::new("post_process", 1, &config(2)).unwrap();
        let mut graph = Graph::new();
        let x = graph.constant(Array4::from_elem((1, 4, 4, 1), 0.5));
        let y = net.forward(&mut graph, x).unwrap();
        let mut grads = graph.backward(y, Array4::ones((1, 4, 4, 1))).unwrap();
        net.collect_gradients(&mut grads);
        let mut names = Vec::new();
        net.visit_parameters(&mut |p| {
            if p.grad().map(|g| g.iter().any(|v| *v != 0.0)).unwrap_or(false) {
                names.push(p.name().to_string());
            }
        });
        assert!(names.contains(&"post_process.conv1.bias".to_string()));
    }

    #[test]
    fn test_shallow_network_rejected() {
        assert!(matches!(
            ProcessNetwork::new("pre_process", 1, &config(1)),
            Err(LenslessError::Configuration(_))
        ));
    }
}
