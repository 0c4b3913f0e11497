use crate::error::Result;
use crate::graph::{Graph, Var};
use crate::nn::{Module, Parameter};
use ndarray::Array4;
use rand::Rng;

/// Zero-padded 3×3 convolution with a per-channel bias.
#[derive(Debug, Clone)]
pub struct Conv3x3 {
    weight: Parameter,
    bias: Parameter,
}

impl Conv3x3 {
    /// Kaiming-uniform initialised layer.
    pub fn new<R: Rng>(name: &str, in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        let bound = (6.0 / (in_channels * 9) as f32).sqrt();
        let weight = Array4::from_shape_fn((out_channels, in_channels, 3, 3), |_| {
            rng.gen_range(-bound..bound)
        });
        Conv3x3 {
            weight: Parameter::new(format!("{name}.weight"), weight),
            bias: Parameter::new(
                format!("{name}.bias"),
                Array4::zeros((1, 1, 1, out_channels)),
            ),
        }
    }

    /// Layer with all weights zero.
    pub fn zeroed(name: &str, in_channels: usize, out_channels: usize) -> Self {
        Conv3x3 {
            weight: Parameter::new(
                format!("{name}.weight"),
                Array4::zeros((out_channels, in_channels, 3, 3)),
            ),
            bias: Parameter::new(
                format!("{name}.bias"),
                Array4::zeros((1, 1, 1, out_channels)),
            ),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.value().dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.value().dim().0
    }
}

impl Module for Conv3x3 {
    fn forward(&mut self, graph: &mut Graph, input: Var) -> Result<Var> {
        let weight = self.weight.bind(graph);
        let bias = self.bias.bind(graph);
        let y = graph.conv3x3(input, weight)?;
        graph.bias_add(y, bias)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        visitor(&self.weight);
        visitor(&self.bias);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        visitor(&mut self.weight);
        visitor(&mut self.bias);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_conv_shapes_and_parameter_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = Conv3x3::new("conv0", 2, 5, &mut rng);
        assert_eq!(layer.num_trainable(), 5 * 2 * 9 + 5);
        let mut graph = Graph::new();
        let x = graph.constant(Array4::ones((3, 6, 7, 2)));
        let y = layer.forward(&mut graph, x).unwrap();
        assert_eq!(graph.value(y).dim(), (3, 6, 7, 5));
    }

    #[test]
    fn test_zeroed_layer_outputs_zero() {
        let mut layer = Conv3x3::zeroed("last", 1, 1);
        let mut graph = Graph::new();
        let x = graph.constant(Array4::ones((1, 4, 4, 1)));
        let y = layer.forward(&mut graph, x).unwrap();
        assert!(graph.value(y).iter().all(|&v| v == 0.0));
    }
}
