use crate::error::{LenslessError, Result};
use crate::graph::{Graph, Var};
use crate::nn::Parameter;
use crate::operators::PaddingGeometry;

/// Wiener-style inversion `x = C (HᵀH + K)⁻¹ Hᵀ Cᵀ b` with a learnable regulariser `K`.
#[derive(Debug, Clone)]
pub struct TrainableInversion {
    k: Parameter,
}

impl TrainableInversion {
    pub fn new(k: f32) -> Result<Self> {
        if !(k > 0.0 && k.is_finite()) {
            return Err(LenslessError::Configuration(format!(
                "trainable inversion: K must be positive, got {k}"
            )));
        }
        Ok(TrainableInversion {
            k: Parameter::scalar("K", k),
        })
    }

    pub fn regularizer(&self) -> f32 {
        self.k.item()
    }

    pub(crate) fn run(
        &mut self,
        graph: &mut Graph,
        b: Var,
        kernel: Var,
        geometry: &PaddingGeometry,
    ) -> Result<Var> {
        let k = self.k.bind(graph);
        let one = graph.scalar_constant(1.0);
        let zero = graph.scalar_constant(0.0);
        let padded = graph.pad(b, geometry)?;
        let back = graph.corr(padded, kernel)?;
        let x = graph.solve(back, kernel, one, zero, k)?;
        let image = graph.crop(x, geometry)?;
        Ok(graph.relu(image))
    }

    pub(crate) fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        visitor(&self.k);
    }

    pub(crate) fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        visitor(&mut self.k);
    }
}
