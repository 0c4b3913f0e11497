use crate::error::{LenslessError, Result};
use crate::graph::{Graph, Var};
use crate::nn::Parameter;
use crate::operators::PaddingGeometry;
use crate::unrolled::{adjoint_model, forward_model, IterationParameters};
use ndarray::Array4;

/// Unrolled FISTA on the image domain with learnable steps `α_k` and momenta `β_k`.
///
/// Each iteration computes `x = relu(y − α_k Aᵀ(Ay − b))` followed by
/// `y = x + β_k (x − x_prev)`.
#[derive(Debug, Clone)]
pub struct UnrolledFista {
    n_iter: usize,
    alpha: IterationParameters,
    beta: IterationParameters,
}

/// Beck–Teboulle momentum weights `(t_k − 1) / t_{k+1}` with `t_0 = 1`.
pub fn beck_teboulle_momentum(n_iter: usize) -> Vec<f32> {
    let mut t = 1.0f32;
    (0..n_iter)
        .map(|_| {
            let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
            let beta = (t - 1.0) / t_next;
            t = t_next;
            beta
        })
        .collect()
}

impl UnrolledFista {
    /// # Arguments
    /// - `n_iter`: Number of unrolled iterations.
    /// - `lipschitz`: Lipschitz constant of the data-term gradient; steps start at `1 / L`.
    /// - `shared`: One step and one momentum for all iterations.
    /// - `learn_momentum`: Train the momenta; otherwise they stay at their initial values.
    pub fn new(n_iter: usize, lipschitz: f32, shared: bool, learn_momentum: bool) -> Result<Self> {
        if n_iter == 0 {
            return Err(LenslessError::Configuration(
                "unrolled FISTA needs at least one iteration".to_string(),
            ));
        }
        if !(lipschitz > 0.0 && lipschitz.is_finite()) {
            return Err(LenslessError::Configuration(format!(
                "unrolled FISTA: invalid Lipschitz constant {lipschitz} (all-zero PSF?)"
            )));
        }
        let alpha = IterationParameters::new("alpha", &vec![1.0 / lipschitz; n_iter], shared);
        let mut beta = IterationParameters::new("beta", &beck_teboulle_momentum(n_iter), shared);
        beta.set_requires_grad(learn_momentum);
        Ok(UnrolledFista { n_iter, alpha, beta })
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    pub fn steps(&self) -> Vec<f32> {
        self.alpha.values()
    }

    pub fn momenta(&self) -> Vec<f32> {
        self.beta.values()
    }

    pub(crate) fn run(
        &mut self,
        graph: &mut Graph,
        b: Var,
        kernel: Var,
        geometry: &PaddingGeometry,
    ) -> Result<Var> {
        let alpha = self.alpha.bind(graph);
        let beta = self.beta.bind(graph);
        let mut x = graph.constant(Array4::zeros(graph.value(b).raw_dim()));
        let mut y = x;
        for k in 0..self.n_iter {
            let ay = forward_model(graph, y, kernel, geometry)?;
            let residual = graph.sub(ay, b)?;
            let gradient = adjoint_model(graph, residual, kernel, geometry)?;
            let step = graph.scale(gradient, alpha[k])?;
            let z = graph.sub(y, step)?;
            let x_next = graph.relu(z);
            let delta = graph.sub(x_next, x)?;
            let momentum = graph.scale(delta, beta[k])?;
            y = graph.add(x_next, momentum)?;
            x = x_next;
        }
        Ok(x)
    }

    pub(crate) fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.alpha.visit(visitor);
        self.beta.visit(visitor);
    }

    pub(crate) fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.alpha.visit_mut(visitor);
        self.beta.visit_mut(visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_beck_teboulle_sequence() {
        let beta = beck_teboulle_momentum(3);
        assert_relative_eq!(beta[0], 0.0);
        let t1 = (1.0 + 5.0f32.sqrt()) / 2.0;
        let t2 = (1.0 + (1.0 + 4.0 * t1 * t1).sqrt()) / 2.0;
        assert_relative_eq!(beta[1], (t1 - 1.0) / t2, epsilon = 1e-6);
        assert!(beta[2] > beta[1]);
    }

    #[test]
    fn test_initial_step_is_inverse_lipschitz() {
        let fista = UnrolledFista::new(3, 4.0, false, true).unwrap();
        assert_eq!(fista.steps(), vec![0.25; 3]);
        let shared = UnrolledFista::new(3, 4.0, true, true).unwrap();
        assert_eq!(shared.steps(), vec![0.25; 3]);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(UnrolledFista::new(0, 1.0, false, true).is_err());
        assert!(UnrolledFista::new(2, 0.0, false, true).is_err());
    }
}
