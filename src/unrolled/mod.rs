//! Differentiable unrolled solvers with learnable per-iteration coefficients.
//!
//! A fixed number of iterations is laid out on a [`Graph`], optionally framed by residual CNN
//! pre- and post-processors. Gradients reach the coefficients, the processors and, when the
//! PSF is itself a graph value, the mask parameters that produced it.

pub mod admm;
pub mod fista;
pub mod inversion;

use crate::config::{Method, UnrolledConfig};
use crate::error::{LenslessError, Result};
use crate::graph::{Graph, SpatialAxis, Var};
use crate::nn::{Module, Parameter, ProcessNetwork};
use crate::operators::{ConvolutionOperator, PaddingGeometry};
use crate::psf::validate_psf;
use ndarray::{Array3, Array4, Axis};

pub use admm::UnrolledAdmm;
pub use fista::UnrolledFista;
pub use inversion::TrainableInversion;

/// Per-iteration scalar coefficient, either one shared parameter or one per iteration.
#[derive(Debug, Clone)]
pub struct IterationParameters {
    params: Vec<Parameter>,
    n_iter: usize,
}

impl IterationParameters {
    /// # Arguments
    /// - `name`: Parameter name; distinct parameters get an `.{k}` suffix.
    /// - `initial`: Initial value of each iteration's coefficient. A shared parameter starts
    ///   at their mean.
    /// - `shared`: Reuse one parameter for every iteration.
    pub fn new(name: &str, initial: &[f32], shared: bool) -> Self {
        let n_iter = initial.len();
        let params = if shared {
            let mean = initial.iter().sum::<f32>() / n_iter.max(1) as f32;
            vec![Parameter::scalar(name, mean)]
        } else {
            initial
                .iter()
                .enumerate()
                .map(|(k, &v)| Parameter::scalar(format!("{name}.{k}"), v))
                .collect()
        };
        IterationParameters { params, n_iter }
    }

    pub fn is_shared(&self) -> bool {
        self.params.len() == 1 && self.n_iter != 1
    }

    /// Coefficient values, one per iteration.
    pub fn values(&self) -> Vec<f32> {
        (0..self.n_iter)
            .map(|k| self.params[k.min(self.params.len() - 1)].item())
            .collect()
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        for p in &mut self.params {
            p.set_requires_grad(requires_grad);
        }
    }

    /// Binds the parameters and returns one handle per iteration.
    pub(crate) fn bind(&mut self, graph: &mut Graph) -> Vec<Var> {
        let vars: Vec<Var> = self.params.iter_mut().map(|p| p.bind(graph)).collect();
        (0..self.n_iter)
            .map(|k| vars[k.min(vars.len() - 1)])
            .collect()
    }

    pub(crate) fn visit(&self, visitor: &mut dyn FnMut(&Parameter)) {
        for p in &self.params {
            visitor(p);
        }
    }

    pub(crate) fn visit_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        for p in &mut self.params {
            visitor(p);
        }
    }
}

/// `A x = C(h ∗ Cᵀx)` for an image batch and a padded kernel.
pub(crate) fn forward_model(
    graph: &mut Graph,
    x: Var,
    kernel: Var,
    geometry: &PaddingGeometry,
) -> Result<Var> {
    let padded = graph.pad(x, geometry)?;
    let blurred = graph.conv(padded, kernel)?;
    graph.crop(blurred, geometry)
}

/// `Aᵀ r = C(h ⋆ Cᵀr)`.
pub(crate) fn adjoint_model(
    graph: &mut Graph,
    r: Var,
    kernel: Var,
    geometry: &PaddingGeometry,
) -> Result<Var> {
    let padded = graph.pad(r, geometry)?;
    let correlated = graph.corr(padded, kernel)?;
    graph.crop(correlated, geometry)
}

/// Circular differences `(Ψ_rows x, Ψ_cols x)`.
pub(crate) fn differences(graph: &mut Graph, x: Var) -> (Var, Var) {
    (
        graph.diff(x, SpatialAxis::Rows),
        graph.diff(x, SpatialAxis::Cols),
    )
}

#[derive(Debug, Clone)]
pub enum UnrolledAlgorithm {
    Fista(UnrolledFista),
    Admm(UnrolledAdmm),
    Inversion(TrainableInversion),
}

impl UnrolledAlgorithm {
    pub fn method(&self) -> Method {
        match self {
            UnrolledAlgorithm::Fista(_) => Method::UnrolledFista,
            UnrolledAlgorithm::Admm(_) => Method::UnrolledAdmm,
            UnrolledAlgorithm::Inversion(_) => Method::TrainableInversion,
        }
    }

    pub fn n_iter(&self) -> usize {
        match self {
            UnrolledAlgorithm::Fista(a) => a.n_iter(),
            UnrolledAlgorithm::Admm(a) => a.n_iter(),
            UnrolledAlgorithm::Inversion(_) => 1,
        }
    }

    fn run(&mut self, graph: &mut Graph, b: Var, kernel: Var, geometry: &PaddingGeometry) -> Result<Var> {
        match self {
            UnrolledAlgorithm::Fista(a) => a.run(graph, b, kernel, geometry),
            UnrolledAlgorithm::Admm(a) => a.run(graph, b, kernel, geometry),
            UnrolledAlgorithm::Inversion(a) => a.run(graph, b, kernel, geometry),
        }
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        match self {
            UnrolledAlgorithm::Fista(a) => a.visit_parameters(visitor),
            UnrolledAlgorithm::Admm(a) => a.visit_parameters(visitor),
            UnrolledAlgorithm::Inversion(a) => a.visit_parameters(visitor),
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        match self {
            UnrolledAlgorithm::Fista(a) => a.visit_parameters_mut(visitor),
            UnrolledAlgorithm::Admm(a) => a.visit_parameters_mut(visitor),
            UnrolledAlgorithm::Inversion(a) => a.visit_parameters_mut(visitor),
        }
    }
}

/// Graph handles produced by [`UnrolledSolver::forward`].
#[derive(Debug, Clone, Copy)]
pub struct UnrolledOutput {
    /// Final estimate, `N × H × W × C`.
    pub image: Var,
    /// Estimate before post-processing, when `return_unrolled_output` is set.
    pub unrolled: Option<Var>,
}

#[derive(Debug, Clone)]
pub struct UnrolledSolver {
    config: UnrolledConfig,
    geometry: PaddingGeometry,
    channels: usize,
    psf: Array3<f32>,
    algorithm: UnrolledAlgorithm,
    pre_process: Option<ProcessNetwork>,
    post_process: Option<ProcessNetwork>,
}

impl UnrolledSolver {
    /// Creates the solver for an `H × W × C` PSF.
    ///
    /// Processors whose config carries a `delay` are left out; the trainer inserts them at
    /// that epoch.
    pub fn new(psf: &Array3<f32>, config: &UnrolledConfig) -> Result<Self> {
        validate_psf(psf)?;
        let (h, w, channels) = psf.dim();
        let algorithm = match config.method {
            Method::UnrolledFista => {
                let lipschitz = ConvolutionOperator::new(psf)?.lipschitz();
                UnrolledAlgorithm::Fista(UnrolledFista::new(
                    config.n_iter,
                    lipschitz,
                    config.shared_parameters,
                    config.learn_momentum,
                )?)
            }
            Method::UnrolledAdmm => UnrolledAlgorithm::Admm(UnrolledAdmm::new(config)?),
            Method::TrainableInversion => {
                UnrolledAlgorithm::Inversion(TrainableInversion::new(config.inversion_k)?)
            }
        };
        let mut solver = UnrolledSolver {
            config: config.clone(),
            geometry: PaddingGeometry::new(h, w),
            channels,
            psf: psf.clone(),
            algorithm,
            pre_process: None,
            post_process: None,
        };
        if let Some(pre) = config.pre_process.as_ref().filter(|c| c.delay.is_none()) {
            solver.insert_pre_process(ProcessNetwork::new("pre_process", channels, pre)?)?;
        }
        if let Some(post) = config.post_process.as_ref().filter(|c| c.delay.is_none()) {
            solver.insert_post_process(ProcessNetwork::new("post_process", channels, post)?)?;
        }
        log::debug!(
            "unrolled solver {} for {}×{}×{}, {} trainable values",
            solver.algorithm_name(),
            h,
            w,
            channels,
            solver.num_trainable()
        );
        Ok(solver)
    }

    pub fn config(&self) -> &UnrolledConfig {
        &self.config
    }

    pub fn algorithm(&self) -> &UnrolledAlgorithm {
        &self.algorithm
    }

    pub fn n_iter(&self) -> usize {
        self.algorithm.n_iter()
    }

    /// `H × W × C` of images and measurements.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.geometry.image.0, self.geometry.image.1, self.channels)
    }

    pub fn psf(&self) -> &Array3<f32> {
        &self.psf
    }

    /// Method name framed by the processors, e.g. `ResCNN_d3_unrolled_admm`.
    pub fn algorithm_name(&self) -> String {
        let mut name = self.algorithm.method().to_string();
        if let Some(pre) = &self.pre_process {
            name = format!("ResCNN_d{}_{name}", pre.depth());
        }
        if let Some(post) = &self.post_process {
            name = format!("{name}_ResCNN_d{}", post.depth());
        }
        name
    }

    /// Replaces the fixed PSF, e.g. after a mask update.
    pub fn set_psf(&mut self, psf: &Array3<f32>) -> Result<()> {
        if psf.dim() != self.psf.dim() {
            return Err(LenslessError::shape("PSF", self.psf.shape(), psf.shape()));
        }
        validate_psf(psf)?;
        self.psf.assign(psf);
        Ok(())
    }

    fn check_processor(&self, network: &ProcessNetwork) -> Result<()> {
        if network.channels() != self.channels {
            return Err(LenslessError::shape(
                network.name(),
                &[self.channels],
                &[network.channels()],
            ));
        }
        Ok(())
    }

    pub fn insert_pre_process(&mut self, network: ProcessNetwork) -> Result<()> {
        self.check_processor(&network)?;
        self.pre_process = Some(network);
        Ok(())
    }

    pub fn insert_post_process(&mut self, network: ProcessNetwork) -> Result<()> {
        self.check_processor(&network)?;
        self.post_process = Some(network);
        Ok(())
    }

    pub fn remove_pre_process(&mut self) -> Option<ProcessNetwork> {
        self.pre_process.take()
    }

    pub fn remove_post_process(&mut self) -> Option<ProcessNetwork> {
        self.post_process.take()
    }

    pub fn has_pre_process(&self) -> bool {
        self.pre_process.is_some()
    }

    pub fn has_post_process(&self) -> bool {
        self.post_process.is_some()
    }

    pub fn freeze_pre_process(&mut self) {
        if let Some(net) = self.pre_process.as_mut() {
            net.set_requires_grad(false);
        }
    }

    pub fn unfreeze_pre_process(&mut self) {
        if let Some(net) = self.pre_process.as_mut() {
            net.set_requires_grad(true);
        }
    }

    pub fn freeze_post_process(&mut self) {
        if let Some(net) = self.post_process.as_mut() {
            net.set_requires_grad(false);
        }
    }

    pub fn unfreeze_post_process(&mut self) {
        if let Some(net) = self.post_process.as_mut() {
            net.set_requires_grad(true);
        }
    }

    /// Batched reconstruction on `graph`.
    ///
    /// # Arguments
    /// - `measurements`: `N × H × W × C` measurements.
    /// - `psf`: PSF value, shared (`1 × H × W × C`) or per sample (`N × H × W × C`); the
    ///   solver's fixed PSF when `None`.
    pub fn forward(
        &mut self,
        graph: &mut Graph,
        measurements: Var,
        psf: Option<Var>,
    ) -> Result<UnrolledOutput> {
        let (h, w, c) = self.shape();
        let (n, mh, mw, mc) = graph.value(measurements).dim();
        if (mh, mw, mc) != (h, w, c) {
            return Err(LenslessError::shape("measurement batch", &[n, h, w, c], &[n, mh, mw, mc]));
        }
        let psf = match psf {
            Some(var) => {
                let (pn, ph, pw, pc) = graph.value(var).dim();
                if (ph, pw, pc) != (h, w, c) || !(pn == 1 || pn == n) {
                    return Err(LenslessError::shape("PSF batch", &[n, h, w, c], &[pn, ph, pw, pc]));
                }
                var
            }
            None => graph.constant(self.psf.clone().insert_axis(Axis(0))),
        };
        let padded = graph.pad(psf, &self.geometry)?;
        let kernel = graph.roll(padded, self.geometry.centering_shift());

        let mut b = measurements;
        if let Some(pre) = self.pre_process.as_mut() {
            b = pre.forward(graph, b)?;
        }
        let x = if self.config.skip_unrolled {
            b
        } else {
            self.algorithm.run(graph, b, kernel, &self.geometry)?
        };
        let unrolled = self.config.return_unrolled_output.then_some(x);
        let image = match self.post_process.as_mut() {
            Some(post) => post.forward(graph, x)?,
            None => x,
        };
        Ok(UnrolledOutput { image, unrolled })
    }

    /// Inference on a batch with the fixed PSF.
    pub fn batch_call(&mut self, batch: &Array4<f32>) -> Result<Array4<f32>> {
        let mut graph = Graph::new();
        let input = graph.constant(batch.clone());
        let output = self.forward(&mut graph, input, None);
        self.zero_grad();
        Ok(graph.value(output?.image).clone())
    }
}

impl Module for UnrolledSolver {
    fn forward(&mut self, graph: &mut Graph, input: Var) -> Result<Var> {
        Ok(UnrolledSolver::forward(self, graph, input, None)?.image)
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.algorithm.visit_parameters(visitor);
        if let Some(pre) = &self.pre_process {
            pre.visit_parameters(visitor);
        }
        if let Some(post) = &self.post_process {
            post.visit_parameters(visitor);
        }
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.algorithm.visit_parameters_mut(visitor);
        if let Some(pre) = self.pre_process.as_mut() {
            pre.visit_parameters_mut(visitor);
        }
        if let Some(post) = self.post_process.as_mut() {
            post.visit_parameters_mut(visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::psf::{delta_psf, gaussian_psf};
    use approx::assert_abs_diff_eq;

    fn pattern(n: usize, h: usize, w: usize, c: usize) -> Array4<f32> {
        Array4::from_shape_fn((n, h, w, c), |(b, i, j, ch)| {
            ((i * 3 + j * 5 + ch + b) % 7) as f32 / 7.0
        })
    }

    fn config(method: Method) -> UnrolledConfig {
        UnrolledConfig {
            method,
            n_iter: 4,
            ..Default::default()
        }
    }

    fn process() -> ProcessConfig {
        ProcessConfig {
            depth: 2,
            hidden_channels: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_fista_with_delta_psf_returns_measurement() {
        let psf = delta_psf(8, 8, 1);
        let mut solver = UnrolledSolver::new(&psf, &config(Method::UnrolledFista)).unwrap();
        let batch = pattern(2, 8, 8, 1);
        let out = solver.batch_call(&batch).unwrap();
        assert_eq!(out.dim(), (2, 8, 8, 1));
        for (a, b) in out.iter().zip(batch.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_parameter_sharing_and_momentum() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        let distinct = UnrolledSolver::new(&psf, &config(Method::UnrolledFista)).unwrap();
        assert_eq!(distinct.num_trainable(), 8);
        let shared = UnrolledSolver::new(
            &psf,
            &UnrolledConfig {
                shared_parameters: true,
                ..config(Method::UnrolledFista)
            },
        )
        .unwrap();
        assert_eq!(shared.num_trainable(), 2);
        let fixed_momentum = UnrolledSolver::new(
            &psf,
            &UnrolledConfig {
                learn_momentum: false,
                ..config(Method::UnrolledFista)
            },
        )
        .unwrap();
        assert_eq!(fixed_momentum.num_trainable(), 4);
        let admm = UnrolledSolver::new(&psf, &config(Method::UnrolledAdmm)).unwrap();
        assert_eq!(admm.num_trainable(), 16);
        let inversion = UnrolledSolver::new(&psf, &config(Method::TrainableInversion)).unwrap();
        assert_eq!(inversion.num_trainable(), 1);
    }

    #[test]
    fn test_gradients_reach_coefficients_and_psf() {
        let psf = gaussian_psf(8, 8, 1, 1.5);
        for method in [
            Method::UnrolledFista,
            Method::UnrolledAdmm,
            Method::TrainableInversion,
        ] {
            let mut solver = UnrolledSolver::new(&psf, &config(method)).unwrap();
            let mut graph = Graph::new();
            let b = graph.constant(pattern(1, 8, 8, 1));
            let psf_var = graph.leaf(psf.clone().insert_axis(Axis(0)), true);
            let out = solver.forward(&mut graph, b, Some(psf_var)).unwrap();
            let image = graph.value(out.image).clone();
            assert!(image.iter().all(|v| v.is_finite() && *v >= 0.0), "{method}");
            let mut grads = graph.backward(out.image, image).unwrap();
            let psf_grad = grads.take(psf_var).unwrap();
            assert!(psf_grad.iter().all(|v| v.is_finite()));
            solver.collect_gradients(&mut grads);
            let mut with_grad = 0;
            solver.visit_parameters(&mut |p| {
                if let Some(g) = p.grad() {
                    assert!(g.iter().all(|v| v.is_finite()));
                    with_grad += 1;
                }
            });
            assert!(with_grad > 0, "{method}");
        }
    }

    #[test]
    fn test_inversion_with_delta_psf() {
        let psf = delta_psf(6, 6, 2);
        let mut solver = UnrolledSolver::new(
            &psf,
            &UnrolledConfig {
                inversion_k: 1.0,
                ..config(Method::TrainableInversion)
            },
        )
        .unwrap();
        let batch = pattern(1, 6, 6, 2);
        let out = solver.batch_call(&batch).unwrap();
        for (a, b) in out.iter().zip(batch.iter()) {
            assert_abs_diff_eq!(*a, *b / 2.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_per_sample_psf_batch() {
        let psf = delta_psf(6, 6, 1);
        let mut solver = UnrolledSolver::new(&psf, &config(Method::UnrolledAdmm)).unwrap();
        let mut graph = Graph::new();
        let b = graph.constant(pattern(3, 6, 6, 1));
        let psfs = Array4::from_shape_fn((3, 6, 6, 1), |(_, i, j, _)| {
            if (i, j) == (3, 3) {
                1.0
            } else {
                0.0
            }
        });
        let psf_var = graph.constant(psfs);
        let out = solver.forward(&mut graph, b, Some(psf_var)).unwrap();
        assert_eq!(graph.value(out.image).dim(), (3, 6, 6, 1));
        let wrong = graph.constant(Array4::zeros((2, 6, 6, 1)));
        assert!(matches!(
            solver.forward(&mut graph, b, Some(wrong)),
            Err(LenslessError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_set_psf_checks_shape() {
        let psf = delta_psf(6, 6, 1);
        let mut solver = UnrolledSolver::new(&psf, &config(Method::UnrolledFista)).unwrap();
        assert!(matches!(
            solver.set_psf(&delta_psf(6, 5, 1)),
            Err(LenslessError::ShapeMismatch { .. })
        ));
        let blurred = gaussian_psf(6, 6, 1, 1.0);
        solver.set_psf(&blurred).unwrap();
        assert_eq!(solver.psf(), &blurred);
    }

    #[test]
    fn test_processor_insert_freeze_remove() {
        let psf = delta_psf(6, 6, 1);
        let mut solver = UnrolledSolver::new(&psf, &config(Method::UnrolledFista)).unwrap();
        let base = solver.num_trainable();
        let network = ProcessNetwork::new("post_process", 1, &process()).unwrap();
        let added = network.num_trainable();
        solver.insert_post_process(network).unwrap();
        assert_eq!(solver.num_trainable(), base + added);
        assert_eq!(solver.algorithm_name(), "unrolled_fista_ResCNN_d2");
        solver.freeze_post_process();
        assert_eq!(solver.num_trainable(), base);
        solver.unfreeze_post_process();
        assert_eq!(solver.num_trainable(), base + added);
        assert!(solver.remove_post_process().is_some());
        assert_eq!(solver.num_trainable(), base);

        let wrong = ProcessNetwork::new("pre_process", 3, &process()).unwrap();
        assert!(solver.insert_pre_process(wrong).is_err());
    }

    #[test]
    fn test_delayed_processor_not_inserted() {
        let psf = delta_psf(6, 6, 1);
        let solver = UnrolledSolver::new(
            &psf,
            &UnrolledConfig {
                pre_process: Some(ProcessConfig {
                    delay: Some(2),
                    ..process()
                }),
                post_process: Some(process()),
                ..config(Method::UnrolledFista)
            },
        )
        .unwrap();
        assert!(!solver.has_pre_process());
        assert!(solver.has_post_process());
    }

    #[test]
    fn test_skip_unrolled_and_unrolled_output() {
        let psf = gaussian_psf(6, 6, 1, 1.0);
        let mut solver = UnrolledSolver::new(
            &psf,
            &UnrolledConfig {
                skip_unrolled: true,
                return_unrolled_output: true,
                post_process: Some(process()),
                ..config(Method::UnrolledFista)
            },
        )
        .unwrap();
        let mut graph = Graph::new();
        let batch = pattern(1, 6, 6, 1);
        let b = graph.constant(batch.clone());
        let out = solver.forward(&mut graph, b, None).unwrap();
        let unrolled = out.unrolled.unwrap();
        assert_eq!(graph.value(unrolled), &batch);
        // zero-initialised last layer
        assert_eq!(graph.value(out.image), &batch);
    }
}
