use crate::config::UnrolledConfig;
use crate::error::{LenslessError, Result};
use crate::graph::{Graph, SpatialAxis, Var};
use crate::nn::Parameter;
use crate::operators::PaddingGeometry;
use crate::unrolled::{differences, IterationParameters};
use ndarray::{s, Array4};

/// Unrolled ADMM with total-variation and non-negativity splits on the padded canvas.
///
/// Mirrors [`crate::recon::Admm`], with `mu1`, `mu2`, `mu3` and `tau` learned per iteration.
#[derive(Debug, Clone)]
pub struct UnrolledAdmm {
    n_iter: usize,
    mu1: IterationParameters,
    mu2: IterationParameters,
    mu3: IterationParameters,
    tau: IterationParameters,
}

impl UnrolledAdmm {
    pub fn new(config: &UnrolledConfig) -> Result<Self> {
        if config.n_iter == 0 {
            return Err(LenslessError::Configuration(
                "unrolled ADMM needs at least one iteration".to_string(),
            ));
        }
        for (name, value) in [
            ("mu1", config.mu1),
            ("mu2", config.mu2),
            ("mu3", config.mu3),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(LenslessError::Configuration(format!(
                    "unrolled ADMM {name} must be positive, got {value}"
                )));
            }
        }
        if !(config.tau >= 0.0 && config.tau.is_finite()) {
            return Err(LenslessError::Configuration(format!(
                "unrolled ADMM tau must be non-negative, got {}",
                config.tau
            )));
        }
        let n = config.n_iter;
        let shared = config.shared_parameters;
        Ok(UnrolledAdmm {
            n_iter: n,
            mu1: IterationParameters::new("mu1", &vec![config.mu1; n], shared),
            mu2: IterationParameters::new("mu2", &vec![config.mu2; n], shared),
            mu3: IterationParameters::new("mu3", &vec![config.mu3; n], shared),
            tau: IterationParameters::new("tau", &vec![config.tau; n], shared),
        })
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    pub(crate) fn run(
        &mut self,
        graph: &mut Graph,
        b: Var,
        kernel: Var,
        geometry: &PaddingGeometry,
    ) -> Result<Var> {
        let mu1 = self.mu1.bind(graph);
        let mu2 = self.mu2.bind(graph);
        let mu3 = self.mu3.bind(graph);
        let tau = self.tau.bind(graph);

        let (n, _, _, c) = graph.value(b).dim();
        let (p, q) = geometry.padded;
        let (r0, c0) = geometry.start;
        let (h, w) = geometry.image;
        let mut crop_mask = Array4::<f32>::zeros((1, p, q, c));
        crop_mask
            .slice_mut(s![.., r0..r0 + h, c0..c0 + w, ..])
            .fill(1.0);

        let b = graph.pad(b, geometry)?;
        let zeros = Array4::<f32>::zeros((n, p, q, c));
        let mut x = graph.constant(zeros.clone());
        let mut xi = graph.constant(zeros.clone());
        let mut eta_rows = graph.constant(zeros.clone());
        let mut eta_cols = graph.constant(zeros.clone());
        let mut rho = graph.constant(zeros);

        for k in 0..self.n_iter {
            let inv_mu2 = graph.recip(mu2[k]);
            let inv_mu3 = graph.recip(mu3[k]);

            // u: shrinkage of the image gradients
            let threshold = graph.mul(tau[k], inv_mu2)?;
            let (dx_rows, dx_cols) = differences(graph, x);
            let scaled = graph.scale(eta_rows, inv_mu2)?;
            let arg = graph.add(dx_rows, scaled)?;
            let u_rows = graph.soft_threshold(arg, threshold)?;
            let scaled = graph.scale(eta_cols, inv_mu2)?;
            let arg = graph.add(dx_cols, scaled)?;
            let u_cols = graph.soft_threshold(arg, threshold)?;

            // v: data fidelity on the sensor footprint
            let hx = graph.conv(x, kernel)?;
            let hx = graph.scale(hx, mu1[k])?;
            let num = graph.add(xi, hx)?;
            let num = graph.add(num, b)?;
            let v = graph.shifted_div(num, crop_mask.clone(), mu1[k])?;

            // w: non-negativity
            let scaled = graph.scale(rho, inv_mu3)?;
            let arg = graph.add(scaled, x)?;
            let w_split = graph.relu(arg);

            // x: exact solve in the Fourier domain
            let term = graph.scale(w_split, mu3[k])?;
            let mut rhs = graph.sub(term, rho)?;
            for (u, eta, axis) in [
                (u_rows, eta_rows, SpatialAxis::Rows),
                (u_cols, eta_cols, SpatialAxis::Cols),
            ] {
                let scaled = graph.scale(u, mu2[k])?;
                let diff = graph.sub(scaled, eta)?;
                let back = graph.diff_adjoint(diff, axis);
                rhs = graph.add(rhs, back)?;
            }
            let scaled = graph.scale(v, mu1[k])?;
            let diff = graph.sub(scaled, xi)?;
            let back = graph.corr(diff, kernel)?;
            rhs = graph.add(rhs, back)?;
            x = graph.solve(rhs, kernel, mu1[k], mu2[k], mu3[k])?;

            // dual ascent
            let hx = graph.conv(x, kernel)?;
            let r = graph.sub(hx, v)?;
            let r = graph.scale(r, mu1[k])?;
            xi = graph.add(xi, r)?;
            let (dx_rows, dx_cols) = differences(graph, x);
            let r = graph.sub(dx_rows, u_rows)?;
            let r = graph.scale(r, mu2[k])?;
            eta_rows = graph.add(eta_rows, r)?;
            let r = graph.sub(dx_cols, u_cols)?;
            let r = graph.scale(r, mu2[k])?;
            eta_cols = graph.add(eta_cols, r)?;
            let r = graph.sub(x, w_split)?;
            let r = graph.scale(r, mu3[k])?;
            rho = graph.add(rho, r)?;
        }
        let image = graph.crop(x, geometry)?;
        Ok(graph.relu(image))
    }

    pub(crate) fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        self.mu1.visit(visitor);
        self.mu2.visit(visitor);
        self.mu3.visit(visitor);
        self.tau.visit(visitor);
    }

    pub(crate) fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        self.mu1.visit_mut(visitor);
        self.mu2.visit_mut(visitor);
        self.mu3.visit_mut(visitor);
        self.tau.visit_mut(visitor);
    }
}
