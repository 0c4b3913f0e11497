//! ADMM with total-variation and non-negativity priors on the padded canvas.
//!
//! Splits: `u = Ψx` (circular differences along rows and columns), `v = Hx` (circular
//! convolution) and `w = x` (non-negativity). The data term `½‖Cv − b‖²` only sees the crop `C`
//! of the canvas. The x-update is solved exactly in the Fourier domain.

use crate::config::{AdmmConfig, PenaltyBalancing};
use crate::error::{LenslessError, Result};
use crate::math_tools::{
    circular_diff, circular_diff_adjoint, difference_spectrum, norm_sq, soft_threshold,
};
use crate::operators::ConvolutionOperator;
use crate::recon::{
    check_measurement, relative_change, ReconstructionAlgorithm, SolverProgress, SolverState,
};
use ndarray::{s, Array2, Array3, Axis, Zip};

#[derive(Debug)]
pub struct Admm {
    operator: ConvolutionOperator,
    mu1: f32,
    mu2: f32,
    mu3: f32,
    initial_penalties: (f32, f32, f32),
    tau: f32,
    balancing: Option<PenaltyBalancing>,
    diff_spectrum: Array2<f32>,
    response_sq: Vec<Array2<f32>>,
    crop_mask: Array3<f32>,
    padded_measurement: Option<Array3<f32>>,
    measurement: Option<Array3<f32>>,
    x: Array3<f32>,
    u_rows: Array3<f32>,
    u_cols: Array3<f32>,
    v: Array3<f32>,
    w: Array3<f32>,
    xi: Array3<f32>,
    eta_rows: Array3<f32>,
    eta_cols: Array3<f32>,
    rho: Array3<f32>,
    progress: SolverProgress,
}

impl Admm {
    pub fn new(psf: &Array3<f32>, config: &AdmmConfig) -> Result<Self> {
        for (name, value) in [
            ("mu1", config.mu1),
            ("mu2", config.mu2),
            ("mu3", config.mu3),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(LenslessError::Configuration(format!(
                    "ADMM {name} must be positive, got {value}"
                )));
            }
        }
        if !(config.tau >= 0.0 && config.tau.is_finite()) {
            return Err(LenslessError::Configuration(format!(
                "ADMM tau must be non-negative, got {}",
                config.tau
            )));
        }
        let operator = ConvolutionOperator::new(psf)?;
        let (p, q) = operator.padded_shape();
        let channels = operator.shape().2;
        let response_sq = (0..channels)
            .map(|ch| operator.spectrum(ch).mapv(|h| h.norm_sqr()))
            .collect();
        let ones = Array3::<f32>::ones(operator.shape());
        let crop_mask = operator.geometry().pad(&ones);
        let zeros = Array3::<f32>::zeros((p, q, channels));

        Ok(Admm {
            mu1: config.mu1,
            mu2: config.mu2,
            mu3: config.mu3,
            initial_penalties: (config.mu1, config.mu2, config.mu3),
            tau: config.tau,
            balancing: config.balancing.clone(),
            diff_spectrum: difference_spectrum(p, q),
            response_sq,
            crop_mask,
            padded_measurement: None,
            measurement: None,
            x: zeros.clone(),
            u_rows: zeros.clone(),
            u_cols: zeros.clone(),
            v: zeros.clone(),
            w: zeros.clone(),
            xi: zeros.clone(),
            eta_rows: zeros.clone(),
            eta_cols: zeros.clone(),
            rho: zeros,
            progress: SolverProgress::new(config.min_iter, config.tol),
            operator,
        })
    }

    /// Current penalty parameters `(mu1, mu2, mu3)`.
    pub fn penalties(&self) -> (f32, f32, f32) {
        (self.mu1, self.mu2, self.mu3)
    }

    /// Clears the iterand and auxiliary variables and undoes any penalty rebalancing.
    fn zero_state(&mut self) {
        (self.mu1, self.mu2, self.mu3) = self.initial_penalties;
        for a in [
            &mut self.x,
            &mut self.u_rows,
            &mut self.u_cols,
            &mut self.v,
            &mut self.w,
            &mut self.xi,
            &mut self.eta_rows,
            &mut self.eta_cols,
            &mut self.rho,
        ] {
            a.fill(0.0);
        }
    }

    /// Solves `(mu1·HᵀH + mu2·ΨᵀΨ + mu3·I) x = rhs` per channel.
    fn solve(&self, rhs: &Array3<f32>) -> Result<Array3<f32>> {
        let fft = self.operator.fft();
        let mut out = Array3::zeros(rhs.raw_dim());
        for (ch, h_sq) in self.response_sq.iter().enumerate() {
            let mut spectrum = fft.forward(&rhs.index_axis(Axis(2), ch))?;
            Zip::from(&mut spectrum)
                .and(h_sq)
                .and(&self.diff_spectrum)
                .for_each(|s, &hh, &dd| *s /= self.mu1 * hh + self.mu2 * dd + self.mu3);
            out.index_axis_mut(Axis(2), ch)
                .assign(&fft.inverse(&spectrum)?);
        }
        Ok(out)
    }

    fn rebalance(mu: f32, primal: f32, dual: f32, balancing: &PenaltyBalancing) -> f32 {
        if primal > balancing.mu_balance * dual {
            mu * balancing.tau_incr
        } else if dual > balancing.mu_balance * primal {
            mu / balancing.tau_decr
        } else {
            mu
        }
    }
}

impl ReconstructionAlgorithm for Admm {
    fn name(&self) -> &'static str {
        "ADMM"
    }

    fn progress(&self) -> &SolverProgress {
        &self.progress
    }

    fn progress_mut(&mut self) -> &mut SolverProgress {
        &mut self.progress
    }

    fn set_data(&mut self, measurement: &Array3<f32>) -> Result<()> {
        check_measurement(self.name(), self.operator.shape(), measurement)?;
        self.padded_measurement = Some(self.operator.geometry().pad(measurement));
        self.measurement = Some(measurement.clone());
        self.zero_state();
        self.progress.data_set();
        Ok(())
    }

    fn reset(&mut self) {
        self.zero_state();
        self.progress.reset();
    }

    fn step(&mut self) -> Result<SolverState> {
        self.progress.require_data(self.name())?;
        let b = self
            .padded_measurement
            .as_ref()
            .ok_or_else(|| LenslessError::Usage("ADMM: no measurement bound".to_string()))?;
        let (mu1, mu2, mu3, tau) = (self.mu1, self.mu2, self.mu3, self.tau);

        // u: shrinkage of the image gradients
        let threshold = tau / mu2;
        let u_rows = (circular_diff(&self.x, Axis(0)) + &self.eta_rows / mu2)
            .mapv(|v| soft_threshold(v, threshold));
        let u_cols = (circular_diff(&self.x, Axis(1)) + &self.eta_cols / mu2)
            .mapv(|v| soft_threshold(v, threshold));

        // v: data fidelity on the sensor footprint
        let hx = self.operator.convolve_padded(&self.x)?;
        let mut v = &self.xi + &(hx * mu1) + b;
        Zip::from(&mut v)
            .and(&self.crop_mask)
            .for_each(|v, &m| *v /= m + mu1);

        // w: non-negativity
        let w = (&self.rho / mu3 + &self.x).mapv(|v| v.max(0.0));

        let mut rhs = &w * mu3 - &self.rho;
        rhs += &circular_diff_adjoint(&(&u_rows * mu2 - &self.eta_rows), Axis(0));
        rhs += &circular_diff_adjoint(&(&u_cols * mu2 - &self.eta_cols), Axis(1));
        rhs += &self.operator.correlate_padded(&(&v * mu1 - &self.xi))?;
        let x = self.solve(&rhs)?;

        // dual ascent
        let hx = self.operator.convolve_padded(&x)?;
        let dx_rows = circular_diff(&x, Axis(0));
        let dx_cols = circular_diff(&x, Axis(1));
        let primal_h = &hx - &v;
        let primal_rows = &dx_rows - &u_rows;
        let primal_cols = &dx_cols - &u_cols;
        let primal_w = &x - &w;
        self.xi += &(&primal_h * mu1);
        self.eta_rows += &(&primal_rows * mu2);
        self.eta_cols += &(&primal_cols * mu2);
        self.rho += &(&primal_w * mu3);

        if let Some(balancing) = &self.balancing {
            let r1 = norm_sq(&primal_h).sqrt();
            let s1 = mu1 * norm_sq(&(&v - &self.v)).sqrt();
            let r2 = (norm_sq(&primal_rows) + norm_sq(&primal_cols)).sqrt();
            let s2 = mu2 * (norm_sq(&(&u_rows - &self.u_rows)) + norm_sq(&(&u_cols - &self.u_cols))).sqrt();
            let r3 = norm_sq(&primal_w).sqrt();
            let s3 = mu3 * norm_sq(&(&w - &self.w)).sqrt();
            self.mu1 = Self::rebalance(mu1, r1, s1, balancing);
            self.mu2 = Self::rebalance(mu2, r2, s2, balancing);
            self.mu3 = Self::rebalance(mu3, r3, s3, balancing);
        }

        let change = relative_change(&x, &self.x);
        self.x = x;
        self.u_rows = u_rows;
        self.u_cols = u_cols;
        self.v = v;
        self.w = w;
        Ok(self.progress.advance(change))
    }

    fn image_estimate(&self) -> Result<Array3<f32>> {
        self.progress.require_data(self.name())?;
        Ok(self.operator.geometry().crop(&self.x).mapv(|v| v.max(0.0)))
    }

    fn cost(&mut self) -> Result<f32> {
        self.progress.require_data(self.name())?;
        let b = self
            .measurement
            .as_ref()
            .ok_or_else(|| LenslessError::Usage("ADMM: no measurement bound".to_string()))?;
        let (r0, c0) = self.operator.start_index();
        let (h, w, _) = self.operator.shape();
        let hx = self.operator.convolve_padded(&self.x)?;
        let residual = &hx.slice(s![r0..r0 + h, c0..c0 + w, ..]) - b;
        let tv = circular_diff(&self.x, Axis(0)).mapv(f32::abs).sum()
            + circular_diff(&self.x, Axis(1)).mapv(f32::abs).sum();
        Ok(0.5 * norm_sq(&residual) + self.tau * tv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::gaussian_psf;
    use crate::recon::ApplyOptions;

    fn blurred_problem() -> (Array3<f32>, Array3<f32>, Array3<f32>) {
        let psf = gaussian_psf(16, 16, 1, 2.0);
        let img = Array3::from_shape_fn((16, 16, 1), |(i, j, _)| {
            if (4..12).contains(&i) && (5..11).contains(&j) {
                1.0
            } else {
                0.1
            }
        });
        let mut op = ConvolutionOperator::new(&psf).unwrap();
        let measurement = op.apply_image(&img).unwrap();
        (psf, img, measurement)
    }

    fn config() -> AdmmConfig {
        AdmmConfig {
            mu1: 1.0,
            mu2: 0.01,
            mu3: 0.1,
            tau: 1e-4,
            ..Default::default()
        }
    }

    fn data_residual(psf: &Array3<f32>, image: &Array3<f32>, measurement: &Array3<f32>) -> f32 {
        let mut op = ConvolutionOperator::new(psf).unwrap();
        norm_sq(&(op.apply_image(image).unwrap() - measurement)).sqrt()
    }

    #[test]
    fn test_step_before_set_data_is_usage_error() {
        let (psf, _, _) = blurred_problem();
        let mut solver = Admm::new(&psf, &config()).unwrap();
        assert!(matches!(solver.step(), Err(LenslessError::Usage(_))));
    }

    #[test]
    fn test_invalid_penalty_rejected() {
        let (psf, _, _) = blurred_problem();
        let bad = AdmmConfig {
            mu1: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            Admm::new(&psf, &bad),
            Err(LenslessError::Configuration(_))
        ));
    }

    #[test]
    fn test_reduces_data_residual() {
        let (psf, _, measurement) = blurred_problem();
        let mut solver = Admm::new(&psf, &config()).unwrap();
        solver.set_data(&measurement).unwrap();
        let result = solver
            .apply(&ApplyOptions {
                n_iter: 60,
                disp_iter: None,
                save_intermediate: false,
            })
            .unwrap();
        assert_eq!(result.image.dim(), (16, 16, 1));
        assert!(result.image.iter().all(|&v| v >= 0.0 && v.is_finite()));
        let start = norm_sq(&measurement).sqrt();
        let end = data_residual(&psf, &result.image, &measurement);
        assert!(end < 0.5 * start, "residual {end} vs {start}");
    }

    #[test]
    fn test_balancing_keeps_iterates_finite() {
        let (psf, _, measurement) = blurred_problem();
        let config = AdmmConfig {
            balancing: Some(PenaltyBalancing::default()),
            ..config()
        };
        let mut solver = Admm::new(&psf, &config).unwrap();
        solver.set_data(&measurement).unwrap();
        for _ in 0..20 {
            solver.step().unwrap();
        }
        let (mu1, mu2, mu3) = solver.penalties();
        assert!(mu1 > 0.0 && mu2 > 0.0 && mu3 > 0.0);
        assert!(solver.cost().unwrap().is_finite());
        assert!(solver.image_estimate().unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_reset_returns_to_data_set() {
        let (psf, _, measurement) = blurred_problem();
        let mut solver = Admm::new(&psf, &config()).unwrap();
        solver.set_data(&measurement).unwrap();
        solver.step().unwrap();
        let first = solver.image_estimate().unwrap();
        solver.step().unwrap();
        solver.reset();
        assert_eq!(solver.state(), SolverState::DataSet);
        solver.step().unwrap();
        assert_eq!(solver.image_estimate().unwrap(), first);
    }

    #[test]
    fn test_reset_with_balancing_matches_fresh_solver() {
        let (psf, _, measurement) = blurred_problem();
        let config = AdmmConfig {
            balancing: Some(PenaltyBalancing::default()),
            ..config()
        };
        let options = ApplyOptions {
            n_iter: 10,
            disp_iter: None,
            save_intermediate: false,
        };

        let mut solver = Admm::new(&psf, &config).unwrap();
        solver.set_data(&measurement).unwrap();
        solver.apply(&options).unwrap();
        let rebalanced = solver.penalties();
        solver.reset();
        assert_eq!(solver.penalties(), (1.0, 0.01, 0.1));
        let again = solver.apply(&options).unwrap();
        assert_eq!(solver.penalties(), rebalanced);

        let mut fresh = Admm::new(&psf, &config).unwrap();
        fresh.set_data(&measurement).unwrap();
        let expected = fresh.apply(&options).unwrap();
        assert_eq!(again.image, expected.image);

        solver.set_data(&measurement).unwrap();
        assert_eq!(solver.penalties(), (1.0, 0.01, 0.1));
    }
}
