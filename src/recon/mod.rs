//! Iterative and closed-form reconstruction algorithms.
//!
//! Iterative solvers share the [`ReconstructionAlgorithm`] state machine:
//! `Uninitialized → DataSet → Iterating → (Converged | MaxIterReached)`, and `reset` returns to
//! `DataSet` with the bound measurement and operator kept.

pub mod admm;
pub mod apgd;
pub mod tikhonov;

use crate::error::{LenslessError, Result};
use ndarray::Array3;
use std::fmt::{Display, Formatter};

pub use admm::Admm;
pub use apgd::{Acceleration, Apgd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    Uninitialized,
    DataSet,
    Iterating,
    Converged,
    MaxIterReached,
}

impl Display for SolverState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverState::Uninitialized => write!(f, "uninitialized"),
            SolverState::DataSet => write!(f, "data set"),
            SolverState::Iterating => write!(f, "iterating"),
            SolverState::Converged => write!(f, "converged"),
            SolverState::MaxIterReached => write!(f, "max. iterations reached"),
        }
    }
}

/// Iteration bookkeeping shared by the iterative solvers.
#[derive(Debug, Clone)]
pub struct SolverProgress {
    state: SolverState,
    iteration: usize,
    min_iter: usize,
    tol: Option<f32>,
}

impl SolverProgress {
    /// # Arguments
    /// - `min_iter`: Iterations to run before the convergence test may fire.
    /// - `tol`: Relative iterand change below which the solver is converged; `None` disables the test.
    pub fn new(min_iter: usize, tol: Option<f32>) -> Self {
        SolverProgress {
            state: SolverState::Uninitialized,
            iteration: 0,
            min_iter,
            tol,
        }
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn require_data(&self, solver: &str) -> Result<()> {
        if self.state == SolverState::Uninitialized {
            return Err(LenslessError::Usage(format!(
                "{solver}: set_data must be called before iterating"
            )));
        }
        Ok(())
    }

    pub(crate) fn data_set(&mut self) {
        self.state = SolverState::DataSet;
        self.iteration = 0;
    }

    pub(crate) fn reset(&mut self) {
        if self.state != SolverState::Uninitialized {
            self.data_set();
        }
    }

    /// Records one finished iteration and runs the convergence test.
    pub(crate) fn advance(&mut self, relative_change: f32) -> SolverState {
        self.iteration += 1;
        let converged = self
            .tol
            .map(|tol| self.iteration >= self.min_iter && relative_change < tol)
            .unwrap_or(false);
        self.state = if converged {
            SolverState::Converged
        } else {
            SolverState::Iterating
        };
        self.state
    }

    pub(crate) fn finish(&mut self) -> SolverState {
        if self.state != SolverState::Converged {
            self.state = SolverState::MaxIterReached;
        }
        self.state
    }
}

/// Options for [`ReconstructionAlgorithm::apply`].
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub n_iter: usize,
    /// Log progress (and store intermediates if requested) every `disp_iter` iterations.
    pub disp_iter: Option<usize>,
    pub save_intermediate: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            n_iter: 100,
            disp_iter: Some(50),
            save_intermediate: false,
        }
    }
}

impl ApplyOptions {
    pub fn iterations(n_iter: usize) -> Self {
        ApplyOptions {
            n_iter,
            ..Default::default()
        }
    }
}

/// Result of [`ReconstructionAlgorithm::apply`].
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Final estimate in the PSF's `H × W × C` shape, clipped to be non-negative.
    pub image: Array3<f32>,
    pub iterations: usize,
    pub state: SolverState,
    /// `(iteration, image)` snapshots, only when `save_intermediate` was set.
    pub intermediates: Vec<(usize, Array3<f32>)>,
}

pub trait ReconstructionAlgorithm {
    fn name(&self) -> &'static str;

    fn progress(&self) -> &SolverProgress;

    fn progress_mut(&mut self) -> &mut SolverProgress;

    /// Binds a measurement with the operator's shape and zeroes the iterand.
    fn set_data(&mut self, measurement: &Array3<f32>) -> Result<()>;

    /// Zeroes the iterand and auxiliary variables; the bound data and operator are kept.
    fn reset(&mut self);

    /// Performs exactly one iteration and returns the new state.
    fn step(&mut self) -> Result<SolverState>;

    /// Current image estimate, clipped to be non-negative.
    fn image_estimate(&self) -> Result<Array3<f32>>;

    /// Objective value at the current iterand.
    fn cost(&mut self) -> Result<f32>;

    fn state(&self) -> SolverState {
        self.progress().state()
    }

    /// Runs up to `options.n_iter` iterations, stopping early on convergence.
    fn apply(&mut self, options: &ApplyOptions) -> Result<Reconstruction> {
        self.progress().require_data(self.name())?;
        let mut intermediates = Vec::new();
        let mut state = self.state();
        for _ in 0..options.n_iter {
            state = self.step()?;
            let done = self.progress().iteration();
            if let Some(every) = options.disp_iter.filter(|&e| e > 0) {
                if done % every == 0 {
                    if log::log_enabled!(log::Level::Info) {
                        let cost = self.cost()?;
                        log::info!("{}: iteration {}, cost {:.6e}", self.name(), done, cost);
                    }
                    if options.save_intermediate {
                        intermediates.push((done, self.image_estimate()?));
                    }
                }
            }
            if state == SolverState::Converged {
                log::info!("{}: converged after {} iterations", self.name(), done);
                break;
            }
        }
        if state != SolverState::Converged {
            state = self.progress_mut().finish();
        }
        Ok(Reconstruction {
            image: self.image_estimate()?,
            iterations: self.progress().iteration(),
            state,
            intermediates,
        })
    }
}

pub(crate) fn check_measurement(
    solver: &str,
    expected: (usize, usize, usize),
    measurement: &Array3<f32>,
) -> Result<()> {
    if measurement.dim() != expected {
        return Err(LenslessError::shape(
            &format!("{solver} measurement"),
            &[expected.0, expected.1, expected.2],
            measurement.shape(),
        ));
    }
    Ok(())
}

pub(crate) fn relative_change(new: &Array3<f32>, old: &Array3<f32>) -> f32 {
    let diff = crate::math_tools::norm_sq(&(new - old)).sqrt();
    let base = crate::math_tools::norm_sq(old).sqrt();
    if base > 0.0 {
        diff / base
    } else if diff > 0.0 {
        f32::INFINITY
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_requires_data() {
        let progress = SolverProgress::new(1, None);
        assert!(matches!(
            progress.require_data("apgd"),
            Err(LenslessError::Usage(_))
        ));
    }

    #[test]
    fn test_progress_convergence() {
        let mut progress = SolverProgress::new(2, Some(1e-3));
        progress.data_set();
        assert_eq!(progress.advance(0.0), SolverState::Iterating);
        assert_eq!(progress.advance(1e-4), SolverState::Converged);
        progress.reset();
        assert_eq!(progress.state(), SolverState::DataSet);
        assert_eq!(progress.iteration(), 0);
        assert_eq!(progress.finish(), SolverState::MaxIterReached);
    }
}
