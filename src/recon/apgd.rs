//! Accelerated proximal gradient descent for
//! `min_x ½‖Ax − b‖² + λ_d·d(x) + λ_p·g(x)` with a smooth `d` and a proximable `g`.

use crate::config::ApgdConfig;
use crate::error::{LenslessError, Result};
use crate::math_tools::norm_sq;
use crate::operators::{ConvolutionOperator, Penalty};
use crate::recon::{
    check_measurement, relative_change, ReconstructionAlgorithm, SolverProgress, SolverState,
};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Chambolle–Dossal momentum parameter.
const CD_D: f32 = 75.0;

/// Momentum schedule of the accelerated proximal gradient method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Acceleration {
    /// Plain proximal gradient descent.
    None,
    /// Beck–Teboulle (FISTA) sequence.
    #[default]
    BeckTeboulle,
    /// Chambolle–Dossal sequence, which also guarantees convergence of the iterates.
    ChambolleDossal,
}

impl Display for Acceleration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Acceleration::None => write!(f, "none"),
            Acceleration::BeckTeboulle => write!(f, "BT"),
            Acceleration::ChambolleDossal => write!(f, "CD"),
        }
    }
}

impl FromStr for Acceleration {
    type Err = LenslessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "None" => Ok(Acceleration::None),
            "BT" | "bt" => Ok(Acceleration::BeckTeboulle),
            "CD" | "cd" => Ok(Acceleration::ChambolleDossal),
            other => Err(LenslessError::Configuration(format!(
                "unknown acceleration '{other}', expected none, BT or CD"
            ))),
        }
    }
}

impl TryFrom<String> for Acceleration {
    type Error = LenslessError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Acceleration> for String {
    fn from(acceleration: Acceleration) -> Self {
        acceleration.to_string()
    }
}

/// Accelerated proximal gradient descent solver.
#[derive(Debug)]
pub struct Apgd {
    operator: ConvolutionOperator,
    diff_penalty: Option<Penalty>,
    prox_penalty: Option<Penalty>,
    acceleration: Acceleration,
    step_size: f32,
    measurement: Option<Array3<f32>>,
    x: Array3<f32>,
    y: Array3<f32>,
    t: f32,
    progress: SolverProgress,
}

impl Apgd {
    /// Creates the solver for a PSF.
    ///
    /// # Arguments
    /// - `psf`: `H × W × C` point-spread function.
    /// - `config`: Penalties, weights, acceleration and convergence settings.
    ///
    /// # Returns
    /// The solver in the `Uninitialized` state, or a configuration error if the differentiable
    /// penalty is not smooth or the operator has a zero Lipschitz constant.
    pub fn new(psf: &Array3<f32>, config: &ApgdConfig) -> Result<Self> {
        let operator = ConvolutionOperator::new(psf)?;
        let diff_penalty = config
            .diff_penalty
            .map(|kind| Penalty::new(kind, config.diff_lambda))
            .transpose()?;
        if let Some(p) = diff_penalty.filter(|p| !p.is_smooth()) {
            return Err(LenslessError::Configuration(format!(
                "differentiable penalty must be smooth, got '{}'",
                p.kind()
            )));
        }
        let prox_penalty = config
            .prox_penalty
            .map(|kind| Penalty::new(kind, config.prox_lambda))
            .transpose()?;

        let lipschitz =
            operator.lipschitz() + diff_penalty.map(|p| p.lipschitz()).unwrap_or(0.0);
        if !(lipschitz > 0.0 && lipschitz.is_finite()) {
            return Err(LenslessError::Configuration(format!(
                "invalid Lipschitz constant {lipschitz}; is the PSF all zeros?"
            )));
        }
        let shape = operator.shape();
        log::debug!(
            "APGD: step size {:.4e}, acceleration {}",
            1.0 / lipschitz,
            config.acceleration
        );
        Ok(Apgd {
            operator,
            diff_penalty,
            prox_penalty,
            acceleration: config.acceleration,
            step_size: 1.0 / lipschitz,
            measurement: None,
            x: Array3::zeros(shape),
            y: Array3::zeros(shape),
            t: 1.0,
            progress: SolverProgress::new(config.min_iter, config.tol),
        })
    }

    pub fn step_size(&self) -> f32 {
        self.step_size
    }

    pub fn acceleration(&self) -> Acceleration {
        self.acceleration
    }

    /// Next value of the momentum sequence and the extrapolation weight.
    fn momentum(&self) -> (f32, f32) {
        match self.acceleration {
            Acceleration::None => (1.0, 0.0),
            Acceleration::BeckTeboulle => {
                let t_next = (1.0 + (1.0 + 4.0 * self.t * self.t).sqrt()) / 2.0;
                (t_next, (self.t - 1.0) / t_next)
            }
            Acceleration::ChambolleDossal => {
                let k = self.progress.iteration() as f32 + 1.0;
                let t_next = (k + CD_D) / CD_D;
                (t_next, (self.t - 1.0) / t_next)
            }
        }
    }
}

impl ReconstructionAlgorithm for Apgd {
    fn name(&self) -> &'static str {
        "APGD"
    }

    fn progress(&self) -> &SolverProgress {
        &self.progress
    }

    fn progress_mut(&mut self) -> &mut SolverProgress {
        &mut self.progress
    }

    fn set_data(&mut self, measurement: &Array3<f32>) -> Result<()> {
        check_measurement(self.name(), self.operator.shape(), measurement)?;
        self.measurement = Some(measurement.clone());
        self.x.fill(0.0);
        self.y.fill(0.0);
        self.t = 1.0;
        self.progress.data_set();
        Ok(())
    }

    fn reset(&mut self) {
        self.x.fill(0.0);
        self.y.fill(0.0);
        self.t = 1.0;
        self.progress.reset();
    }

    fn step(&mut self) -> Result<SolverState> {
        self.progress.require_data(self.name())?;
        let b = self
            .measurement
            .as_ref()
            .ok_or_else(|| LenslessError::Usage("APGD: no measurement bound".to_string()))?;

        let residual = self.operator.apply_image(&self.y)? - b;
        let mut grad = self.operator.adjoint_image(&residual)?;
        if let Some(penalty) = &self.diff_penalty {
            grad += &penalty.gradient(&self.y)?;
        }
        let z = &self.y - &(grad * self.step_size);
        let x_new = match &self.prox_penalty {
            Some(penalty) => penalty.prox(&z, self.step_size),
            None => z,
        };

        let (t_next, a) = self.momentum();
        self.y = &x_new + &((&x_new - &self.x) * a);
        let change = relative_change(&x_new, &self.x);
        self.x = x_new;
        self.t = t_next;
        Ok(self.progress.advance(change))
    }

    fn image_estimate(&self) -> Result<Array3<f32>> {
        self.progress.require_data(self.name())?;
        Ok(self.x.mapv(|v| v.max(0.0)))
    }

    fn cost(&mut self) -> Result<f32> {
        self.progress.require_data(self.name())?;
        let b = self
            .measurement
            .as_ref()
            .ok_or_else(|| LenslessError::Usage("APGD: no measurement bound".to_string()))?;
        let residual = self.operator.apply_image(&self.x)? - b;
        let mut cost = 0.5 * norm_sq(&residual);
        for penalty in self.diff_penalty.iter().chain(self.prox_penalty.iter()) {
            cost += penalty.evaluate(&self.x);
        }
        Ok(cost)
    }
}
