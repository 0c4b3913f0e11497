//! Regularization penalties: evaluation, gradients of the smooth ones and proximal maps.

use crate::error::{LenslessError, Result};
use crate::math_tools::soft_threshold;
use ndarray::{Array, ArrayBase, Data, Dimension};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Identifier of a penalty family, as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PenaltyKind {
    L1,
    L2,
    NonNegative,
}

impl Display for PenaltyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PenaltyKind::L1 => write!(f, "l1"),
            PenaltyKind::L2 => write!(f, "l2"),
            PenaltyKind::NonNegative => write!(f, "nonneg"),
        }
    }
}

impl FromStr for PenaltyKind {
    type Err = LenslessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Ok(PenaltyKind::L1),
            "l2" => Ok(PenaltyKind::L2),
            "nonneg" | "non_negative" => Ok(PenaltyKind::NonNegative),
            other => Err(LenslessError::Configuration(format!(
                "unknown penalty '{other}', expected one of l1, l2, nonneg"
            ))),
        }
    }
}

impl TryFrom<String> for PenaltyKind {
    type Error = LenslessError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PenaltyKind> for String {
    fn from(kind: PenaltyKind) -> Self {
        kind.to_string()
    }
}

/// A weighted regularizer `g(x)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Penalty {
    /// `weight · Σ|x|`
    L1 { weight: f32 },
    /// `weight · Σx²`
    L2 { weight: f32 },
    /// Indicator of the non-negative orthant.
    NonNegative,
}

impl Penalty {
    /// Builds a penalty of the given kind; the weight is ignored for `NonNegative`.
    pub fn new(kind: PenaltyKind, weight: f32) -> Result<Self> {
        if kind != PenaltyKind::NonNegative && (!weight.is_finite() || weight < 0.0) {
            return Err(LenslessError::Configuration(format!(
                "penalty weight must be finite and non-negative, got {weight}"
            )));
        }
        Ok(match kind {
            PenaltyKind::L1 => Penalty::L1 { weight },
            PenaltyKind::L2 => Penalty::L2 { weight },
            PenaltyKind::NonNegative => Penalty::NonNegative,
        })
    }

    pub fn kind(&self) -> PenaltyKind {
        match self {
            Penalty::L1 { .. } => PenaltyKind::L1,
            Penalty::L2 { .. } => PenaltyKind::L2,
            Penalty::NonNegative => PenaltyKind::NonNegative,
        }
    }

    pub fn is_smooth(&self) -> bool {
        matches!(self, Penalty::L2 { .. })
    }

    /// Lipschitz constant of the gradient (zero for non-smooth penalties).
    pub fn lipschitz(&self) -> f32 {
        match self {
            Penalty::L2 { weight } => 2.0 * weight,
            _ => 0.0,
        }
    }

    pub fn evaluate<S, D>(&self, x: &ArrayBase<S, D>) -> f32
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        match self {
            Penalty::L1 { weight } => weight * x.iter().map(|v| v.abs()).sum::<f32>(),
            Penalty::L2 { weight } => weight * x.iter().map(|v| v * v).sum::<f32>(),
            Penalty::NonNegative => {
                if x.iter().all(|&v| v >= 0.0) {
                    0.0
                } else {
                    f32::INFINITY
                }
            }
        }
    }

    /// Gradient of a smooth penalty.
    pub fn gradient<S, D>(&self, x: &ArrayBase<S, D>) -> Result<Array<f32, D>>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        match self {
            Penalty::L2 { weight } => Ok(x.mapv(|v| 2.0 * weight * v)),
            other => Err(LenslessError::Configuration(format!(
                "penalty '{}' is not differentiable",
                other.kind()
            ))),
        }
    }

    /// Proximal map `argmin_z step·g(z) + ½‖z − x‖²`.
    pub fn prox<S, D>(&self, x: &ArrayBase<S, D>, step: f32) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        match self {
            Penalty::L1 { weight } => {
                let t = weight * step;
                x.mapv(|v| soft_threshold(v, t))
            }
            Penalty::L2 { weight } => {
                let shrink = 1.0 / (1.0 + 2.0 * weight * step);
                x.mapv(|v| v * shrink)
            }
            Penalty::NonNegative => x.mapv(|v| v.max(0.0)),
        }
    }
}
