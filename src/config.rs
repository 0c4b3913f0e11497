//! Configuration structures for the solvers, the unrolled networks and the trainer.
//!
//! Every structure deserializes from JSON with missing fields taken from its `Default`.
//! Identifiers (methods, optimizers, losses, ...) are closed enums; unknown tags are rejected
//! with a configuration error.

use crate::error::{LenslessError, Result};
use crate::operators::PenaltyKind;
use crate::recon::Acceleration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Implements `Display`, `FromStr` and the serde string conversions for an identifier enum.
macro_rules! string_identifier {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal $(| $alias:literal)*),+ $(,)? }) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $name),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = LenslessError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name $(| $alias)* => Ok($ty::$variant),)+
                    other => Err(LenslessError::Configuration(format!(
                        "unknown {} '{}', expected one of: {}",
                        $what,
                        other,
                        [$($name),+].join(", ")
                    ))),
                }
            }
        }

        impl TryFrom<String> for $ty {
            type Error = LenslessError;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.to_string()
            }
        }
    };
}

/// Parses any configuration structure from JSON text.
///
/// Malformed or unknown values are reported as [`LenslessError::Configuration`].
pub fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|err| match err.classify() {
        serde_json::error::Category::Data => LenslessError::Configuration(err.to_string()),
        _ => LenslessError::Json(err),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApgdConfig {
    pub max_iter: usize,
    /// Smooth penalty handled through its gradient.
    pub diff_penalty: Option<PenaltyKind>,
    /// Penalty handled through its proximal map.
    pub prox_penalty: Option<PenaltyKind>,
    pub acceleration: Acceleration,
    pub diff_lambda: f32,
    pub prox_lambda: f32,
    pub tol: Option<f32>,
    pub min_iter: usize,
}

impl Default for ApgdConfig {
    fn default() -> Self {
        ApgdConfig {
            max_iter: 500,
            diff_penalty: None,
            prox_penalty: Some(PenaltyKind::NonNegative),
            acceleration: Acceleration::BeckTeboulle,
            diff_lambda: 0.001,
            prox_lambda: 0.001,
            tol: Some(1e-4),
            min_iter: 10,
        }
    }
}

/// Residual balancing of the ADMM penalty parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyBalancing {
    pub mu_balance: f32,
    pub tau_incr: f32,
    pub tau_decr: f32,
}

impl Default for PenaltyBalancing {
    fn default() -> Self {
        PenaltyBalancing {
            mu_balance: 10.0,
            tau_incr: 2.0,
            tau_decr: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmmConfig {
    pub max_iter: usize,
    pub mu1: f32,
    pub mu2: f32,
    pub mu3: f32,
    pub tau: f32,
    pub balancing: Option<PenaltyBalancing>,
    pub tol: Option<f32>,
    pub min_iter: usize,
}

impl Default for AdmmConfig {
    fn default() -> Self {
        AdmmConfig {
            max_iter: 100,
            mu1: 1e-6,
            mu2: 1e-5,
            mu3: 4e-5,
            tau: 1e-4,
            balancing: None,
            tol: None,
            min_iter: 10,
        }
    }
}

/// Unrolled algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
    UnrolledFista,
    UnrolledAdmm,
    TrainableInversion,
}

string_identifier!(Method, "reconstruction method", {
    UnrolledFista => "unrolled_fista",
    UnrolledAdmm => "unrolled_admm",
    TrainableInversion => "trainable_inv",
});

/// Residual CNN used as pre- or post-processor, and its training schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Number of 3×3 convolution layers.
    pub depth: usize,
    pub hidden_channels: usize,
    pub seed: u64,
    /// Epoch at which the network is inserted; `None` inserts it at construction.
    pub delay: Option<usize>,
    /// Epoch at which the parameters stop receiving gradients.
    pub freeze: Option<usize>,
    /// Epoch at which frozen parameters are released again.
    pub unfreeze: Option<usize>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            depth: 3,
            hidden_channels: 8,
            seed: 0,
            delay: None,
            freeze: None,
            unfreeze: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnrolledConfig {
    pub method: Method,
    pub n_iter: usize,
    /// One set of coefficients reused by every iteration instead of one set per iteration.
    pub shared_parameters: bool,
    /// Unrolled FISTA: train the momentum coefficients too.
    pub learn_momentum: bool,
    pub mu1: f32,
    pub mu2: f32,
    pub mu3: f32,
    pub tau: f32,
    /// Initial regularizer of the trainable inversion.
    pub inversion_k: f32,
    pub skip_unrolled: bool,
    pub return_unrolled_output: bool,
    pub pre_process: Option<ProcessConfig>,
    pub post_process: Option<ProcessConfig>,
}

impl Default for UnrolledConfig {
    fn default() -> Self {
        UnrolledConfig {
            method: Method::UnrolledFista,
            n_iter: 5,
            shared_parameters: false,
            learn_momentum: true,
            mu1: 1e-4,
            mu2: 1e-4,
            mu3: 1e-4,
            tau: 2e-4,
            inversion_k: 1e-4,
            skip_unrolled: false,
            return_unrolled_output: false,
            pre_process: None,
            post_process: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

string_identifier!(OptimizerKind, "optimizer", {
    Adam => "Adam" | "adam",
    Sgd => "SGD" | "sgd",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    /// SGD momentum.
    pub momentum: f32,
    /// Learning-rate factor for the first epoch (square root of it for the second).
    pub slow_start: Option<f32>,
    /// Step decay period in epochs.
    pub step: Option<usize>,
    pub gamma: f32,
    /// Learning rate of the trainable mask; falls back to `lr`.
    pub mask_lr: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            kind: OptimizerKind::Adam,
            lr: 1e-4,
            momentum: 0.0,
            slow_start: None,
            step: None,
            gamma: 0.1,
            mask_lr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossKind {
    L1,
    L2,
}

string_identifier!(LossKind, "loss", {
    L1 => "l1",
    L2 => "l2",
});

/// Metric used to select the best model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKey {
    Loss,
    Mse,
    Mae,
    Psnr,
    Ssim,
    Perceptual,
}

string_identifier!(MetricKey, "metric", {
    Loss => "LOSS",
    Mse => "MSE",
    Mae => "MAE",
    Psnr => "PSNR",
    Ssim => "SSIM",
    Perceptual => "PERCEPTUAL",
});

impl MetricKey {
    pub fn higher_is_better(&self) -> bool {
        matches!(self, MetricKey::Psnr | MetricKey::Ssim)
    }
}

/// Region `[start, end)` of rows and columns compared by the loss and the metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub vertical: (usize, usize),
    pub horizontal: (usize, usize),
}

impl Crop {
    /// Checks that the window is non-empty and lies inside a `height × width` image.
    pub fn validate(&self, height: usize, width: usize) -> Result<()> {
        for (axis, (start, end), extent) in [
            ("vertical", self.vertical, height),
            ("horizontal", self.horizontal, width),
        ] {
            if start >= end || end > extent {
                return Err(LenslessError::Configuration(format!(
                    "{axis} crop {start}..{end} does not fit an extent of {extent}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MaskKind {
    Psf,
    Separable,
}

string_identifier!(MaskKind, "mask", {
    Psf => "psf",
    Separable => "separable",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub kind: MaskKind,
    pub seed: u64,
}

impl Default for MaskConfig {
    fn default() -> Self {
        MaskConfig {
            kind: MaskKind::Psf,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub seed: u64,
    pub loss: LossKind,
    pub perceptual_weight: Option<f32>,
    /// Weight of the L1 sparsity penalty on the mask parameters.
    pub mask_l1: Option<f32>,
    /// Weight of the loss on the output of the unrolled iterations before post-processing.
    pub unrolled_output_factor: Option<f32>,
    pub clip_grad: Option<f32>,
    pub skip_nan: bool,
    pub metric_for_best_model: Option<MetricKey>,
    pub save_every: Option<usize>,
    pub crop: Option<Crop>,
    pub optimizer: OptimizerConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 10,
            batch_size: 4,
            eval_batch_size: 4,
            seed: 0,
            loss: LossKind::L2,
            perceptual_weight: None,
            mask_l1: None,
            unrolled_output_factor: None,
            clip_grad: Some(1.0),
            skip_nan: false,
            metric_for_best_model: None,
            save_every: None,
            crop: None,
            optimizer: OptimizerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: TrainingConfig = from_json("{}").unwrap();
        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.clip_grad, Some(1.0));
        let apgd: ApgdConfig = from_json("{}").unwrap();
        assert_eq!(apgd.prox_penalty, Some(PenaltyKind::NonNegative));
    }

    #[test]
    fn test_partial_json() {
        let text = r#"{
            "method": "unrolled_admm",
            "n_iter": 10,
            "pre_process": { "depth": 2, "delay": 1 }
        }"#;
        let config: UnrolledConfig = from_json(text).unwrap();
        assert_eq!(config.method, Method::UnrolledAdmm);
        assert_eq!(config.n_iter, 10);
        let pre = config.pre_process.unwrap();
        assert_eq!(pre.depth, 2);
        assert_eq!(pre.delay, Some(1));
        assert_eq!(pre.hidden_channels, 8);
    }

    #[test]
    fn test_unknown_identifiers_are_configuration_errors() {
        assert!(matches!(
            from_json::<UnrolledConfig>(r#"{ "method": "unrolled_gd" }"#),
            Err(LenslessError::Configuration(_))
        ));
        assert!(matches!(
            from_json::<ApgdConfig>(r#"{ "acceleration": "nesterov" }"#),
            Err(LenslessError::Configuration(_))
        ));
        assert!(matches!(
            "RMSprop".parse::<OptimizerKind>(),
            Err(LenslessError::Configuration(_))
        ));
        assert!(matches!("huber".parse::<LossKind>(), Err(LenslessError::Configuration(_))));
    }

    #[test]
    fn test_identifier_roundtrip_names() {
        assert_eq!(Method::TrainableInversion.to_string(), "trainable_inv");
        assert_eq!("sgd".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("PSNR".parse::<MetricKey>().unwrap(), MetricKey::Psnr);
        assert!(MetricKey::Ssim.higher_is_better());
        assert!(!MetricKey::Mse.higher_is_better());
    }

    #[test]
    fn test_malformed_json_is_json_error() {
        assert!(matches!(
            from_json::<TrainingConfig>("{ not json"),
            Err(LenslessError::Json(_))
        ));
    }
}
