//! # lensless
//!
//! Image reconstruction for lensless cameras. A measurement is modelled as the sensor-sized
//! crop of the scene convolved with the camera's point-spread function (PSF); the crate
//! inverts that model.
//!
//! - [`operators`]: the FFT convolution operator and the regularizers.
//! - [`recon`]: iterative solvers (accelerated proximal gradient descent, ADMM) and the
//!   closed-form Tikhonov solver for separable masks with Bayer sensors.
//! - [`graph`], [`nn`], [`unrolled`]: a small reverse-mode graph and the unrolled networks
//!   built on it, with learnable per-iteration coefficients and residual CNN processors.
//! - [`mask`]: trainable masks whose PSF is learned jointly with the solver.
//! - [`train`]: losses, optimizers, metrics, checkpoints and the [`train::Trainer`].
//! - [`config`]: JSON-loadable configuration of all of the above.
//!
//! ## Example
//!
//! ```
//! use lensless::config::ApgdConfig;
//! use lensless::psf::delta_psf;
//! use lensless::recon::{Apgd, ApplyOptions, ReconstructionAlgorithm};
//! use ndarray::Array3;
//!
//! let psf = delta_psf(16, 16, 1);
//! let measurement = Array3::from_elem((16, 16, 1), 0.5f32);
//! let mut solver = Apgd::new(&psf, &ApgdConfig::default()).unwrap();
//! solver.set_data(&measurement).unwrap();
//! let result = solver.apply(&ApplyOptions::iterations(20)).unwrap();
//! assert_eq!(result.image.dim(), (16, 16, 1));
//! ```

pub mod config;
pub mod error;
pub mod fft;
pub mod graph;
pub mod mask;
pub mod math_tools;
pub mod nn;
pub mod operators;
pub mod psf;
pub mod recon;
pub mod train;
pub mod unrolled;

pub use error::{LenslessError, Result};
