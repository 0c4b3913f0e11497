//! Point-spread-function helpers: validation of measured PSFs and synthetic PSFs for
//! simulation, tests and mask initialization.

use crate::error::{LenslessError, Result};
use ndarray::{Array1, Array3, Axis};

/// Checks that a PSF is a non-empty, finite, non-negative `H × W × C` array.
pub fn validate_psf(psf: &Array3<f32>) -> Result<()> {
    let (h, w, c) = psf.dim();
    if h == 0 || w == 0 || c == 0 {
        return Err(LenslessError::Configuration(format!(
            "PSF must not be empty, got shape {:?}",
            psf.shape()
        )));
    }
    if psf.iter().any(|v| !v.is_finite()) {
        return Err(LenslessError::Configuration(
            "PSF contains non-finite values".to_string(),
        ));
    }
    if psf.iter().any(|&v| v < 0.0) {
        return Err(LenslessError::Configuration(
            "PSF contains negative values".to_string(),
        ));
    }
    Ok(())
}

/// A single bright pixel at the centre `(h / 2, w / 2)` of every channel.
pub fn delta_psf(h: usize, w: usize, c: usize) -> Array3<f32> {
    let mut psf = Array3::zeros((h, w, c));
    psf.slice_mut(ndarray::s![h / 2, w / 2, ..]).fill(1.0);
    psf
}

/// Computes a Gaussian function with a different normalization for the given input data and parameters.
///
/// # Arguments
/// - `x` (*&Array1<f32>*): The input data.
/// - `params` (*&[f32]*): The parameters of the Gaussian function:
///   - `params[0]` (*f32*): The center of the Gaussian.
///   - `params[1]` (*f32*): The width of the Gaussian.
///
/// # Returns
/// - (*Array1<f32>*): The computed Gaussian values for the input data.
pub fn gaussian(x: &Array1<f32>, params: &[f32]) -> Array1<f32> {
    let x0 = params[0];
    let w = params[1];
    x.mapv(|xi| {
        (2.0 / std::f32::consts::PI).sqrt() * (-2.0 * (xi - x0).powf(2.0) / (w * w)).exp() / w
    })
}

/// Separable Gaussian blur kernel centred on `(h / 2, w / 2)`, normalized to unit sum per channel.
///
/// # Arguments
/// - `h`, `w`, `c`: PSF shape.
/// - `width`: Gaussian width in pixels (same convention as [`gaussian`]).
pub fn gaussian_psf(h: usize, w: usize, c: usize, width: f32) -> Array3<f32> {
    let rows = Array1::from_iter((0..h).map(|i| i as f32));
    let cols = Array1::from_iter((0..w).map(|j| j as f32));
    let gy = gaussian(&rows, &[(h / 2) as f32, width]);
    let gx = gaussian(&cols, &[(w / 2) as f32, width]);
    let mut psf = Array3::from_shape_fn((h, w, c), |(i, j, _)| gy[i] * gx[j]);
    normalize_psf(&mut psf);
    psf
}

/// Scales each channel of `psf` to unit sum. Channels that sum to zero are left alone.
pub fn normalize_psf(psf: &mut Array3<f32>) {
    for mut channel in psf.axis_iter_mut(Axis(2)) {
        let total = channel.sum();
        if total > 0.0 {
            channel.mapv_inplace(|v| v / total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_delta_psf_is_centered() {
        let psf = delta_psf(5, 4, 2);
        assert_eq!(psf[[2, 2, 0]], 1.0);
        assert_eq!(psf[[2, 2, 1]], 1.0);
        assert_eq!(psf.sum(), 2.0);
    }

    #[test]
    fn test_gaussian_psf_normalized() {
        let psf = gaussian_psf(9, 9, 3, 2.0);
        for channel in psf.axis_iter(Axis(2)) {
            assert_relative_eq!(channel.sum(), 1.0, epsilon = 1e-5);
        }
        assert!(psf[[4, 4, 0]] > psf[[0, 0, 0]]);
    }

    #[test]
    fn test_validate_rejects_negative() {
        let mut psf = delta_psf(3, 3, 1);
        psf[[0, 0, 0]] = -1.0;
        assert!(matches!(
            validate_psf(&psf),
            Err(LenslessError::Configuration(_))
        ));
        assert!(validate_psf(&delta_psf(3, 3, 1)).is_ok());
    }
}
