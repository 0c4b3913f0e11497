//! Training losses as `(value, gradient w.r.t. the prediction)` pairs.

use crate::config::LossKind;
use crate::error::{LenslessError, Result};
use crate::graph::Tensor;
use crate::math_tools::{circular_diff, circular_diff_adjoint, norm_sq};
use ndarray::{Axis, Zip};

fn check_shapes(prediction: &Tensor, target: &Tensor) -> Result<()> {
    if prediction.shape() != target.shape() {
        return Err(LenslessError::shape(
            "loss target",
            prediction.shape(),
            target.shape(),
        ));
    }
    if prediction.is_empty() {
        return Err(LenslessError::Usage("loss of an empty batch".to_string()));
    }
    Ok(())
}

/// Mean squared (`l2`) or mean absolute (`l1`) error.
///
/// # Returns
/// The loss value and its gradient with respect to `prediction`.
pub fn pixel_loss(kind: LossKind, prediction: &Tensor, target: &Tensor) -> Result<(f32, Tensor)> {
    check_shapes(prediction, target)?;
    let n = prediction.len() as f32;
    let residual = prediction - target;
    Ok(match kind {
        LossKind::L2 => (norm_sq(&residual) / n, residual.mapv(|r| 2.0 * r / n)),
        LossKind::L1 => {
            let value = residual.iter().map(|r| r.abs() as f64).sum::<f64>() as f32 / n;
            (value, residual.mapv(|r| if r == 0.0 { 0.0 } else { r.signum() / n }))
        }
    })
}

/// Perceptual similarity term added to the pixel loss and reported as an evaluation metric.
pub trait PerceptualLoss: Send + Sync {
    /// Metric name in the metrics record.
    fn name(&self) -> &str;

    fn evaluate(&self, prediction: &Tensor, target: &Tensor) -> Result<(f32, Tensor)>;
}

/// Mean squared difference of the image gradients (edge similarity).
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientSimilarity;

impl PerceptualLoss for GradientSimilarity {
    fn name(&self) -> &str {
        "GRADIENT_SIMILARITY"
    }

    fn evaluate(&self, prediction: &Tensor, target: &Tensor) -> Result<(f32, Tensor)> {
        check_shapes(prediction, target)?;
        let n = prediction.len() as f32;
        let residual = prediction - target;
        let mut value = 0.0;
        let mut grad = Tensor::zeros(residual.raw_dim());
        for axis in [Axis(1), Axis(2)] {
            let d = circular_diff(&residual, axis);
            value += norm_sq(&d) / n;
            let back = circular_diff_adjoint(&d, axis);
            Zip::from(&mut grad)
                .and(&back)
                .for_each(|g, &b| *g += 2.0 * b / n);
        }
        Ok((value, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array4;

    #[test]
    fn test_l2_and_l1_values() {
        let p = Array4::from_shape_vec((1, 1, 2, 1), vec![1.0, 3.0]).unwrap();
        let t = Array4::from_shape_vec((1, 1, 2, 1), vec![0.0, 1.0]).unwrap();
        let (l2, g2) = pixel_loss(LossKind::L2, &p, &t).unwrap();
        assert_relative_eq!(l2, 2.5);
        assert_relative_eq!(g2[[0, 0, 1, 0]], 2.0);
        let (l1, g1) = pixel_loss(LossKind::L1, &p, &t).unwrap();
        assert_relative_eq!(l1, 1.5);
        assert_relative_eq!(g1[[0, 0, 0, 0]], 0.5);
    }

    #[test]
    fn test_gradient_similarity_ignores_constant_offset() {
        let t = Array4::from_shape_fn((1, 4, 4, 1), |(_, i, j, _)| (i * j) as f32);
        let p = &t + 0.5;
        let (value, grad) = GradientSimilarity.evaluate(&p, &t).unwrap();
        assert_relative_eq!(value, 0.0);
        assert!(grad.iter().all(|&g| g.abs() < 1e-6));
    }

    #[test]
    fn test_gradient_similarity_gradient_matches_difference() {
        let t = Array4::zeros((1, 3, 3, 1));
        let mut p = Array4::zeros((1, 3, 3, 1));
        p[[0, 1, 1, 0]] = 1.0;
        let (value, grad) = GradientSimilarity.evaluate(&p, &t).unwrap();
        let step = 1e-2;
        let mut shifted = p.clone();
        shifted[[0, 1, 1, 0]] += step;
        let (value_shifted, _) = GradientSimilarity.evaluate(&shifted, &t).unwrap();
        let numeric = (value_shifted - value) / step;
        assert_relative_eq!(numeric, grad[[0, 1, 1, 0]], max_relative = 2e-2);
    }

    #[test]
    fn test_shape_mismatch() {
        let p = Array4::zeros((1, 2, 2, 1));
        let t = Array4::zeros((1, 2, 3, 1));
        assert!(pixel_loss(LossKind::L2, &p, &t).is_err());
    }
}
