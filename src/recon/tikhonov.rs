//! Closed-form Tikhonov reconstruction for separable forward models `Y = P X Qᵀ`, as used by
//! coded-aperture cameras, together with the Bayer conversions it operates on.
//!
//! Bayer planes are stored in the channel order `[B, Gb, Gr, R]`.

use crate::error::{LenslessError, Result};
use crate::math_tools::{max_normalize, min_max_normalize, resize_bilinear};
use nalgebra::{DMatrix, DVector};
use ndarray::{s, Array3, Axis};
use rand::Rng;
use rand_distr::{Distribution, Poisson};

/// Samples an RGB image into four Bayer planes of the same height and width.
///
/// The image is upsampled by two (bilinear) and each plane picks one pixel of every 2×2 cell.
pub fn rgb2bayer(img: &Array3<f32>) -> Result<Array3<f32>> {
    let (h, w, c) = img.dim();
    if c != 3 {
        return Err(LenslessError::shape("rgb2bayer input", &[h, w, 3], img.shape()));
    }
    let up = resize_bilinear(img, 2 * h, 2 * w);
    let mut bayer = Array3::zeros((h, w, 4));
    bayer
        .index_axis_mut(Axis(2), 0)
        .assign(&up.slice(s![0..;2, 0..;2, 2]));
    bayer
        .index_axis_mut(Axis(2), 1)
        .assign(&up.slice(s![1..;2, 0..;2, 1]));
    bayer
        .index_axis_mut(Axis(2), 2)
        .assign(&up.slice(s![0..;2, 1..;2, 1]));
    bayer
        .index_axis_mut(Axis(2), 3)
        .assign(&up.slice(s![1..;2, 1..;2, 0]));
    Ok(bayer)
}

/// Demosaics four Bayer planes into RGB: `R = plane 3`, `G = mean(plane 1, plane 2)`, `B = plane 0`.
///
/// # Arguments
/// - `x`: `H × W × 4` Bayer planes.
/// - `normalize`: Rescale the result to [0, 1].
pub fn bayer2rgb(x: &Array3<f32>, normalize: bool) -> Result<Array3<f32>> {
    let (h, w, c) = x.dim();
    if c != 4 {
        return Err(LenslessError::shape("bayer2rgb input", &[h, w, 4], x.shape()));
    }
    let mut rgb = Array3::zeros((h, w, 3));
    rgb.index_axis_mut(Axis(2), 0)
        .assign(&x.index_axis(Axis(2), 3));
    rgb.index_axis_mut(Axis(2), 1).assign(
        &((&x.index_axis(Axis(2), 1) + &x.index_axis(Axis(2), 2)) * 0.5),
    );
    rgb.index_axis_mut(Axis(2), 2)
        .assign(&x.index_axis(Axis(2), 0));
    if normalize {
        rgb = min_max_normalize(&rgb);
    }
    Ok(rgb)
}

fn to_matrix(plane: ndarray::ArrayView2<f32>) -> DMatrix<f32> {
    let (rows, cols) = plane.dim();
    DMatrix::from_fn(rows, cols, |i, j| plane[[i, j]])
}

struct Factor {
    u: DMatrix<f32>,
    singular: DVector<f32>,
    v_t: DMatrix<f32>,
}

fn decompose(matrix: &DMatrix<f32>, name: &str) -> Result<Factor> {
    let svd = matrix
        .clone()
        .try_svd(true, true, f32::EPSILON, 0)
        .ok_or_else(|| LenslessError::Numeric(format!("SVD of {name} did not converge")))?;
    let u = svd
        .u
        .ok_or_else(|| LenslessError::Numeric(format!("SVD of {name} returned no U")))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| LenslessError::Numeric(format!("SVD of {name} returned no Vᵀ")))?;
    Ok(Factor {
        u,
        singular: svd.singular_values,
        v_t,
    })
}

/// Regularized inverse of `Y = P X Qᵀ` for each of the four Bayer planes.
///
/// # Arguments
/// - `y`: `m × p × 4` measurement.
/// - `p`: Left factor, `m × n`.
/// - `q`: Right factor, `p × q`.
/// - `lambda`: Tikhonov weight.
///
/// # Returns
/// The `n × q × 3` RGB estimate with negatives clipped and values min-max normalized, or a
/// numeric error when a factor is singular and `lambda` does not regularize it.
pub fn reconstruction(
    y: &Array3<f32>,
    p: &DMatrix<f32>,
    q: &DMatrix<f32>,
    lambda: f32,
) -> Result<Array3<f32>> {
    let (m, pw, c) = y.dim();
    if c != 4 || m != p.nrows() || pw != q.nrows() {
        return Err(LenslessError::shape(
            "Tikhonov measurement",
            &[p.nrows(), q.nrows(), 4],
            y.shape(),
        ));
    }
    if !(lambda >= 0.0 && lambda.is_finite()) {
        return Err(LenslessError::Configuration(format!(
            "Tikhonov weight must be non-negative, got {lambda}"
        )));
    }
    let left = decompose(p, "P")?;
    let right = decompose(q, "Q")?;

    let denominator = DMatrix::from_fn(left.singular.len(), right.singular.len(), |i, j| {
        (left.singular[i] * right.singular[j]).powi(2) + lambda
    });
    let max_denominator = denominator.max();
    if denominator.iter().any(|&d| !(d > 0.0) || !d.is_finite())
        || (lambda == 0.0 && denominator.min() <= f32::EPSILON * max_denominator)
    {
        return Err(LenslessError::Numeric(
            "ill-posed factor: zero singular value without regularization".to_string(),
        ));
    }

    let s_left = DMatrix::from_diagonal(&left.singular);
    let s_right = DMatrix::from_diagonal(&right.singular);
    let mut estimate = Array3::<f32>::zeros((p.ncols(), q.ncols(), 4));
    for ch in 0..4 {
        let plane = to_matrix(y.index_axis(Axis(2), ch));
        let inner = &s_left * left.u.transpose() * plane * &right.u * &s_right;
        let inner = inner.component_div(&denominator);
        let x = left.v_t.transpose() * inner * &right.v_t;
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LenslessError::Numeric(format!(
                "non-finite Tikhonov estimate in Bayer plane {ch}"
            )));
        }
        let mut out = estimate.index_axis_mut(Axis(2), ch);
        for ((i, j), value) in out.indexed_iter_mut() {
            *value = x[(i, j)].max(0.0);
        }
    }
    bayer2rgb(&estimate, true)
}

/// Builds the separable factors from the column and row profiles of a coded mask.
///
/// Each factor is the circulant matrix of its profile, truncated to the image size:
/// `P[i, j] = col[(i − j) mod m]` for `j < h`.
pub fn separable_operators(
    col: &[f32],
    row: &[f32],
    image_shape: (usize, usize),
) -> Result<(DMatrix<f32>, DMatrix<f32>)> {
    let (h, w) = image_shape;
    if h > col.len() || w > row.len() || h == 0 || w == 0 {
        return Err(LenslessError::Configuration(format!(
            "image {h}×{w} does not fit mask profiles {}×{}",
            col.len(),
            row.len()
        )));
    }
    let circulant = |profile: &[f32], cols: usize| {
        let n = profile.len();
        DMatrix::from_fn(n, cols, |i, j| profile[(i + n - j) % n])
    };
    Ok((circulant(col, h), circulant(row, w)))
}

/// Simulates a separable coded-aperture measurement of an RGB image.
///
/// # Arguments
/// - `img`: `h × w × 3` scene.
/// - `p`, `q`: Separable factors from [`separable_operators`].
/// - `photons`: Photon count at the brightest pixel; `None` disables shot noise.
/// - `rng`: Random source for the Poisson noise.
///
/// # Returns
/// The `m × p × 4` Bayer measurement normalized to a maximum of one.
pub fn simulate<R: Rng>(
    img: &Array3<f32>,
    p: &DMatrix<f32>,
    q: &DMatrix<f32>,
    photons: Option<f32>,
    rng: &mut R,
) -> Result<Array3<f32>> {
    let bayer = rgb2bayer(img)?;
    let (h, w, _) = bayer.dim();
    if p.ncols() != h || q.ncols() != w {
        return Err(LenslessError::shape(
            "simulation scene",
            &[p.ncols(), q.ncols(), 3],
            img.shape(),
        ));
    }
    let mut y = Array3::<f32>::zeros((p.nrows(), q.nrows(), 4));
    for ch in 0..4 {
        let plane = p * to_matrix(bayer.index_axis(Axis(2), ch)) * q.transpose();
        let mut out = y.index_axis_mut(Axis(2), ch);
        for ((i, j), value) in out.indexed_iter_mut() {
            *value = plane[(i, j)];
        }
    }
    let mut y = max_normalize(&y, 1e-12);
    if let Some(photons) = photons {
        for v in y.iter_mut() {
            let lambda = (*v * photons).max(0.0) as f64;
            *v = if lambda > 0.0 {
                let poisson = Poisson::new(lambda)
                    .map_err(|e| LenslessError::Numeric(format!("Poisson noise: {e}")))?;
                poisson.sample(rng) as f32 / photons
            } else {
                0.0
            };
        }
        y = max_normalize(&y, 1e-12);
    }
    Ok(y)
}
