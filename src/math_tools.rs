//! Small numeric helpers shared by the operators, the solvers and the graph: FFT-friendly
//! lengths, circular shifts and finite differences, soft-thresholding, resizing and
//! normalization.

use ndarray::{
    concatenate, Array, Array2, Array3, ArrayBase, Axis, Data, Dimension, RemoveAxis, Slice, Zip,
};
use std::f32::consts::PI;

/// Returns the smallest 5-smooth integer (only prime factors 2, 3 and 5) that is `>= n`.
///
/// # Arguments
/// - `n`: The minimum transform length.
///
/// # Returns
/// A length for which FFTs are fast.
pub fn next_fast_len(n: usize) -> usize {
    if n <= 6 {
        return n.max(1);
    }
    let mut candidate = n;
    loop {
        let mut rest = candidate;
        for p in [2, 3, 5] {
            while rest % p == 0 {
                rest /= p;
            }
        }
        if rest == 1 {
            return candidate;
        }
        candidate += 1;
    }
}

/// Lifts a single-channel image to the height × width × channel layout.
pub fn as_image3(image: Array2<f32>) -> Array3<f32> {
    image.insert_axis(Axis(2))
}

/// Circularly shifts `a` along `axis` so that `out[i] = a[i - shift]` (numpy `roll`).
///
/// # Arguments
/// - `a`: The input array.
/// - `axis`: The axis to roll.
/// - `shift`: Number of places to shift; negative values shift towards lower indices.
///
/// # Returns
/// A new array with the same shape as `a`.
pub fn roll_axis<S, D>(a: &ArrayBase<S, D>, axis: Axis, shift: isize) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: RemoveAxis,
{
    let n = a.len_of(axis);
    if n == 0 {
        return a.to_owned();
    }
    let s = shift.rem_euclid(n as isize) as usize;
    if s == 0 {
        return a.to_owned();
    }
    let tail = a.slice_axis(axis, Slice::from(n - s..));
    let head = a.slice_axis(axis, Slice::from(..n - s));
    // both views share every other dimension, so concatenation cannot fail
    concatenate(axis, &[tail, head]).unwrap_or_else(|_| a.to_owned())
}

/// Circular forward difference `out[i] = a[i + 1] - a[i]` along `axis`.
pub fn circular_diff<S, D>(a: &ArrayBase<S, D>, axis: Axis) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: RemoveAxis,
{
    let mut out = roll_axis(a, axis, -1);
    out -= a;
    out
}

/// Adjoint of [`circular_diff`]: `out[i] = g[i - 1] - g[i]` along `axis`.
pub fn circular_diff_adjoint<S, D>(g: &ArrayBase<S, D>, axis: Axis) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: RemoveAxis,
{
    let mut out = roll_axis(g, axis, 1);
    out -= g;
    out
}

/// Eigenvalues of `ΨᵀΨ` (the sum of the row and column circular difference operators)
/// on the half-spectrum grid of a `rows × cols` real FFT.
pub fn difference_spectrum(rows: usize, cols: usize) -> Array2<f32> {
    let half = cols / 2 + 1;
    Array2::from_shape_fn((rows, half), |(k, l)| {
        let row_term = 2.0 - 2.0 * (2.0 * PI * k as f32 / rows as f32).cos();
        let col_term = 2.0 - 2.0 * (2.0 * PI * l as f32 / cols as f32).cos();
        row_term + col_term
    })
}

/// Soft-thresholding (the proximal map of `t·|x|`).
#[inline]
pub fn soft_threshold(x: f32, t: f32) -> f32 {
    x.signum() * (x.abs() - t).max(0.0)
}

/// Real inner product, accumulated in double precision.
pub fn inner<S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    let mut acc = 0.0f64;
    Zip::from(a).and(b).for_each(|&x, &y| acc += x as f64 * y as f64);
    acc as f32
}

/// Squared Euclidean norm, accumulated in double precision.
pub fn norm_sq<S, D>(a: &ArrayBase<S, D>) -> f32
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    a.iter().map(|&v| v as f64 * v as f64).sum::<f64>() as f32
}

/// Scales the image so that its maximum becomes (almost) one.
///
/// # Arguments
/// - `image`: The image to normalize.
/// - `eps`: Added to the maximum to avoid a division by zero for empty images.
pub fn max_normalize<S, D>(image: &ArrayBase<S, D>, eps: f32) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let max = image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    image.mapv(|v| v / (max + eps))
}

/// Rescales all values to [0, 1]. Constant images map to zeros.
pub fn min_max_normalize<S, D>(image: &ArrayBase<S, D>) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let min = image.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return image.mapv(|_| 0.0);
    }
    image.mapv(|v| (v - min) / range)
}

/// Bilinear resize of a height × width × channel image using pixel-centre alignment.
///
/// # Arguments
/// - `image`: The input image.
/// - `out_h`: Output height.
/// - `out_w`: Output width.
///
/// # Returns
/// The resized image with the same channel count.
pub fn resize_bilinear(image: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (h, w, c) = image.dim();
    let sample = |out: usize, n_out: usize, n_in: usize| -> (usize, usize, f32) {
        let src = ((out as f32 + 0.5) * n_in as f32 / n_out as f32 - 0.5).max(0.0);
        let lo = (src.floor() as usize).min(n_in - 1);
        let hi = (lo + 1).min(n_in - 1);
        (lo, hi, src - lo as f32)
    };
    let mut out = Array3::<f32>::zeros((out_h, out_w, c));
    if h == 0 || w == 0 {
        return out;
    }
    for i in 0..out_h {
        let (r0, r1, fr) = sample(i, out_h, h);
        for j in 0..out_w {
            let (c0, c1, fc) = sample(j, out_w, w);
            for k in 0..c {
                let top = image[[r0, c0, k]] * (1.0 - fc) + image[[r0, c1, k]] * fc;
                let bottom = image[[r1, c0, k]] * (1.0 - fc) + image[[r1, c1, k]] * fc;
                out[[i, j, k]] = top * (1.0 - fr) + bottom * fr;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array1};

    #[test]
    fn test_next_fast_len() {
        assert_eq!(next_fast_len(1), 1);
        assert_eq!(next_fast_len(7), 8);
        assert_eq!(next_fast_len(63), 64);
        assert_eq!(next_fast_len(97), 100);
        assert_eq!(next_fast_len(121), 125);
    }

    #[test]
    fn test_roll_matches_numpy() {
        let a = arr1(&[1.0f32, 2.0, 3.0, 4.0]);
        assert_eq!(roll_axis(&a, Axis(0), 1), arr1(&[4.0, 1.0, 2.0, 3.0]));
        assert_eq!(roll_axis(&a, Axis(0), -1), arr1(&[2.0, 3.0, 4.0, 1.0]));
        assert_eq!(roll_axis(&a, Axis(0), 4), a);
    }

    #[test]
    fn test_diff_adjoint_identity() {
        let a = Array1::from_iter((0..7).map(|i| (i as f32 * 0.7).sin()));
        let g = Array1::from_iter((0..7).map(|i| (i as f32 * 1.3).cos()));
        let lhs = inner(&circular_diff(&a, Axis(0)), &g);
        let rhs = inner(&a, &circular_diff_adjoint(&g, Axis(0)));
        assert_relative_eq!(lhs, rhs, epsilon = 1e-5);
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }

    #[test]
    fn test_resize_constant_image() {
        let img = Array3::from_elem((3, 4, 2), 0.25f32);
        let out = resize_bilinear(&img, 6, 8);
        assert_eq!(out.dim(), (6, 8, 2));
        out.iter().for_each(|&v| assert_relative_eq!(v, 0.25));
    }

    #[test]
    fn test_min_max_normalize_constant() {
        let img = Array2::from_elem((2, 2), 3.0f32);
        assert!(min_max_normalize(&img).iter().all(|&v| v == 0.0));
    }
}
