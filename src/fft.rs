//! Two-dimensional real FFTs built from `realfft` row transforms and `rustfft` column
//! transforms. Spectra use the half-spectrum layout `rows × (cols / 2 + 1)`.

use crate::error::Result;
use ndarray::{Array2, ArrayBase, Data, Ix2};
use num_complex::Complex32;
use num_traits::Zero;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Planned forward and inverse 2D transforms for one real image shape.
#[derive(Clone)]
pub struct Fft2d {
    rows: usize,
    cols: usize,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    col_forward: Arc<dyn Fft<f32>>,
    col_inverse: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for Fft2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2d")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

impl Fft2d {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut real_planner = RealFftPlanner::<f32>::new();
        let r2c = real_planner.plan_fft_forward(cols);
        let c2r = real_planner.plan_fft_inverse(cols);
        let mut planner = FftPlanner::<f32>::new();
        let col_forward = planner.plan_fft_forward(rows);
        let col_inverse = planner.plan_fft_inverse(rows);
        Fft2d {
            rows,
            cols,
            r2c,
            c2r,
            col_forward,
            col_inverse,
        }
    }

    /// Shape of the real images this plan transforms.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Shape of the half spectrum, `(rows, cols / 2 + 1)`.
    pub fn spectrum_shape(&self) -> (usize, usize) {
        (self.rows, self.cols / 2 + 1)
    }

    /// Forward transform of a real image.
    ///
    /// # Arguments
    /// - `input`: A `rows × cols` real image (any memory layout).
    ///
    /// # Returns
    /// The `rows × (cols / 2 + 1)` half spectrum.
    pub fn forward<S: Data<Elem = f32>>(
        &self,
        input: &ArrayBase<S, Ix2>,
    ) -> Result<Array2<Complex32>> {
        let (rows, half) = self.spectrum_shape();
        let mut spectrum = Array2::<Complex32>::zeros((rows, half));
        let mut row_in = self.r2c.make_input_vec();
        let mut row_out = self.r2c.make_output_vec();

        for (row, mut out_row) in input.outer_iter().zip(spectrum.outer_iter_mut()) {
            row_in
                .iter_mut()
                .zip(row.iter())
                .for_each(|(dst, src)| *dst = *src);
            self.r2c.process(&mut row_in, &mut row_out)?;
            out_row
                .iter_mut()
                .zip(row_out.iter())
                .for_each(|(dst, src)| *dst = *src);
        }

        let mut column = vec![Complex32::zero(); rows];
        for mut col in spectrum.columns_mut() {
            column
                .iter_mut()
                .zip(col.iter())
                .for_each(|(dst, src)| *dst = *src);
            self.col_forward.process(&mut column);
            col.iter_mut()
                .zip(column.iter())
                .for_each(|(dst, src)| *dst = *src);
        }
        Ok(spectrum)
    }

    /// Inverse transform of a half spectrum, normalized by `1 / (rows · cols)`.
    pub fn inverse(&self, spectrum: &Array2<Complex32>) -> Result<Array2<f32>> {
        let (rows, half) = self.spectrum_shape();
        let mut work = spectrum.clone();

        let mut column = vec![Complex32::zero(); rows];
        for mut col in work.columns_mut() {
            column
                .iter_mut()
                .zip(col.iter())
                .for_each(|(dst, src)| *dst = *src);
            self.col_inverse.process(&mut column);
            col.iter_mut()
                .zip(column.iter())
                .for_each(|(dst, src)| *dst = *src);
        }

        let scale = 1.0 / (self.rows * self.cols) as f32;
        let mut output = Array2::<f32>::zeros((rows, self.cols));
        let mut row_in = self.c2r.make_input_vec();
        let mut row_out = self.c2r.make_output_vec();
        for (row, mut out_row) in work.outer_iter().zip(output.outer_iter_mut()) {
            row_in
                .iter_mut()
                .zip(row.iter())
                .for_each(|(dst, src)| *dst = *src);
            // DC and Nyquist bins of a real signal are real; drop rounding noise
            row_in[0].im = 0.0;
            if self.cols % 2 == 0 {
                row_in[half - 1].im = 0.0;
            }
            self.c2r.process(&mut row_in, &mut row_out)?;
            out_row
                .iter_mut()
                .zip(row_out.iter())
                .for_each(|(dst, src)| *dst = *src * scale);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_forward_inverse_roundtrip_odd_even() {
        for (rows, cols) in [(8, 8), (5, 6), (6, 7)] {
            let plan = Fft2d::new(rows, cols);
            let img = Array2::from_shape_fn((rows, cols), |(i, j)| {
                ((i * 3 + j) as f32 * 0.37).sin() + 0.1 * j as f32
            });
            let back = plan.inverse(&plan.forward(&img).unwrap()).unwrap();
            for (a, b) in img.iter().zip(back.iter()) {
                assert_relative_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_dc_bin_is_sum() {
        let plan = Fft2d::new(4, 4);
        let img = Array2::from_elem((4, 4), 0.5f32);
        let spectrum = plan.forward(&img).unwrap();
        assert_relative_eq!(spectrum[[0, 0]].re, 8.0, epsilon = 1e-5);
        assert_relative_eq!(spectrum[[1, 1]].norm(), 0.0, epsilon = 1e-5);
    }
}
