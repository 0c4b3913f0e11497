//! 2D convolution with a fixed PSF through zero-padded real FFTs.
//!
//! The PSF is embedded in the centre of a canvas of `next_fast_len(2·n − 1)` pixels per axis
//! and circularly shifted so that its centre sits on the origin. Its spectrum is computed
//! once; every `apply`/`adjoint` call reuses the same padded scratch canvas.

use crate::error::{LenslessError, Result};
use crate::fft::Fft2d;
use crate::math_tools::{inner, next_fast_len, norm_sq, roll_axis};
use crate::psf::validate_psf;
use ndarray::{s, Array2, Array3, ArrayBase, Axis, Data, Ix3, Zip};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Where an `h × w` image sits on its zero-padded FFT canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingGeometry {
    pub image: (usize, usize),
    pub padded: (usize, usize),
    pub start: (usize, usize),
}

impl PaddingGeometry {
    pub fn new(h: usize, w: usize) -> Self {
        let padded = (next_fast_len(2 * h - 1), next_fast_len(2 * w - 1));
        let start = ((padded.0 - h) / 2, (padded.1 - w) / 2);
        PaddingGeometry {
            image: (h, w),
            padded,
            start,
        }
    }

    /// Circular shift that moves the canvas centre onto the origin (ifftshift).
    pub fn centering_shift(&self) -> (isize, isize) {
        (
            -((self.padded.0 / 2) as isize),
            -((self.padded.1 / 2) as isize),
        )
    }

    /// Zero-pads an `h × w × c` image onto the canvas.
    pub fn pad<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix3>) -> Array3<f32> {
        let (r0, c0) = self.start;
        let (h, w) = self.image;
        let mut out = Array3::zeros((self.padded.0, self.padded.1, x.len_of(Axis(2))));
        out.slice_mut(s![r0..r0 + h, c0..c0 + w, ..]).assign(x);
        out
    }

    /// Extracts the image footprint from a canvas.
    pub fn crop<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix3>) -> Array3<f32> {
        let (r0, c0) = self.start;
        let (h, w) = self.image;
        x.slice(s![r0..r0 + h, c0..c0 + w, ..]).to_owned()
    }

    /// Pads the PSF and re-centres it on the origin.
    pub fn embed_kernel(&self, psf: &Array3<f32>) -> Array3<f32> {
        let (dr, dc) = self.centering_shift();
        let padded = self.pad(psf);
        roll_axis(&roll_axis(&padded, Axis(0), dr), Axis(1), dc)
    }
}

/// Linear blur operator `A` and its exact adjoint `Aᵀ` for a fixed PSF.
#[derive(Debug)]
pub struct ConvolutionOperator {
    geometry: PaddingGeometry,
    channels: usize,
    fft: Fft2d,
    response: Vec<Array2<Complex32>>,
    canvas: Array3<f32>,
}

impl ConvolutionOperator {
    /// Builds the operator from an `H × W × C` PSF.
    ///
    /// # Arguments
    /// - `psf`: Non-negative, finite point-spread function.
    ///
    /// # Returns
    /// The operator with the cached frequency response, or a configuration error for an invalid PSF.
    pub fn new(psf: &Array3<f32>) -> Result<Self> {
        validate_psf(psf)?;
        let (h, w, c) = psf.dim();
        let geometry = PaddingGeometry::new(h, w);
        let fft = Fft2d::new(geometry.padded.0, geometry.padded.1);
        let kernel = geometry.embed_kernel(psf);
        let response = kernel
            .axis_iter(Axis(2))
            .map(|plane| fft.forward(&plane))
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "convolution operator: image {:?}, canvas {:?}, {} channel(s)",
            geometry.image,
            geometry.padded,
            c
        );
        Ok(ConvolutionOperator {
            geometry,
            channels: c,
            fft,
            response,
            canvas: Array3::zeros((geometry.padded.0, geometry.padded.1, c)),
        })
    }

    pub fn geometry(&self) -> &PaddingGeometry {
        &self.geometry
    }

    /// Image shape `(h, w, c)` the operator acts on.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.geometry.image.0, self.geometry.image.1, self.channels)
    }

    pub fn padded_shape(&self) -> (usize, usize) {
        self.geometry.padded
    }

    pub fn start_index(&self) -> (usize, usize) {
        self.geometry.start
    }

    pub fn fft(&self) -> &Fft2d {
        &self.fft
    }

    /// Cached half spectrum of the re-centred PSF for one channel.
    pub fn spectrum(&self, channel: usize) -> &Array2<Complex32> {
        &self.response[channel]
    }

    /// Forward blur of a flattened (row-major `H × W × C`) image.
    pub fn apply(&mut self, x: &[f32]) -> Result<Vec<f32>> {
        let image = self.unflatten(x, "convolution input")?;
        Ok(self.filter(&image, false)?.into_raw_vec_and_offset().0)
    }

    /// Adjoint (correlation) of a flattened (row-major `H × W × C`) image.
    pub fn adjoint(&mut self, y: &[f32]) -> Result<Vec<f32>> {
        let image = self.unflatten(y, "convolution adjoint input")?;
        Ok(self.filter(&image, true)?.into_raw_vec_and_offset().0)
    }

    /// Forward blur of an `H × W × C` image.
    pub fn apply_image<S: Data<Elem = f32>>(&mut self, x: &ArrayBase<S, Ix3>) -> Result<Array3<f32>> {
        self.filter(x, false)
    }

    /// Adjoint of [`Self::apply_image`].
    pub fn adjoint_image<S: Data<Elem = f32>>(
        &mut self,
        y: &ArrayBase<S, Ix3>,
    ) -> Result<Array3<f32>> {
        self.filter(y, true)
    }

    fn unflatten(&self, data: &[f32], context: &str) -> Result<Array3<f32>> {
        let shape = self.shape();
        let expected = shape.0 * shape.1 * shape.2;
        if data.len() != expected {
            return Err(LenslessError::shape(context, &[expected], &[data.len()]));
        }
        Array3::from_shape_vec(shape, data.to_vec())
            .map_err(|e| LenslessError::Numeric(format!("reshape: {e}")))
    }

    fn filter<S: Data<Elem = f32>>(
        &mut self,
        x: &ArrayBase<S, Ix3>,
        adjoint: bool,
    ) -> Result<Array3<f32>> {
        let shape = self.shape();
        if x.dim() != shape {
            return Err(LenslessError::shape(
                "convolution operator",
                &[shape.0, shape.1, shape.2],
                x.shape(),
            ));
        }
        let (r0, c0) = self.geometry.start;
        let (h, w) = self.geometry.image;

        self.canvas.fill(0.0);
        self.canvas
            .slice_mut(s![r0..r0 + h, c0..c0 + w, ..])
            .assign(x);

        let mut out = Array3::zeros(shape);
        for ch in 0..self.channels {
            let mut spectrum = self.fft.forward(&self.canvas.index_axis(Axis(2), ch))?;
            multiply_spectrum(&mut spectrum, &self.response[ch], adjoint);
            let full = self.fft.inverse(&spectrum)?;
            out.index_axis_mut(Axis(2), ch)
                .assign(&full.slice(s![r0..r0 + h, c0..c0 + w]));
        }
        Ok(out)
    }

    /// Circular convolution on the padded canvas (no cropping).
    pub fn convolve_padded(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        self.filter_padded(x, false)
    }

    /// Circular correlation on the padded canvas, the adjoint of [`Self::convolve_padded`].
    pub fn correlate_padded(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        self.filter_padded(x, true)
    }

    fn filter_padded(&self, x: &Array3<f32>, adjoint: bool) -> Result<Array3<f32>> {
        let (p, q) = self.geometry.padded;
        if x.dim() != (p, q, self.channels) {
            return Err(LenslessError::shape(
                "padded convolution",
                &[p, q, self.channels],
                x.shape(),
            ));
        }
        let mut out = Array3::zeros((p, q, self.channels));
        for ch in 0..self.channels {
            let mut spectrum = self.fft.forward(&x.index_axis(Axis(2), ch))?;
            multiply_spectrum(&mut spectrum, &self.response[ch], adjoint);
            out.index_axis_mut(Axis(2), ch)
                .assign(&self.fft.inverse(&spectrum)?);
        }
        Ok(out)
    }

    /// Upper bound of the Lipschitz constant of `x ↦ Aᵀ(Ax − b)`: `max |H|²`.
    pub fn lipschitz(&self) -> f32 {
        self.response
            .iter()
            .flat_map(|r| r.iter())
            .map(|h| h.norm_sqr())
            .fold(0.0, f32::max)
    }

    /// Estimates the largest eigenvalue of `AᵀA` by power iteration.
    ///
    /// # Arguments
    /// - `n_iter`: Number of iterations.
    /// - `seed`: Seed for the random start vector.
    pub fn power_iteration(&mut self, n_iter: usize, seed: u64) -> Result<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut x = Array3::from_shape_fn(self.shape(), |_| rng.gen::<f32>() - 0.5);
        let norm = norm_sq(&x).sqrt();
        x.mapv_inplace(|v| v / norm);
        let mut estimate = 0.0;
        for _ in 0..n_iter {
            let ax = self.apply_image(&x)?;
            let atax = self.adjoint_image(&ax)?;
            estimate = inner(&x, &atax);
            let norm = norm_sq(&atax).sqrt();
            if norm == 0.0 {
                return Ok(0.0);
            }
            x = atax.mapv(|v| v / norm);
        }
        Ok(estimate)
    }
}

fn multiply_spectrum(spectrum: &mut Array2<Complex32>, response: &Array2<Complex32>, conj: bool) {
    if conj {
        Zip::from(spectrum)
            .and(response)
            .for_each(|s, h| *s *= h.conj());
    } else {
        Zip::from(spectrum).and(response).for_each(|s, h| *s *= *h);
    }
}
