//! Define-by-run reverse-mode differentiation over batched image tensors.
//!
//! Every value is an `Array4<f32>` laid out as `(batch, rows, cols, channels)`; scalars are
//! `1 × 1 × 1 × 1`. Operations append nodes to a [`Graph`] and return a [`Var`] handle.
//! [`Graph::backward`] walks the tape in reverse and returns the gradients of the leaves.
//!
//! The FFT-based operations (`conv`, `corr`, `solve`) act circularly on whatever canvas they
//! are given; kernels carry either one batch entry (shared) or one per input batch entry.

use crate::error::{LenslessError, Result};
use crate::fft::Fft2d;
use crate::math_tools::{circular_diff, circular_diff_adjoint, difference_spectrum, inner, roll_axis};
use crate::operators::PaddingGeometry;
use ndarray::{s, Array2, Array4, ArrayView2, Axis, Zip};
use num_complex::Complex32;
use rayon::prelude::*;
use std::collections::HashMap;

pub type Tensor = Array4<f32>;

/// Handle to a node of a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

impl Var {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Spatial axis of a `(batch, rows, cols, channels)` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialAxis {
    Rows,
    Cols,
}

impl SpatialAxis {
    fn axis(&self) -> Axis {
        match self {
            SpatialAxis::Rows => Axis(1),
            SpatialAxis::Cols => Axis(2),
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Leaf,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Scale(Var, Var),
    Recip(Var),
    Relu(Var),
    SoftThreshold(Var, Var),
    ShiftedDiv { input: Var, shift: Var, base: Tensor },
    Pad { input: Var, start: (usize, usize) },
    Crop { input: Var, start: (usize, usize) },
    Roll { input: Var, shift: (isize, isize) },
    Diff { input: Var, axis: SpatialAxis },
    DiffAdjoint { input: Var, axis: SpatialAxis },
    Conv { input: Var, kernel: Var },
    Corr { input: Var, kernel: Var },
    Solve { rhs: Var, kernel: Var, mu1: Var, mu2: Var, mu3: Var },
    Outer { col: Var, row: Var },
    Conv3x3 { input: Var, weight: Var },
    BiasAdd { input: Var, bias: Var },
    MaxNormalize { input: Var, eps: f32 },
}

#[derive(Debug)]
struct Node {
    value: Tensor,
    op: Op,
    requires_grad: bool,
}

/// Gradients of the leaves after a backward pass.
#[derive(Debug)]
pub struct Gradients {
    grads: Vec<Option<Tensor>>,
}

impl Gradients {
    pub fn get(&self, var: Var) -> Option<&Tensor> {
        self.grads.get(var.0).and_then(|g| g.as_ref())
    }

    pub fn take(&mut self, var: Var) -> Option<Tensor> {
        self.grads.get_mut(var.0).and_then(|g| g.take())
    }
}

/// Tape of tensor operations.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    plans: HashMap<(usize, usize), Fft2d>,
}

fn plan(plans: &mut HashMap<(usize, usize), Fft2d>, rows: usize, cols: usize) -> Fft2d {
    plans
        .entry((rows, cols))
        .or_insert_with(|| Fft2d::new(rows, cols))
        .clone()
}

fn scalar_tensor(value: f32) -> Tensor {
    Array4::from_elem((1, 1, 1, 1), value)
}

fn accumulate(grads: &mut [Option<Tensor>], var: Var, contribution: Tensor) {
    if let Some(g) = grads[var.0].as_mut() {
        *g += &contribution;
    } else {
        grads[var.0] = Some(contribution);
    }
}

fn plane(t: &Tensor, b: usize, ch: usize) -> ArrayView2<'_, f32> {
    t.slice(s![b, .., .., ch])
}

fn assemble(planes: Vec<Array2<f32>>, shape: (usize, usize, usize, usize)) -> Tensor {
    let channels = shape.3;
    let mut out = Array4::<f32>::zeros(shape);
    for (k, p) in planes.into_iter().enumerate() {
        out.slice_mut(s![k / channels, .., .., k % channels]).assign(&p);
    }
    out
}

fn spectra(fft: &Fft2d, t: &Tensor) -> Result<Vec<Array2<Complex32>>> {
    let (n, _, _, c) = t.dim();
    (0..n * c)
        .into_par_iter()
        .map(|k| fft.forward(&plane(t, k / c, k % c)))
        .collect()
}

/// `F⁻¹(F(x) · F(h))`, or with `conj(F(h))` for correlation, per batch entry and channel.
fn filter_planes(fft: &Fft2d, x: &Tensor, kernel: &Tensor, conj: bool) -> Result<Tensor> {
    let (n, _, _, c) = x.dim();
    let shared = kernel.dim().0 == 1;
    let kernel_spectra = spectra(fft, kernel)?;
    let planes = (0..n * c)
        .into_par_iter()
        .map(|k| {
            let (b, ch) = (k / c, k % c);
            let mut xs = fft.forward(&plane(x, b, ch))?;
            let hs = &kernel_spectra[if shared { ch } else { k }];
            if conj {
                Zip::from(&mut xs).and(hs).for_each(|a, h| *a *= h.conj());
            } else {
                Zip::from(&mut xs).and(hs).for_each(|a, h| *a *= *h);
            }
            fft.inverse(&xs)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(assemble(planes, x.dim()))
}

/// `F⁻¹(F(a) · conj(F(b)))` per plane, summed over the batch when the kernel is shared.
fn cross_planes(fft: &Fft2d, a: &Tensor, b: &Tensor, kernel_batch: usize) -> Result<Tensor> {
    let (n, p, q, c) = a.dim();
    let planes = (0..n * c)
        .into_par_iter()
        .map(|k| {
            let (bi, ch) = (k / c, k % c);
            let mut sa = fft.forward(&plane(a, bi, ch))?;
            let sb = fft.forward(&plane(b, bi, ch))?;
            Zip::from(&mut sa).and(&sb).for_each(|x, y| *x *= y.conj());
            fft.inverse(&sa)
        })
        .collect::<Result<Vec<_>>>()?;
    let full = assemble(planes, (n, p, q, c));
    if kernel_batch == 1 && n > 1 {
        Ok(full.sum_axis(Axis(0)).insert_axis(Axis(0)))
    } else {
        Ok(full)
    }
}

/// Solves `(mu1·HᵀH + mu2·ΨᵀΨ + mu3·I) x = r` per plane in the Fourier domain.
fn solve_planes(fft: &Fft2d, r: &Tensor, kernel: &Tensor, mu: (f32, f32, f32)) -> Result<Tensor> {
    let (n, p, q, c) = r.dim();
    let shared = kernel.dim().0 == 1;
    let kernel_spectra = spectra(fft, kernel)?;
    let laplacian = difference_spectrum(p, q);
    let planes = (0..n * c)
        .into_par_iter()
        .map(|k| {
            let (b, ch) = (k / c, k % c);
            let mut rs = fft.forward(&plane(r, b, ch))?;
            let hs = &kernel_spectra[if shared { ch } else { k }];
            Zip::from(&mut rs)
                .and(hs)
                .and(&laplacian)
                .for_each(|x, h, &l| *x /= mu.0 * h.norm_sqr() + mu.1 * l + mu.2);
            fft.inverse(&rs)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(assemble(planes, r.dim()))
}

/// `ΨᵀΨ x` for the row and column circular differences.
fn difference_normal(x: &Tensor) -> Tensor {
    let mut out = circular_diff_adjoint(&circular_diff(x, Axis(1)), Axis(1));
    out += &circular_diff_adjoint(&circular_diff(x, Axis(2)), Axis(2));
    out
}

/// Output and input index ranges of a one-pixel shift `d ∈ {-1, 0, 1}` along an axis of `len`.
fn shifted_ranges(len: usize, d: isize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
    match d {
        -1 => (1..len, 0..len - 1),
        1 => (0..len - 1, 1..len),
        _ => (0..len, 0..len),
    }
}

fn conv3x3_forward(x: &Tensor, weight: &Tensor) -> Tensor {
    let (n, h, w, _) = x.dim();
    let (c_out, c_in, _, _) = weight.dim();
    let mut out = Array4::<f32>::zeros((n, h, w, c_out));
    for di in 0..3 {
        let (out_rows, in_rows) = shifted_ranges(h, di as isize - 1);
        for dj in 0..3 {
            let (out_cols, in_cols) = shifted_ranges(w, dj as isize - 1);
            for o in 0..c_out {
                for c in 0..c_in {
                    let wv = weight[[o, c, di, dj]];
                    if wv == 0.0 {
                        continue;
                    }
                    let src = x.slice(s![.., in_rows.clone(), in_cols.clone(), c]);
                    out.slice_mut(s![.., out_rows.clone(), out_cols.clone(), o])
                        .scaled_add(wv, &src);
                }
            }
        }
    }
    out
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn value(&self, var: Var) -> &Tensor {
        &self.nodes[var.0].value
    }

    pub fn requires_grad(&self, var: Var) -> bool {
        self.nodes[var.0].requires_grad
    }

    /// Value of a `1 × 1 × 1 × 1` node.
    pub fn scalar(&self, var: Var) -> Result<f32> {
        let value = self.value(var);
        if value.len() != 1 {
            return Err(LenslessError::shape("scalar node", &[1, 1, 1, 1], value.shape()));
        }
        Ok(value.iter().next().copied().unwrap_or(0.0))
    }

    fn push(&mut self, value: Tensor, op: Op, requires_grad: bool) -> Var {
        self.nodes.push(Node {
            value,
            op,
            requires_grad,
        });
        Var(self.nodes.len() - 1)
    }

    fn needs(&self, vars: &[Var]) -> bool {
        vars.iter().any(|v| self.nodes[v.0].requires_grad)
    }

    fn same_shape(&self, a: Var, b: Var, context: &str) -> Result<()> {
        let (sa, sb) = (self.value(a).shape(), self.value(b).shape());
        if sa != sb {
            return Err(LenslessError::shape(context, sa, sb));
        }
        Ok(())
    }

    fn check_scalar(&self, var: Var, context: &str) -> Result<f32> {
        self.scalar(var).map_err(|_| {
            LenslessError::shape(context, &[1, 1, 1, 1], self.value(var).shape())
        })
    }

    fn check_kernel(&self, x: Var, kernel: Var, context: &str) -> Result<()> {
        let (n, p, q, c) = self.value(x).dim();
        let (kb, kp, kq, kc) = self.value(kernel).dim();
        if (kp, kq, kc) != (p, q, c) || !(kb == 1 || kb == n) {
            return Err(LenslessError::shape(context, &[n, p, q, c], &[kb, kp, kq, kc]));
        }
        Ok(())
    }

    /// Input node; gradients are tracked when `requires_grad` is set.
    pub fn leaf(&mut self, value: Tensor, requires_grad: bool) -> Var {
        self.push(value, Op::Leaf, requires_grad)
    }

    pub fn constant(&mut self, value: Tensor) -> Var {
        self.leaf(value, false)
    }

    pub fn scalar_constant(&mut self, value: f32) -> Var {
        self.constant(scalar_tensor(value))
    }

    pub fn add(&mut self, a: Var, b: Var) -> Result<Var> {
        self.same_shape(a, b, "add")?;
        let value = self.value(a) + self.value(b);
        let rg = self.needs(&[a, b]);
        Ok(self.push(value, Op::Add(a, b), rg))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var> {
        self.same_shape(a, b, "sub")?;
        let value = self.value(a) - self.value(b);
        let rg = self.needs(&[a, b]);
        Ok(self.push(value, Op::Sub(a, b), rg))
    }

    /// Element-wise product of two tensors of the same shape.
    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var> {
        self.same_shape(a, b, "mul")?;
        let value = self.value(a) * self.value(b);
        let rg = self.needs(&[a, b]);
        Ok(self.push(value, Op::Mul(a, b), rg))
    }

    /// `a · s` for a scalar node `s`.
    pub fn scale(&mut self, a: Var, s: Var) -> Result<Var> {
        let factor = self.check_scalar(s, "scale factor")?;
        let value = self.value(a) * factor;
        let rg = self.needs(&[a, s]);
        Ok(self.push(value, Op::Scale(a, s), rg))
    }

    pub fn recip(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|v| 1.0 / v);
        let rg = self.needs(&[a]);
        self.push(value, Op::Recip(a), rg)
    }

    pub fn relu(&mut self, a: Var) -> Var {
        let value = self.value(a).mapv(|v| v.max(0.0));
        let rg = self.needs(&[a]);
        self.push(value, Op::Relu(a), rg)
    }

    /// Soft-thresholding by a scalar node `t`.
    pub fn soft_threshold(&mut self, a: Var, t: Var) -> Result<Var> {
        let threshold = self.check_scalar(t, "soft threshold")?;
        let value = self
            .value(a)
            .mapv(|v| crate::math_tools::soft_threshold(v, threshold));
        let rg = self.needs(&[a, t]);
        Ok(self.push(value, Op::SoftThreshold(a, t), rg))
    }

    /// `a / (base + s)` with a constant `base` broadcast over the batch and a scalar node `s`.
    pub fn shifted_div(&mut self, a: Var, base: Tensor, s: Var) -> Result<Var> {
        let shift = self.check_scalar(s, "shifted division")?;
        let (_, p, q, c) = self.value(a).dim();
        if base.dim() != (1, p, q, c) {
            return Err(LenslessError::shape("shifted division base", &[1, p, q, c], base.shape()));
        }
        let mut value = self.value(a).clone();
        for mut sample in value.outer_iter_mut() {
            Zip::from(&mut sample)
                .and(&base.index_axis(Axis(0), 0))
                .for_each(|v, &m| *v /= m + shift);
        }
        let rg = self.needs(&[a, s]);
        Ok(self.push(value, Op::ShiftedDiv { input: a, shift: s, base }, rg))
    }

    /// Zero-pads an image batch onto the canvas described by `geometry`.
    pub fn pad(&mut self, a: Var, geometry: &PaddingGeometry) -> Result<Var> {
        let (n, h, w, c) = self.value(a).dim();
        if (h, w) != geometry.image {
            return Err(LenslessError::shape(
                "pad input",
                &[n, geometry.image.0, geometry.image.1, c],
                &[n, h, w, c],
            ));
        }
        let (r0, c0) = geometry.start;
        let mut value = Array4::<f32>::zeros((n, geometry.padded.0, geometry.padded.1, c));
        value
            .slice_mut(s![.., r0..r0 + h, c0..c0 + w, ..])
            .assign(self.value(a));
        let rg = self.needs(&[a]);
        Ok(self.push(value, Op::Pad { input: a, start: geometry.start }, rg))
    }

    /// Extracts the image footprint from a canvas batch.
    pub fn crop(&mut self, a: Var, geometry: &PaddingGeometry) -> Result<Var> {
        let (n, p, q, c) = self.value(a).dim();
        if (p, q) != geometry.padded {
            return Err(LenslessError::shape(
                "crop input",
                &[n, geometry.padded.0, geometry.padded.1, c],
                &[n, p, q, c],
            ));
        }
        let (r0, c0) = geometry.start;
        let (h, w) = geometry.image;
        let value = self
            .value(a)
            .slice(s![.., r0..r0 + h, c0..c0 + w, ..])
            .to_owned();
        let rg = self.needs(&[a]);
        Ok(self.push(value, Op::Crop { input: a, start: geometry.start }, rg))
    }

    /// Extracts an arbitrary `[r0, r1) × [c0, c1)` window.
    pub fn window(&mut self, a: Var, rows: (usize, usize), cols: (usize, usize)) -> Result<Var> {
        let (_, h, w, _) = self.value(a).dim();
        if rows.0 >= rows.1 || cols.0 >= cols.1 || rows.1 > h || cols.1 > w {
            return Err(LenslessError::Configuration(format!(
                "crop window {rows:?} × {cols:?} outside image {h}×{w}"
            )));
        }
        let value = self
            .value(a)
            .slice(s![.., rows.0..rows.1, cols.0..cols.1, ..])
            .to_owned();
        let rg = self.needs(&[a]);
        Ok(self.push(value, Op::Crop { input: a, start: (rows.0, cols.0) }, rg))
    }

    /// Circular shift along rows and columns (numpy `roll` convention).
    pub fn roll(&mut self, a: Var, shift: (isize, isize)) -> Var {
        let value = roll_axis(&roll_axis(self.value(a), Axis(1), shift.0), Axis(2), shift.1);
        let rg = self.needs(&[a]);
        self.push(value, Op::Roll { input: a, shift }, rg)
    }

    /// Circular forward difference along a spatial axis.
    pub fn diff(&mut self, a: Var, axis: SpatialAxis) -> Var {
        let value = circular_diff(self.value(a), axis.axis());
        let rg = self.needs(&[a]);
        self.push(value, Op::Diff { input: a, axis }, rg)
    }

    /// Adjoint of [`Graph::diff`].
    pub fn diff_adjoint(&mut self, a: Var, axis: SpatialAxis) -> Var {
        let value = circular_diff_adjoint(self.value(a), axis.axis());
        let rg = self.needs(&[a]);
        self.push(value, Op::DiffAdjoint { input: a, axis }, rg)
    }

    /// Circular convolution of `x` with `kernel`.
    pub fn conv(&mut self, x: Var, kernel: Var) -> Result<Var> {
        self.check_kernel(x, kernel, "conv kernel")?;
        let (_, p, q, _) = self.value(x).dim();
        let fft = plan(&mut self.plans, p, q);
        let value = filter_planes(&fft, self.value(x), self.value(kernel), false)?;
        let rg = self.needs(&[x, kernel]);
        Ok(self.push(value, Op::Conv { input: x, kernel }, rg))
    }

    /// Circular correlation of `x` with `kernel`, the adjoint of [`Graph::conv`] in `x`.
    pub fn corr(&mut self, x: Var, kernel: Var) -> Result<Var> {
        self.check_kernel(x, kernel, "corr kernel")?;
        let (_, p, q, _) = self.value(x).dim();
        let fft = plan(&mut self.plans, p, q);
        let value = filter_planes(&fft, self.value(x), self.value(kernel), true)?;
        let rg = self.needs(&[x, kernel]);
        Ok(self.push(value, Op::Corr { input: x, kernel }, rg))
    }

    /// `(mu1·HᵀH + mu2·ΨᵀΨ + mu3·I)⁻¹ rhs` with scalar nodes for the weights.
    pub fn solve(&mut self, rhs: Var, kernel: Var, mu1: Var, mu2: Var, mu3: Var) -> Result<Var> {
        self.check_kernel(rhs, kernel, "solve kernel")?;
        let mu = (
            self.check_scalar(mu1, "solve mu1")?,
            self.check_scalar(mu2, "solve mu2")?,
            self.check_scalar(mu3, "solve mu3")?,
        );
        let (_, p, q, _) = self.value(rhs).dim();
        let fft = plan(&mut self.plans, p, q);
        let value = solve_planes(&fft, self.value(rhs), self.value(kernel), mu)?;
        let rg = self.needs(&[rhs, kernel, mu1, mu2, mu3]);
        Ok(self.push(
            value,
            Op::Solve {
                rhs,
                kernel,
                mu1,
                mu2,
                mu3,
            },
            rg,
        ))
    }

    /// `out[0, i, j, c] = col[0, i, 0, 0] · row[0, 0, j, 0]` for every channel.
    pub fn outer(&mut self, col: Var, row: Var, channels: usize) -> Result<Var> {
        let (cb, h, cw, cc) = self.value(col).dim();
        let (rb, rh, w, rc) = self.value(row).dim();
        if (cb, cw, cc) != (1, 1, 1) {
            return Err(LenslessError::shape("outer column", &[1, h, 1, 1], &[cb, h, cw, cc]));
        }
        if (rb, rh, rc) != (1, 1, 1) {
            return Err(LenslessError::shape("outer row", &[1, 1, w, 1], &[rb, rh, w, rc]));
        }
        let (cv, rv) = (self.value(col), self.value(row));
        let value = Array4::from_shape_fn((1, h, w, channels), |(_, i, j, _)| {
            cv[[0, i, 0, 0]] * rv[[0, 0, j, 0]]
        });
        let rg = self.needs(&[col, row]);
        Ok(self.push(value, Op::Outer { col, row }, rg))
    }

    /// Zero-padded 3×3 convolution; `weight` is `(out_channels, in_channels, 3, 3)`.
    pub fn conv3x3(&mut self, x: Var, weight: Var) -> Result<Var> {
        let (_, _, _, c_in) = self.value(x).dim();
        let (c_out, w_in, kh, kw) = self.value(weight).dim();
        if (w_in, kh, kw) != (c_in, 3, 3) {
            return Err(LenslessError::shape("conv3x3 weight", &[c_out, c_in, 3, 3], &[c_out, w_in, kh, kw]));
        }
        let value = conv3x3_forward(self.value(x), self.value(weight));
        let rg = self.needs(&[x, weight]);
        Ok(self.push(value, Op::Conv3x3 { input: x, weight }, rg))
    }

    /// Adds a per-channel bias of shape `(1, 1, 1, channels)`.
    pub fn bias_add(&mut self, x: Var, bias: Var) -> Result<Var> {
        let c = self.value(x).dim().3;
        if self.value(bias).dim() != (1, 1, 1, c) {
            return Err(LenslessError::shape("bias", &[1, 1, 1, c], self.value(bias).shape()));
        }
        let value = self.value(x) + self.value(bias);
        let rg = self.needs(&[x, bias]);
        Ok(self.push(value, Op::BiasAdd { input: x, bias }, rg))
    }

    /// Divides every batch entry by its maximum plus `eps`.
    pub fn max_normalize(&mut self, x: Var, eps: f32) -> Var {
        let mut value = self.value(x).clone();
        for mut sample in value.outer_iter_mut() {
            let max = sample.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            sample.mapv_inplace(|v| v / (max + eps));
        }
        let rg = self.needs(&[x]);
        self.push(value, Op::MaxNormalize { input: x, eps }, rg)
    }

    /// Back-propagates `seed` (the gradient of the objective w.r.t. `output`).
    ///
    /// # Returns
    /// The accumulated gradients of every leaf that requires them.
    pub fn backward(&mut self, output: Var, seed: Tensor) -> Result<Gradients> {
        self.backward_from(vec![(output, seed)])
    }

    /// Back-propagates several seeded outputs at once; their contributions add up.
    pub fn backward_from(&mut self, seeds: Vec<(Var, Tensor)>) -> Result<Gradients> {
        let Graph { nodes, plans } = self;
        let mut grads: Vec<Option<Tensor>> = vec![None; nodes.len()];
        let mut last = 0;
        for (output, seed) in seeds {
            if seed.shape() != nodes[output.0].value.shape() {
                return Err(LenslessError::shape(
                    "backward seed",
                    nodes[output.0].value.shape(),
                    seed.shape(),
                ));
            }
            last = last.max(output.0);
            accumulate(&mut grads, output, seed);
        }
        if nodes.is_empty() {
            return Ok(Gradients { grads });
        }

        for idx in (0..=last).rev() {
            let node = &nodes[idx];
            if !node.requires_grad {
                grads[idx] = None;
                continue;
            }
            let Some(g) = grads[idx].take() else {
                continue;
            };
            let rg = |v: &Var| nodes[v.0].requires_grad;
            let val = |v: &Var| &nodes[v.0].value;

            match &node.op {
                Op::Leaf => {
                    grads[idx] = Some(g);
                }
                Op::Add(a, b) => {
                    if rg(b) {
                        accumulate(&mut grads, *b, g.clone());
                    }
                    if rg(a) {
                        accumulate(&mut grads, *a, g);
                    }
                }
                Op::Sub(a, b) => {
                    if rg(b) {
                        accumulate(&mut grads, *b, -&g);
                    }
                    if rg(a) {
                        accumulate(&mut grads, *a, g);
                    }
                }
                Op::Mul(a, b) => {
                    if rg(a) {
                        accumulate(&mut grads, *a, &g * val(b));
                    }
                    if rg(b) {
                        accumulate(&mut grads, *b, &g * val(a));
                    }
                }
                Op::Scale(a, s) => {
                    let factor = val(s).iter().next().copied().unwrap_or(0.0);
                    if rg(s) {
                        accumulate(&mut grads, *s, scalar_tensor(inner(&g, val(a))));
                    }
                    if rg(a) {
                        accumulate(&mut grads, *a, g * factor);
                    }
                }
                Op::Recip(a) => {
                    let contribution = Zip::from(&g)
                        .and(&node.value)
                        .map_collect(|&g, &v| -g * v * v);
                    accumulate(&mut grads, *a, contribution);
                }
                Op::Relu(a) => {
                    let contribution = Zip::from(&g)
                        .and(val(a))
                        .map_collect(|&g, &x| if x > 0.0 { g } else { 0.0 });
                    accumulate(&mut grads, *a, contribution);
                }
                Op::SoftThreshold(a, t) => {
                    let threshold = val(t).iter().next().copied().unwrap_or(0.0);
                    if rg(t) {
                        let mut total = 0.0f64;
                        Zip::from(&g).and(val(a)).for_each(|&g, &x| {
                            if x.abs() > threshold {
                                total -= (g * x.signum()) as f64;
                            }
                        });
                        accumulate(&mut grads, *t, scalar_tensor(total as f32));
                    }
                    if rg(a) {
                        let contribution = Zip::from(&g).and(val(a)).map_collect(|&g, &x| {
                            if x.abs() > threshold {
                                g
                            } else {
                                0.0
                            }
                        });
                        accumulate(&mut grads, *a, contribution);
                    }
                }
                Op::ShiftedDiv { input, shift, base } => {
                    let s = val(shift).iter().next().copied().unwrap_or(0.0);
                    let mut ga = g.clone();
                    for mut sample in ga.outer_iter_mut() {
                        Zip::from(&mut sample)
                            .and(&base.index_axis(Axis(0), 0))
                            .for_each(|v, &m| *v /= m + s);
                    }
                    if rg(shift) {
                        // d/ds [a / (m + s)] = -out / (m + s)
                        let total = -inner(&ga, &node.value);
                        accumulate(&mut grads, *shift, scalar_tensor(total));
                    }
                    if rg(input) {
                        accumulate(&mut grads, *input, ga);
                    }
                }
                Op::Pad { input, start } => {
                    let (h, w) = {
                        let d = val(input).dim();
                        (d.1, d.2)
                    };
                    let contribution = g
                        .slice(s![.., start.0..start.0 + h, start.1..start.1 + w, ..])
                        .to_owned();
                    accumulate(&mut grads, *input, contribution);
                }
                Op::Crop { input, start } => {
                    let (_, h, w, _) = g.dim();
                    let mut contribution = Array4::<f32>::zeros(val(input).raw_dim());
                    contribution
                        .slice_mut(s![.., start.0..start.0 + h, start.1..start.1 + w, ..])
                        .assign(&g);
                    accumulate(&mut grads, *input, contribution);
                }
                Op::Roll { input, shift } => {
                    let contribution =
                        roll_axis(&roll_axis(&g, Axis(1), -shift.0), Axis(2), -shift.1);
                    accumulate(&mut grads, *input, contribution);
                }
                Op::Diff { input, axis } => {
                    accumulate(&mut grads, *input, circular_diff_adjoint(&g, axis.axis()));
                }
                Op::DiffAdjoint { input, axis } => {
                    accumulate(&mut grads, *input, circular_diff(&g, axis.axis()));
                }
                Op::Conv { input, kernel } => {
                    let (_, p, q, _) = g.dim();
                    let fft = plan(plans, p, q);
                    if rg(input) {
                        let gx = filter_planes(&fft, &g, val(kernel), true)?;
                        accumulate(&mut grads, *input, gx);
                    }
                    if rg(kernel) {
                        let gh = cross_planes(&fft, &g, val(input), val(kernel).dim().0)?;
                        accumulate(&mut grads, *kernel, gh);
                    }
                }
                Op::Corr { input, kernel } => {
                    let (_, p, q, _) = g.dim();
                    let fft = plan(plans, p, q);
                    if rg(input) {
                        let gx = filter_planes(&fft, &g, val(kernel), false)?;
                        accumulate(&mut grads, *input, gx);
                    }
                    if rg(kernel) {
                        let gh = cross_planes(&fft, val(input), &g, val(kernel).dim().0)?;
                        accumulate(&mut grads, *kernel, gh);
                    }
                }
                Op::Solve {
                    rhs,
                    kernel,
                    mu1,
                    mu2,
                    mu3,
                } => {
                    let (_, p, q, _) = g.dim();
                    let fft = plan(plans, p, q);
                    let scalar = |v: &Var| val(v).iter().next().copied().unwrap_or(0.0);
                    let mu = (scalar(mu1), scalar(mu2), scalar(mu3));
                    let h = val(kernel);
                    let x = &node.value;
                    // the system matrix is symmetric, so the adjoint solve reuses it
                    let adj = solve_planes(&fft, &g, h, mu)?;
                    if rg(mu1) || rg(kernel) {
                        let hx = filter_planes(&fft, x, h, false)?;
                        if rg(mu1) {
                            let hthx = filter_planes(&fft, &hx, h, true)?;
                            accumulate(&mut grads, *mu1, scalar_tensor(-inner(&adj, &hthx)));
                        }
                        if rg(kernel) {
                            let hq = filter_planes(&fft, &adj, h, false)?;
                            let kb = h.dim().0;
                            let mut gh = cross_planes(&fft, &hx, &adj, kb)?;
                            gh += &cross_planes(&fft, &hq, x, kb)?;
                            accumulate(&mut grads, *kernel, gh * -mu.0);
                        }
                    }
                    if rg(mu2) {
                        let total = -inner(&adj, &difference_normal(x));
                        accumulate(&mut grads, *mu2, scalar_tensor(total));
                    }
                    if rg(mu3) {
                        accumulate(&mut grads, *mu3, scalar_tensor(-inner(&adj, x)));
                    }
                    if rg(rhs) {
                        accumulate(&mut grads, *rhs, adj);
                    }
                }
                Op::Outer { col, row } => {
                    let (cv, rv) = (val(col), val(row));
                    let summed = g.sum_axis(Axis(3)); // (1, h, w)
                    if rg(col) {
                        let h = cv.dim().1;
                        let contribution = Array4::from_shape_fn((1, h, 1, 1), |(_, i, _, _)| {
                            summed
                                .slice(s![0, i, ..])
                                .iter()
                                .zip(rv.slice(s![0, 0, .., 0]).iter())
                                .map(|(a, b)| a * b)
                                .sum()
                        });
                        accumulate(&mut grads, *col, contribution);
                    }
                    if rg(row) {
                        let w = rv.dim().2;
                        let contribution = Array4::from_shape_fn((1, 1, w, 1), |(_, _, j, _)| {
                            summed
                                .slice(s![0, .., j])
                                .iter()
                                .zip(cv.slice(s![0, .., 0, 0]).iter())
                                .map(|(a, b)| a * b)
                                .sum()
                        });
                        accumulate(&mut grads, *row, contribution);
                    }
                }
                Op::Conv3x3 { input, weight } => {
                    let x = val(input);
                    let wt = val(weight);
                    let (_, h, w, c_in) = x.dim();
                    let c_out = wt.dim().0;
                    let mut gx = Array4::<f32>::zeros(x.raw_dim());
                    let mut gw = Array4::<f32>::zeros(wt.raw_dim());
                    for di in 0..3 {
                        let (out_rows, in_rows) = shifted_ranges(h, di as isize - 1);
                        for dj in 0..3 {
                            let (out_cols, in_cols) = shifted_ranges(w, dj as isize - 1);
                            for o in 0..c_out {
                                let go = g.slice(s![.., out_rows.clone(), out_cols.clone(), o]);
                                for c in 0..c_in {
                                    let src = x.slice(s![.., in_rows.clone(), in_cols.clone(), c]);
                                    gw[[o, c, di, dj]] = inner(&go, &src);
                                    gx.slice_mut(s![.., in_rows.clone(), in_cols.clone(), c])
                                        .scaled_add(wt[[o, c, di, dj]], &go);
                                }
                            }
                        }
                    }
                    if rg(weight) {
                        accumulate(&mut grads, *weight, gw);
                    }
                    if rg(input) {
                        accumulate(&mut grads, *input, gx);
                    }
                }
                Op::BiasAdd { input, bias } => {
                    if rg(bias) {
                        let c = g.dim().3;
                        let per_channel = g
                            .sum_axis(Axis(0))
                            .sum_axis(Axis(0))
                            .sum_axis(Axis(0))
                            .into_shape_with_order((1, 1, 1, c))
                            .map_err(|e| LenslessError::Numeric(format!("bias gradient: {e}")))?;
                        accumulate(&mut grads, *bias, per_channel);
                    }
                    if rg(input) {
                        accumulate(&mut grads, *input, g);
                    }
                }
                Op::MaxNormalize { input, eps } => {
                    let x = val(input);
                    let mut gx = g.clone();
                    for (b, mut sample) in gx.outer_iter_mut().enumerate() {
                        let xs = x.index_axis(Axis(0), b);
                        let (arg, max) = xs.indexed_iter().fold(
                            (None, f32::NEG_INFINITY),
                            |(arg, max), (ix, &v)| {
                                if v > max {
                                    (Some(ix), v)
                                } else {
                                    (arg, max)
                                }
                            },
                        );
                        let denom = max + eps;
                        let dot = inner(&g.index_axis(Axis(0), b), &xs);
                        sample.mapv_inplace(|v| v / denom);
                        if let Some(ix) = arg {
                            sample[ix] -= dot / (denom * denom);
                        }
                    }
                    accumulate(&mut grads, *input, gx);
                }
            }
        }
        Ok(Gradients { grads })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math_tools::next_fast_len;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(shape: (usize, usize, usize, usize), seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        Array4::from_shape_fn(shape, |_| rng.gen::<f32>() - 0.5)
    }

    /// Compares analytic gradients of `⟨w, f(inputs)⟩` with central differences.
    fn check_gradients<F>(inputs: Vec<Tensor>, build: F, step: f32)
    where
        F: Fn(&mut Graph, &[Var]) -> Result<Var>,
    {
        let evaluate = |values: &[Tensor]| -> (Graph, Vec<Var>, Var) {
            let mut graph = Graph::new();
            let vars: Vec<Var> = values
                .iter()
                .map(|v| graph.leaf(v.clone(), true))
                .collect();
            let out = build(&mut graph, &vars).unwrap();
            (graph, vars, out)
        };
        let (mut graph, vars, out) = evaluate(&inputs);
        let weights = random(graph.value(out).dim(), 99);
        let objective = |values: &[Tensor]| {
            let (graph, _, out) = evaluate(values);
            inner(graph.value(out), &weights)
        };
        let grads = graph.backward(out, weights.clone()).unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        for (k, var) in vars.iter().enumerate() {
            let analytic = grads.get(*var).cloned().unwrap_or_else(|| Array4::zeros(inputs[k].raw_dim()));
            for _ in 0..4 {
                let flat = rng.gen_range(0..inputs[k].len());
                let mut plus = inputs.clone();
                let mut minus = inputs.clone();
                *plus[k].iter_mut().nth(flat).unwrap() += step;
                *minus[k].iter_mut().nth(flat).unwrap() -= step;
                let numeric = (objective(&plus) - objective(&minus)) / (2.0 * step);
                let exact = *analytic.iter().nth(flat).unwrap();
                assert!(
                    (numeric - exact).abs() <= 2e-2 * exact.abs().max(1.0),
                    "input {k}, index {flat}: numeric {numeric}, analytic {exact}"
                );
            }
        }
    }

    #[test]
    fn test_elementwise_gradients() {
        let a = random((2, 3, 3, 1), 1);
        let b = random((2, 3, 3, 1), 2);
        let s = Array4::from_elem((1, 1, 1, 1), 0.7);
        check_gradients(
            vec![a, b, s],
            |g, v| {
                let prod = g.mul(v[0], v[1])?;
                let scaled = g.scale(prod, v[2])?;
                let sum = g.add(scaled, v[0])?;
                let diff = g.sub(sum, v[1])?;
                Ok(g.relu(diff))
            },
            1e-3,
        );
    }

    #[test]
    fn test_soft_threshold_and_recip_gradients() {
        let a = random((1, 4, 4, 2), 3) * 4.0;
        let t = Array4::from_elem((1, 1, 1, 1), 0.3);
        check_gradients(
            vec![a, t.clone()],
            |g, v| g.soft_threshold(v[0], v[1]),
            1e-3,
        );
        let positive = Array4::from_elem((1, 1, 1, 1), 1.5);
        check_gradients(vec![positive], |g, v| Ok(g.recip(v[0])), 1e-3);
    }

    #[test]
    fn test_shifted_div_gradients() {
        let a = random((2, 4, 4, 1), 4);
        let base = Array4::from_shape_fn((1, 4, 4, 1), |(_, i, _, _)| if i < 2 { 1.0 } else { 0.0 });
        let s = Array4::from_elem((1, 1, 1, 1), 0.5);
        check_gradients(
            vec![a, s],
            move |g, v| g.shifted_div(v[0], base.clone(), v[1]),
            1e-3,
        );
    }

    #[test]
    fn test_conv_and_corr_gradients() {
        let x = random((2, 6, 5, 2), 6);
        let shared = random((1, 6, 5, 2), 7);
        check_gradients(vec![x.clone(), shared.clone()], |g, v| g.conv(v[0], v[1]), 1e-2);
        check_gradients(vec![x.clone(), shared], |g, v| g.corr(v[0], v[1]), 1e-2);
        let per_sample = random((2, 6, 5, 2), 8);
        check_gradients(vec![x, per_sample], |g, v| g.conv(v[0], v[1]), 1e-2);
    }

    #[test]
    fn test_solve_gradients() {
        let r = random((1, 6, 6, 1), 9);
        let h = random((1, 6, 6, 1), 10);
        let mu1 = Array4::from_elem((1, 1, 1, 1), 1.0);
        let mu2 = Array4::from_elem((1, 1, 1, 1), 0.5);
        let mu3 = Array4::from_elem((1, 1, 1, 1), 0.8);
        check_gradients(
            vec![r, h, mu1, mu2, mu3],
            |g, v| g.solve(v[0], v[1], v[2], v[3], v[4]),
            1e-3,
        );
    }

    #[test]
    fn test_solve_inverts_system() {
        let mut graph = Graph::new();
        let x_true = random((1, 8, 8, 1), 11);
        let h = graph.constant(random((1, 8, 8, 1), 12));
        let x = graph.constant(x_true.clone());
        let (mu1, mu2, mu3) = (
            graph.scalar_constant(1.0),
            graph.scalar_constant(0.3),
            graph.scalar_constant(0.2),
        );
        // r = mu1·HᵀHx + mu2·ΨᵀΨx + mu3·x
        let hx = graph.conv(x, h).unwrap();
        let hthx = graph.corr(hx, h).unwrap();
        let dr = graph.diff(x, SpatialAxis::Rows);
        let drt = graph.diff_adjoint(dr, SpatialAxis::Rows);
        let dc = graph.diff(x, SpatialAxis::Cols);
        let dct = graph.diff_adjoint(dc, SpatialAxis::Cols);
        let psi = graph.add(drt, dct).unwrap();
        let t1 = graph.scale(hthx, mu1).unwrap();
        let t2 = graph.scale(psi, mu2).unwrap();
        let t3 = graph.scale(x, mu3).unwrap();
        let partial = graph.add(t1, t2).unwrap();
        let r = graph.add(partial, t3).unwrap();
        let solved = graph.solve(r, h, mu1, mu2, mu3).unwrap();
        for (a, b) in graph.value(solved).iter().zip(x_true.iter()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn test_pad_crop_roll_diff_gradients() {
        let geometry = PaddingGeometry::new(4, 5);
        assert_eq!(geometry.padded, (next_fast_len(7), next_fast_len(9)));
        let x = random((2, 4, 5, 1), 13);
        check_gradients(
            vec![x],
            move |g, v| {
                let padded = g.pad(v[0], &geometry)?;
                let rolled = g.roll(padded, (-3, 2));
                let d = g.diff(rolled, SpatialAxis::Rows);
                let dt = g.diff_adjoint(d, SpatialAxis::Cols);
                g.crop(dt, &geometry)
            },
            1e-3,
        );
    }

    #[test]
    fn test_outer_conv3x3_bias_gradients() {
        let col = random((1, 4, 1, 1), 14);
        let row = random((1, 1, 5, 1), 15);
        check_gradients(vec![col, row], |g, v| g.outer(v[0], v[1], 2), 1e-3);

        let x = random((2, 5, 4, 2), 16);
        let w = random((3, 2, 3, 3), 17);
        let b = random((1, 1, 1, 3), 18);
        check_gradients(
            vec![x, w, b],
            |g, v| {
                let y = g.conv3x3(v[0], v[1])?;
                g.bias_add(y, v[2])
            },
            1e-3,
        );
    }

    #[test]
    fn test_max_normalize_gradients() {
        let x = random((2, 3, 3, 1), 19) + 1.0;
        check_gradients(vec![x], |g, v| Ok(g.max_normalize(v[0], 1e-12)), 1e-3);
    }

    #[test]
    fn test_constants_get_no_gradient() {
        let mut graph = Graph::new();
        let a = graph.constant(random((1, 2, 2, 1), 20));
        let b = graph.leaf(random((1, 2, 2, 1), 21), true);
        let c = graph.mul(a, b).unwrap();
        let grads = graph.backward(c, Array4::ones((1, 2, 2, 1))).unwrap();
        assert!(grads.get(a).is_none());
        assert_eq!(grads.get(b).unwrap(), graph.value(a));
    }

    #[test]
    fn test_shape_errors() {
        let mut graph = Graph::new();
        let a = graph.constant(Array4::zeros((1, 2, 2, 1)));
        let b = graph.constant(Array4::zeros((1, 3, 2, 1)));
        assert!(matches!(graph.add(a, b), Err(LenslessError::ShapeMismatch { .. })));
        assert!(graph.scale(a, b).is_err());
        assert!(graph.backward(a, Array4::zeros((1, 1, 1, 1))).is_err());
    }
}
