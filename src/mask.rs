//! Trainable masks: PSFs that are differentiable functions of their parameters.

use crate::config::{MaskConfig, MaskKind};
use crate::error::{LenslessError, Result};
use crate::graph::{Graph, Var};
use crate::nn::Parameter;
use crate::psf::validate_psf;
use ndarray::{s, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait TrainableMask {
    /// Short identifier used in checkpoint file names.
    fn name(&self) -> &str;

    /// PSF as a `1 × H × W × C` graph value of the mask parameters.
    fn psf(&mut self, graph: &mut Graph) -> Result<Var>;

    /// PSF from the current parameter values.
    fn current_psf(&self) -> Array3<f32>;

    /// Projects the parameters back onto their valid set.
    fn project(&mut self);

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter));

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter));
}

fn clip_unit(p: &mut Parameter) {
    p.value_mut().mapv_inplace(|v| v.clamp(0.0, 1.0));
}

/// Mask whose parameter is the PSF itself.
#[derive(Debug, Clone)]
pub struct TrainablePsf {
    psf: Parameter,
}

impl TrainablePsf {
    pub fn new(initial: &Array3<f32>) -> Result<Self> {
        validate_psf(initial)?;
        let value = initial.clone().insert_axis(Axis(0));
        let mut mask = TrainablePsf {
            psf: Parameter::new("psf", value),
        };
        mask.project();
        Ok(mask)
    }
}

impl TrainableMask for TrainablePsf {
    fn name(&self) -> &str {
        "psf"
    }

    fn psf(&mut self, graph: &mut Graph) -> Result<Var> {
        Ok(self.psf.bind(graph))
    }

    fn current_psf(&self) -> Array3<f32> {
        self.psf.value().index_axis(Axis(0), 0).to_owned()
    }

    fn project(&mut self) {
        clip_unit(&mut self.psf);
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        visitor(&self.psf);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        visitor(&mut self.psf);
    }
}

/// Separable coded aperture: `psf[i, j, c] = col[i] · row[j]`.
#[derive(Debug, Clone)]
pub struct SeparableMask {
    col: Parameter,
    row: Parameter,
    channels: usize,
}

impl SeparableMask {
    /// Random binary-like profiles in `[0, 1]`.
    pub fn random(shape: (usize, usize, usize), seed: u64) -> Result<Self> {
        let (h, w, c) = shape;
        if h == 0 || w == 0 || c == 0 {
            return Err(LenslessError::Configuration(format!(
                "mask shape must be non-empty, got {shape:?}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let col: Vec<f32> = (0..h).map(|_| rng.gen::<f32>()).collect();
        let row: Vec<f32> = (0..w).map(|_| rng.gen::<f32>()).collect();
        Self::from_profiles(&col, &row, c)
    }

    pub fn from_profiles(col: &[f32], row: &[f32], channels: usize) -> Result<Self> {
        if col.is_empty() || row.is_empty() || channels == 0 {
            return Err(LenslessError::Configuration(
                "mask profiles and channel count must be non-empty".to_string(),
            ));
        }
        if col.iter().chain(row.iter()).any(|v| !v.is_finite()) {
            return Err(LenslessError::Configuration(
                "mask profiles must be finite".to_string(),
            ));
        }
        let col = Array4::from_shape_fn((1, col.len(), 1, 1), |(_, i, _, _)| col[i]);
        let row = Array4::from_shape_fn((1, 1, row.len(), 1), |(_, _, j, _)| row[j]);
        let mut mask = SeparableMask {
            col: Parameter::new("col", col),
            row: Parameter::new("row", row),
            channels,
        };
        mask.project();
        Ok(mask)
    }
}

impl TrainableMask for SeparableMask {
    fn name(&self) -> &str {
        "separable"
    }

    fn psf(&mut self, graph: &mut Graph) -> Result<Var> {
        let col = self.col.bind(graph);
        let row = self.row.bind(graph);
        graph.outer(col, row, self.channels)
    }

    fn current_psf(&self) -> Array3<f32> {
        let col = self.col.value().slice(s![0, .., 0, 0]).to_owned();
        let row = self.row.value().slice(s![0, 0, .., 0]).to_owned();
        Array3::from_shape_fn((col.len(), row.len(), self.channels), |(i, j, _)| {
            col[i] * row[j]
        })
    }

    fn project(&mut self) {
        clip_unit(&mut self.col);
        clip_unit(&mut self.row);
    }

    fn visit_parameters(&self, visitor: &mut dyn FnMut(&Parameter)) {
        visitor(&self.col);
        visitor(&self.row);
    }

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&mut Parameter)) {
        visitor(&mut self.col);
        visitor(&mut self.row);
    }
}

/// Builds the mask described by `config`, initialised from `psf` (its shape for separable masks).
pub fn build_mask(config: &MaskConfig, psf: &Array3<f32>) -> Result<Box<dyn TrainableMask>> {
    Ok(match config.kind {
        MaskKind::Psf => Box::new(TrainablePsf::new(psf)?),
        MaskKind::Separable => Box::new(SeparableMask::random(psf.dim(), config.seed)?),
    })
}
