//! Paired measurement/ground-truth samples and mini-batching.

use crate::error::{LenslessError, Result};
use crate::operators::ConvolutionOperator;
use ndarray::{Array3, Array4, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Indexed collection of `(measurement, target)` pairs, both `H × W × C`.
pub trait Dataset: Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<(Array3<f32>, Array3<f32>)>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    measurements: Vec<Array3<f32>>,
    targets: Vec<Array3<f32>>,
}

impl InMemoryDataset {
    pub fn new(measurements: Vec<Array3<f32>>, targets: Vec<Array3<f32>>) -> Result<Self> {
        if measurements.len() != targets.len() {
            return Err(LenslessError::shape(
                "dataset pairs",
                &[measurements.len()],
                &[targets.len()],
            ));
        }
        if let Some(first) = measurements.first() {
            let shape = first.shape().to_vec();
            for sample in measurements.iter().chain(targets.iter()) {
                if sample.shape() != shape.as_slice() {
                    return Err(LenslessError::shape("dataset sample", &shape, sample.shape()));
                }
            }
        }
        Ok(InMemoryDataset {
            measurements,
            targets,
        })
    }

    /// Pairs every image with its noiseless lensless measurement through `psf`.
    pub fn simulate(psf: &Array3<f32>, images: Vec<Array3<f32>>) -> Result<Self> {
        let mut operator = ConvolutionOperator::new(psf)?;
        let measurements = images
            .iter()
            .map(|img| operator.apply_image(img))
            .collect::<Result<Vec<_>>>()?;
        InMemoryDataset::new(measurements, images)
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.measurements.len()
    }

    fn get(&self, index: usize) -> Result<(Array3<f32>, Array3<f32>)> {
        match (self.measurements.get(index), self.targets.get(index)) {
            (Some(m), Some(t)) => Ok((m.clone(), t.clone())),
            _ => Err(LenslessError::Usage(format!(
                "sample {index} out of range for a dataset of {}",
                self.len()
            ))),
        }
    }
}

/// Stacks equally shaped `H × W × C` images into an `N × H × W × C` batch.
pub fn stack(images: &[Array3<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView3<f32>> = images.iter().map(|img| img.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|err| {
        LenslessError::Usage(format!("cannot stack batch: {err}"))
    })
}

/// Sample indices split into batches, shuffled with a seeded generator.
pub fn shuffled_batches(len: usize, batch_size: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psf::delta_psf;

    #[test]
    fn test_simulate_with_delta_psf() {
        let img = Array3::from_shape_fn((6, 6, 1), |(i, j, _)| (i + j) as f32);
        let dataset = InMemoryDataset::simulate(&delta_psf(6, 6, 1), vec![img.clone()]).unwrap();
        let (m, t) = dataset.get(0).unwrap();
        assert_eq!(t, img);
        assert!(m.iter().zip(img.iter()).all(|(a, b)| (a - b).abs() < 1e-4));
        assert!(dataset.get(1).is_err());
    }

    #[test]
    fn test_mismatched_pairs_rejected() {
        let a = Array3::zeros((4, 4, 1));
        let b = Array3::zeros((4, 5, 1));
        assert!(InMemoryDataset::new(vec![a.clone()], vec![]).is_err());
        assert!(InMemoryDataset::new(vec![a], vec![b]).is_err());
    }

    #[test]
    fn test_batches_cover_every_index_once() {
        let batches = shuffled_batches(7, 3, 42);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        let mut all: Vec<usize> = batches.concat();
        all.sort_unstable();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
        assert_eq!(batches, shuffled_batches(7, 3, 42));
    }

    #[test]
    fn test_stack() {
        let batch = stack(&[Array3::zeros((2, 3, 1)), Array3::ones((2, 3, 1))]).unwrap();
        assert_eq!(batch.dim(), (2, 2, 3, 1));
        assert_eq!(batch[[1, 0, 0, 0]], 1.0);
        assert!(stack(&[Array3::zeros((2, 3, 1)), Array3::zeros((3, 3, 1))]).is_err());
    }
}
