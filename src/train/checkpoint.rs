//! Parameter snapshots written during training.
//!
//! For a label such as `BEST` or `3`, a save directory receives:
//! - `recon_epoch{label}.npz`: every parameter of the unrolled solver, by name;
//! - `mask_{param}_epoch{label}.npy`: each trainable mask parameter;
//! - `psf_epoch{label}.npy`: the PSF produced by the mask.

use crate::error::{LenslessError, Result};
use crate::mask::TrainableMask;
use crate::nn::Module;
use crate::unrolled::UnrolledSolver;
use ndarray::{Ix4, OwnedRepr};
use ndarray_npy::{write_npy, NpzReader, NpzWriter};
use std::fs::File;
use std::path::{Path, PathBuf};

pub fn recon_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("recon_epoch{label}.npz"))
}

pub fn mask_path(dir: &Path, param: &str, label: &str) -> PathBuf {
    dir.join(format!("mask_{param}_epoch{label}.npy"))
}

pub fn psf_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("psf_epoch{label}.npy"))
}

/// Writes the solver parameters and, when present, the mask parameters and PSF.
pub fn save_checkpoint(
    dir: &Path,
    label: &str,
    solver: &UnrolledSolver,
    mask: Option<&dyn TrainableMask>,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut npz = NpzWriter::new(File::create(recon_path(dir, label))?);
    let mut result = Ok(());
    solver.visit_parameters(&mut |p| {
        if result.is_ok() {
            result = npz.add_array(p.name(), p.value());
        }
    });
    result?;
    npz.finish()?;

    if let Some(mask) = mask {
        let mut result = Ok(());
        mask.visit_parameters(&mut |p| {
            if result.is_ok() {
                result = write_npy(mask_path(dir, p.name(), label), p.value());
            }
        });
        result?;
        write_npy(psf_path(dir, label), &mask.current_psf())?;
    }
    log::debug!("saved checkpoint {label} to {}", dir.display());
    Ok(())
}

/// Restores the solver parameters from a `recon_epoch*.npz` file.
///
/// Every parameter of the solver must be present with its current shape.
pub fn load_checkpoint(path: &Path, solver: &mut UnrolledSolver) -> Result<()> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let names = npz.names()?;
    let mut result = Ok(());
    solver.visit_parameters_mut(&mut |p| {
        if result.is_err() {
            return;
        }
        let entry = names
            .iter()
            .find(|n| n.as_str() == p.name() || n.strip_suffix(".npy") == Some(p.name()));
        result = match entry {
            None => Err(LenslessError::Usage(format!(
                "parameter {} missing from {}",
                p.name(),
                path.display()
            ))),
            Some(entry) => match npz.by_name::<OwnedRepr<f32>, Ix4>(entry) {
                Ok(value) if value.shape() == p.value().shape() => {
                    p.value_mut().assign(&value);
                    Ok(())
                }
                Ok(value) => Err(LenslessError::shape(p.name(), p.value().shape(), value.shape())),
                Err(err) => Err(err.into()),
            },
        };
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Method, UnrolledConfig};
    use crate::mask::SeparableMask;
    use crate::psf::gaussian_psf;
    use ndarray_npy::read_npy;
    use ndarray::Array3;

    fn solver() -> UnrolledSolver {
        UnrolledSolver::new(
            &gaussian_psf(6, 6, 1, 1.0),
            &UnrolledConfig {
                method: Method::UnrolledFista,
                n_iter: 3,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_save_then_load_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let original = solver();
        let mask = SeparableMask::from_profiles(&[0.2; 6], &[0.5; 6], 1).unwrap();
        save_checkpoint(dir.path(), "BEST", &original, Some(&mask as &dyn TrainableMask)).unwrap();

        assert!(recon_path(dir.path(), "BEST").exists());
        assert!(mask_path(dir.path(), "col", "BEST").exists());
        assert!(mask_path(dir.path(), "row", "BEST").exists());
        let psf: Array3<f32> = read_npy(psf_path(dir.path(), "BEST")).unwrap();
        assert_eq!(psf, mask.current_psf());

        let mut restored = solver();
        restored.visit_parameters_mut(&mut |p| p.value_mut().fill(0.0));
        load_checkpoint(&recon_path(dir.path(), "BEST"), &mut restored).unwrap();
        let mut expected = Vec::new();
        original.visit_parameters(&mut |p| expected.push(p.item()));
        let mut found = Vec::new();
        restored.visit_parameters(&mut |p| found.push(p.item()));
        assert_eq!(expected, found);
    }

    #[test]
    fn test_load_rejects_other_architecture() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(dir.path(), "1", &solver(), None).unwrap();
        assert!(!psf_path(dir.path(), "1").exists());
        let mut admm = UnrolledSolver::new(
            &gaussian_psf(6, 6, 1, 1.0),
            &UnrolledConfig {
                method: Method::UnrolledAdmm,
                n_iter: 3,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(load_checkpoint(&recon_path(dir.path(), "1"), &mut admm).is_err());
    }
}
