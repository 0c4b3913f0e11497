//! Evaluation metrics, the benchmark over a held-out set, and the per-epoch metrics record.

use crate::config::{Crop, MetricKey};
use crate::error::{LenslessError, Result};
use crate::math_tools::max_normalize;
use crate::train::dataset::{stack, Dataset};
use crate::train::loss::PerceptualLoss;
use crate::unrolled::UnrolledSolver;
use cancellable_loops::par_map_cancellable;
use ndarray::{s, Array3, ArrayView2, Axis};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::AtomicBool;

pub const METRICS_FILE: &str = "metrics.json";

const SSIM_WINDOW: usize = 7;
const SSIM_K1: f32 = 0.01;
const SSIM_K2: f32 = 0.03;

pub fn mse(prediction: &Array3<f32>, target: &Array3<f32>) -> f32 {
    let n = prediction.len().max(1) as f64;
    (prediction.iter().zip(target.iter()).map(|(a, b)| ((a - b) as f64).powi(2)).sum::<f64>() / n) as f32
}

pub fn mae(prediction: &Array3<f32>, target: &Array3<f32>) -> f32 {
    let n = prediction.len().max(1) as f64;
    (prediction.iter().zip(target.iter()).map(|(a, b)| (a - b).abs() as f64).sum::<f64>() / n) as f32
}

/// PSNR in dB for images in `[0, 1]`; infinite for identical images.
pub fn psnr(prediction: &Array3<f32>, target: &Array3<f32>) -> f32 {
    let error = mse(prediction, target);
    if error == 0.0 {
        f32::INFINITY
    } else {
        -10.0 * error.log10()
    }
}

fn window_ssim(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> f32 {
    let n = a.len() as f32;
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
        cov += (x - mean_a) * (y - mean_b);
    }
    // sample statistics
    let norm = (n - 1.0).max(1.0);
    let (var_a, var_b, cov) = (var_a / norm, var_b / norm, cov / norm);
    let c1 = SSIM_K1 * SSIM_K1;
    let c2 = SSIM_K2 * SSIM_K2;
    ((2.0 * mean_a * mean_b + c1) * (2.0 * cov + c2))
        / ((mean_a * mean_a + mean_b * mean_b + c1) * (var_a + var_b + c2))
}

/// Mean structural similarity over 7×7 windows (smaller images use one window), averaged
/// over channels. Data range 1.
pub fn ssim(prediction: &Array3<f32>, target: &Array3<f32>) -> f32 {
    let (h, w, c) = prediction.dim();
    let wh = SSIM_WINDOW.min(h);
    let ww = SSIM_WINDOW.min(w);
    let mut total = 0.0f64;
    let mut count = 0usize;
    for ch in 0..c {
        let a = prediction.index_axis(Axis(2), ch);
        let b = target.index_axis(Axis(2), ch);
        for i in 0..=h - wh {
            for j in 0..=w - ww {
                let wa = a.slice(s![i..i + wh, j..j + ww]);
                let wb = b.slice(s![i..i + wh, j..j + ww]);
                total += window_ssim(&wa, &wb) as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        return 0.0;
    }
    (total / count as f64) as f32
}

/// Mean metrics over a held-out set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalMetrics {
    pub mse: f32,
    pub mae: f32,
    pub psnr: f32,
    pub ssim: f32,
    pub perceptual: Option<f32>,
}

/// Prepares one prediction/target pair the way the training loss sees it.
pub fn normalize_and_crop(image: &Array3<f32>, crop: Option<&Crop>) -> Result<Array3<f32>> {
    let normalized = max_normalize(image, 1e-12);
    match crop {
        Some(c) => {
            c.validate(image.dim().0, image.dim().1)?;
            Ok(normalized
                .slice(s![c.vertical.0..c.vertical.1, c.horizontal.0..c.horizontal.1, ..])
                .to_owned())
        }
        None => Ok(normalized),
    }
}

/// Runs the solver over `dataset` and averages MSE, MAE, PSNR, SSIM (and the perceptual
/// metric) over all samples.
///
/// # Returns
/// `None` if the abort flag interrupted the evaluation.
pub fn benchmark(
    solver: &mut UnrolledSolver,
    dataset: &dyn Dataset,
    batch_size: usize,
    crop: Option<&Crop>,
    perceptual: Option<&dyn PerceptualLoss>,
    abort_flag: &AtomicBool,
) -> Result<Option<EvalMetrics>> {
    if dataset.is_empty() {
        return Err(LenslessError::Usage("benchmark on an empty dataset".to_string()));
    }
    let batch_size = batch_size.max(1);
    let mut sums = [0.0f64; 5];
    let mut count = 0usize;
    let indices: Vec<usize> = (0..dataset.len()).collect();
    for chunk in indices.chunks(batch_size) {
        let mut measurements = Vec::with_capacity(chunk.len());
        let mut targets = Vec::with_capacity(chunk.len());
        for &i in chunk {
            let (m, t) = dataset.get(i)?;
            measurements.push(m);
            targets.push(t);
        }
        let predictions = solver.batch_call(&stack(&measurements)?)?;
        let pairs = predictions
            .outer_iter()
            .zip(targets.iter())
            .map(|(p, t)| Ok((normalize_and_crop(&p.to_owned(), crop)?, normalize_and_crop(t, crop)?)))
            .collect::<Result<Vec<(Array3<f32>, Array3<f32>)>>>()?;
        let scores = par_map_cancellable(pairs, abort_flag, |(p, t)| {
            let perceptual_score = match perceptual {
                Some(loss) => {
                    let p4 = p.clone().insert_axis(Axis(0));
                    let t4 = t.clone().insert_axis(Axis(0));
                    Some(loss.evaluate(&p4, &t4).map(|(v, _)| v))
                }
                None => None,
            };
            (mse(&p, &t), mae(&p, &t), psnr(&p, &t), ssim(&p, &t), perceptual_score)
        });
        let Some(scores) = scores else {
            log::info!("evaluation aborted");
            return Ok(None);
        };
        for (mse, mae, psnr, ssim, perceptual_score) in scores {
            let perceptual_score = perceptual_score.transpose()?.unwrap_or(0.0);
            for (sum, value) in sums.iter_mut().zip([mse, mae, psnr, ssim, perceptual_score]) {
                *sum += value as f64;
            }
            count += 1;
        }
    }
    let mean = sums.map(|s| (s / count as f64) as f32);
    log::debug!(
        "evaluated {count} samples: MSE {:.4e}, PSNR {:.2} dB, SSIM {:.4}",
        mean[0],
        mean[2],
        mean[3]
    );
    Ok(Some(EvalMetrics {
        mse: mean[0],
        mae: mean[1],
        psnr: mean[2],
        ssim: mean[3],
        perceptual: perceptual.map(|_| mean[4]),
    }))
}

/// Ordered per-epoch metrics with the run's scalar fields.
///
/// Serialised to `metrics.json` with the series first (`LOSS`, `MSE`, `MAE`, `PSNR`, `SSIM`,
/// then the perceptual metric), followed by `n_iter`, `algorithm`, `metric_for_best_model`,
/// `best_epoch` and `best_eval_score`. Non-finite scores are written as `null`.
#[derive(Debug, Clone)]
pub struct Metrics {
    keys: Vec<String>,
    series: Vec<Vec<f32>>,
    n_iter: usize,
    algorithm: String,
    metric_for_best_model: Option<MetricKey>,
    best_epoch: usize,
    best_eval_score: f32,
}

impl Metrics {
    pub fn new(
        n_iter: usize,
        algorithm: &str,
        metric_for_best_model: Option<MetricKey>,
        perceptual_name: Option<&str>,
    ) -> Result<Self> {
        if metric_for_best_model == Some(MetricKey::Perceptual) && perceptual_name.is_none() {
            return Err(LenslessError::Configuration(
                "metric_for_best_model is PERCEPTUAL but no perceptual loss is configured".to_string(),
            ));
        }
        let mut keys: Vec<String> = [MetricKey::Loss, MetricKey::Mse, MetricKey::Mae, MetricKey::Psnr, MetricKey::Ssim]
            .iter()
            .map(|k| k.to_string())
            .collect();
        if let Some(name) = perceptual_name {
            keys.push(name.to_string());
        }
        let higher_is_better = metric_for_best_model
            .map(|k| k.higher_is_better())
            .unwrap_or(false);
        Ok(Metrics {
            series: vec![Vec::new(); keys.len()],
            keys,
            n_iter,
            algorithm: algorithm.to_string(),
            metric_for_best_model,
            best_epoch: 0,
            best_eval_score: if higher_is_better { 0.0 } else { f32::INFINITY },
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn series(&self, key: &str) -> Option<&[f32]> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|i| self.series[i].as_slice())
    }

    /// Number of recorded epochs.
    pub fn len(&self) -> usize {
        self.series.first().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_eval_score(&self) -> f32 {
        self.best_eval_score
    }

    pub fn metric_for_best_model(&self) -> Option<MetricKey> {
        self.metric_for_best_model
    }

    /// Appends one epoch: the mean training loss and the evaluation metrics.
    pub fn push_epoch(&mut self, loss: f32, eval: &EvalMetrics) -> Result<()> {
        let perceptual_expected = self.keys.len() > 5;
        if perceptual_expected != eval.perceptual.is_some() {
            return Err(LenslessError::Usage(
                "evaluation metrics do not match the metrics record keys".to_string(),
            ));
        }
        let mut row = vec![loss, eval.mse, eval.mae, eval.psnr, eval.ssim];
        row.extend(eval.perceptual);
        for (series, value) in self.series.iter_mut().zip(row) {
            series.push(value);
        }
        Ok(())
    }

    /// Records `score` for `epoch` if it beats the best so far.
    ///
    /// # Returns
    /// `true` for a new best.
    pub fn update_best(&mut self, epoch: usize, score: f32) -> bool {
        let higher_is_better = self
            .metric_for_best_model
            .map(|k| k.higher_is_better())
            .unwrap_or(false);
        let better = if higher_is_better {
            score > self.best_eval_score
        } else {
            score < self.best_eval_score
        };
        if better {
            self.best_eval_score = score;
            self.best_epoch = epoch;
        }
        better
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let file = File::create(dir.join(METRICS_FILE))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

impl Serialize for Metrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.keys.len() + 5))?;
        for (key, series) in self.keys.iter().zip(&self.series) {
            map.serialize_entry(key, series)?;
        }
        map.serialize_entry("n_iter", &self.n_iter)?;
        map.serialize_entry("algorithm", &self.algorithm)?;
        map.serialize_entry("metric_for_best_model", &self.metric_for_best_model)?;
        map.serialize_entry("best_epoch", &self.best_epoch)?;
        map.serialize_entry("best_eval_score", &self.best_eval_score)?;
        map.end()
    }
}
