//! Picks the best of a fixed set of candidate models for a task.
//!
//! Model fitting itself lives behind [`Estimator`]; this module only splits the
//! data, scales it and compares held-out scores.

use crate::error::AutoMlError;

use log::{ debug, info };
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{ Deserialize, Serialize };
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const TEST_FRACTION: f64 = 0.2;

pub type EstimatorError = Box<dyn std::error::Error + Send + Sync>;

/// Hyper-parameter name to the values to try.
pub type ParamGrid = HashMap<String, Vec<serde_json::Value>>;

/// Candidate name (`logistic`, `rf`, `xgb`, `kmeans`) to its grid.
pub type CustomParams = HashMap<String, ParamGrid>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Classification,
    Regression,
    Clustering,
}

impl TaskKind {
    /// Candidate names in evaluation order.
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            TaskKind::Classification => &["logistic", "rf", "xgb"],
            TaskKind::Regression => &["xgb"],
            TaskKind::Clustering => &["kmeans"],
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Classification => "classification",
            TaskKind::Regression => "regression",
            TaskKind::Clustering => "clustering",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskKind {
    type Err = AutoMlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "classification" => Ok(TaskKind::Classification),
            "regression" => Ok(TaskKind::Regression),
            "clustering" => Ok(TaskKind::Clustering),
            _ => Err(AutoMlError::UnknownTask(s.to_string())),
        }
    }
}

pub trait Estimator: Send {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[f64]) -> Result<(), EstimatorError>;

    /// Higher is better.
    fn score(&self, features: &[Vec<f64>], labels: &[f64]) -> Result<f64, EstimatorError>;

    /// Searches `grid` and keeps the best configuration fitted on the data.
    fn tune(
        &mut self,
        features: &[Vec<f64>],
        labels: &[f64],
        _grid: &ParamGrid
    ) -> Result<(), EstimatorError> {
        self.fit(features, labels)
    }
}

/// Builds an untrained estimator for a candidate name, or `None` when the
/// candidate is not available.
pub trait EstimatorFactory {
    fn build(&self, task: TaskKind, name: &str) -> Option<Box<dyn Estimator>>;
}

impl<F> EstimatorFactory for F where F: Fn(TaskKind, &str) -> Option<Box<dyn Estimator>> {
    fn build(&self, task: TaskKind, name: &str) -> Option<Box<dyn Estimator>> {
        self(task, name)
    }
}

/// Per-column standardization (zero mean, unit population variance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(features: &[Vec<f64>]) -> Result<Self, AutoMlError> {
        let width = check_rectangular(features)?;
        let n = features.len() as f64;

        let mut mean = vec![0.0; width];
        for row in features {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| {
            *m /= n;
        });

        let mut scale = vec![0.0; width];
        for row in features {
            for ((s, v), m) in scale.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2);
            }
        }
        for s in scale.iter_mut() {
            let std = (*s / n).sqrt();
            // Constant columns are left unscaled.
            *s = if std == 0.0 { 1.0 } else { std };
        }

        Ok(Self { mean, scale })
    }

    pub fn transform(&self, features: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, AutoMlError> {
        features
            .iter()
            .enumerate()
            .map(|(row, values)| {
                if values.len() != self.mean.len() {
                    return Err(AutoMlError::RaggedFeatures {
                        row,
                        expected: self.mean.len(),
                        found: values.len(),
                    });
                }
                Ok(
                    values
                        .iter()
                        .zip(self.mean.iter().zip(&self.scale))
                        .map(|(v, (m, s))| (v - m) / s)
                        .collect()
                )
            })
            .collect()
    }
}

fn check_rectangular(features: &[Vec<f64>]) -> Result<usize, AutoMlError> {
    let first = features.first().ok_or(AutoMlError::EmptyDataset)?;
    let width = first.len();
    for (row, values) in features.iter().enumerate() {
        if values.len() != width {
            return Err(AutoMlError::RaggedFeatures { row, expected: width, found: values.len() });
        }
    }
    Ok(width)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train_features: Vec<Vec<f64>>,
    pub train_labels: Vec<f64>,
    pub test_features: Vec<Vec<f64>>,
    pub test_labels: Vec<f64>,
}

/// Shuffles the rows and holds out `ceil(n * test_fraction)` of them.
pub fn train_test_split<R: Rng + ?Sized>(
    features: &[Vec<f64>],
    labels: &[f64],
    test_fraction: f64,
    rng: &mut R
) -> Result<Split, AutoMlError> {
    if features.is_empty() {
        return Err(AutoMlError::EmptyDataset);
    }
    if features.len() != labels.len() {
        return Err(AutoMlError::LengthMismatch {
            features: features.len(),
            labels: labels.len(),
        });
    }
    let n = features.len();
    if n < 2 {
        return Err(AutoMlError::TooFewSamples(n));
    }

    let n_test = ((n as f64) * test_fraction).ceil().clamp(1.0, (n - 1) as f64) as usize;
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let (test_idx, train_idx) = indices.split_at(n_test);

    let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<f64>) {
        idx.iter()
            .map(|&i| (features[i].clone(), labels[i]))
            .unzip()
    };
    let (train_features, train_labels) = pick(train_idx);
    let (test_features, test_labels) = pick(test_idx);

    Ok(Split { train_features, train_labels, test_features, test_labels })
}

pub struct AutoMlResult {
    pub best_name: String,
    pub best_model: Box<dyn Estimator>,
    pub scaler: StandardScaler,
    pub best_score: f64,
}

impl fmt::Debug for AutoMlResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMlResult")
            .field("best_name", &self.best_name)
            .field("scaler", &self.scaler)
            .field("best_score", &self.best_score)
            .finish_non_exhaustive()
    }
}

pub fn auto_ml(
    features: &[Vec<f64>],
    labels: &[f64],
    task: TaskKind,
    params: Option<&CustomParams>,
    factory: &dyn EstimatorFactory
) -> Result<AutoMlResult, AutoMlError> {
    auto_ml_with_rng(features, labels, task, params, factory, &mut rand::thread_rng())
}

/// Fits every candidate for `task` on the scaled training split and keeps the
/// one with the highest held-out score. Ties keep the earlier candidate.
///
/// When `params` is given every candidate goes through [`Estimator::tune`] with
/// its own grid (empty when the map has no entry for it).
pub fn auto_ml_with_rng<R: Rng + ?Sized>(
    features: &[Vec<f64>],
    labels: &[f64],
    task: TaskKind,
    params: Option<&CustomParams>,
    factory: &dyn EstimatorFactory,
    rng: &mut R
) -> Result<AutoMlResult, AutoMlError> {
    check_rectangular(features)?;
    let split = train_test_split(features, labels, TEST_FRACTION, rng)?;
    let scaler = StandardScaler::fit(&split.train_features)?;
    let train = scaler.transform(&split.train_features)?;
    let test = scaler.transform(&split.test_features)?;
    info!(
        "AutoML {}: {} train / {} test rows, candidates {:?}",
        task,
        train.len(),
        test.len(),
        task.candidates()
    );

    let empty = ParamGrid::new();
    let mut best: Option<(String, Box<dyn Estimator>, f64)> = None;

    for &name in task.candidates() {
        let mut model = factory
            .build(task, name)
            .ok_or_else(|| AutoMlError::UnknownCandidate(name.to_string()))?;
        let failed = |e: EstimatorError| AutoMlError::Estimator {
            name: name.to_string(),
            message: e.to_string(),
        };

        match params {
            Some(custom) => {
                let grid = custom.get(name).unwrap_or(&empty);
                model.tune(&train, &split.train_labels, grid).map_err(failed)?;
            }
            None => model.fit(&train, &split.train_labels).map_err(failed)?,
        }

        let score = model.score(&test, &split.test_labels).map_err(failed)?;
        debug!("Candidate {} scored {}", name, score);

        let improves = match &best {
            Some((_, _, best_score)) => score > *best_score,
            None => score > f64::NEG_INFINITY,
        };
        if improves {
            best = Some((name.to_string(), model, score));
        }
    }

    let (best_name, best_model, best_score) = best.ok_or(AutoMlError::NoScore)?;
    info!("AutoML {} picked {} (score {})", task, best_name, best_score);
    Ok(AutoMlResult { best_name, best_model, scaler, best_score })
}
