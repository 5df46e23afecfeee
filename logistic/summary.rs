//! # Feature Summarizer
//!
//! One pass over the training rows produces everything the optimizer needs to
//! know before its first iteration: weighted per-feature means and population
//! variances, the weighted class histogram, and the total weight. The pass runs
//! through `RowSource::reduce_rows`, so the accumulator merge uses Chan's
//! pairwise update and never depends on shard order.
//!
//! Rows with weight zero are validated and counted (their label still widens the
//! inferred class space) but contribute nothing to any statistic.

use crate::data::{Instance, RowSource};
use ndarray::{Array1, Zip};
use thiserror::Error;

/// Labels above this bound are rejected instead of growing the histogram.
const MAX_CLASS_INDEX: usize = 1 << 20;

/// Relative spread below which a feature is treated as constant.
const CONSTANT_FEATURE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SummaryError {
    #[error("The training data contains no rows.")]
    EmptyDataset,
    #[error(
        "Row has {found} features, but earlier rows have {expected}. All rows must share one schema."
    )]
    InconsistentFeatureCount { found: usize, expected: usize },
    #[error("Labels must be non-negative integer class indices (below 2^20), found {0}.")]
    InvalidLabel(f64),
    #[error("Instance weights must be finite and non-negative, found {0}.")]
    InvalidWeight(f64),
    #[error(
        "numClasses was declared as {declared}, but labels up to {max_label} were observed ({required} classes required)."
    )]
    ClassCountTooSmall {
        declared: usize,
        max_label: usize,
        required: usize,
    },
    #[error("numClasses must be positive.")]
    NoClasses,
}

/// Mergeable per-shard accumulator.
#[derive(Debug, Clone, Default)]
struct FeatureSummarizer {
    num_rows: usize,
    num_features: Option<usize>,
    weight_sum: f64,
    mean: Array1<f64>,
    m2: Array1<f64>,
    class_weights: Vec<f64>,
}

impl FeatureSummarizer {
    fn add(mut self, row: &Instance) -> Result<Self, SummaryError> {
        let weight = row.weight;
        if !weight.is_finite() || weight < 0.0 {
            return Err(SummaryError::InvalidWeight(weight));
        }
        let label = row.label;
        if !label.is_finite()
            || label < 0.0
            || label.fract() != 0.0
            || label >= MAX_CLASS_INDEX as f64
        {
            return Err(SummaryError::InvalidLabel(label));
        }

        let num_features = row.features.len();
        match self.num_features {
            None => {
                self.num_features = Some(num_features);
                self.mean = Array1::zeros(num_features);
                self.m2 = Array1::zeros(num_features);
            }
            Some(expected) if expected != num_features => {
                return Err(SummaryError::InconsistentFeatureCount {
                    found: num_features,
                    expected,
                });
            }
            Some(_) => {}
        }

        let class = label as usize;
        if self.class_weights.len() <= class {
            self.class_weights.resize(class + 1, 0.0);
        }
        self.class_weights[class] += weight;
        self.num_rows += 1;

        if weight > 0.0 {
            self.weight_sum += weight;
            let ratio = weight / self.weight_sum;
            Zip::from(&mut self.mean)
                .and(&mut self.m2)
                .and(&row.features)
                .for_each(|mean, m2, &x| {
                    let delta = x - *mean;
                    *mean += delta * ratio;
                    *m2 += weight * delta * (x - *mean);
                });
        }
        Ok(self)
    }

    fn merge(mut self, other: Self) -> Result<Self, SummaryError> {
        let Some(other_features) = other.num_features else {
            return Ok(self);
        };
        let Some(features) = self.num_features else {
            return Ok(other);
        };
        if features != other_features {
            return Err(SummaryError::InconsistentFeatureCount {
                found: other_features,
                expected: features,
            });
        }

        if self.class_weights.len() < other.class_weights.len() {
            self.class_weights.resize(other.class_weights.len(), 0.0);
        }
        for (total, w) in self.class_weights.iter_mut().zip(&other.class_weights) {
            *total += w;
        }
        self.num_rows += other.num_rows;

        if other.weight_sum > 0.0 {
            if self.weight_sum == 0.0 {
                self.mean = other.mean;
                self.m2 = other.m2;
                self.weight_sum = other.weight_sum;
            } else {
                let total = self.weight_sum + other.weight_sum;
                let cross = self.weight_sum * other.weight_sum / total;
                let ratio = other.weight_sum / total;
                Zip::from(&mut self.mean)
                    .and(&mut self.m2)
                    .and(&other.mean)
                    .and(&other.m2)
                    .for_each(|mean, m2, &other_mean, &other_m2| {
                        let delta = other_mean - *mean;
                        *mean += delta * ratio;
                        *m2 += other_m2 + delta * delta * cross;
                    });
                self.weight_sum = total;
            }
        }
        Ok(self)
    }
}

/// Statistics produced by a single summarizer pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSummary {
    /// Number of rows seen, including zero-weight rows.
    pub num_rows: usize,
    pub weight_sum: f64,
    pub mean: Array1<f64>,
    /// Weighted population variance.
    pub variance: Array1<f64>,
    /// Weighted label histogram; its length is `max(label) + 1`.
    pub class_weights: Vec<f64>,
}

impl FeatureSummary {
    pub fn num_features(&self) -> usize {
        self.mean.len()
    }

    pub fn std_dev(&self) -> Array1<f64> {
        self.variance.mapv(f64::sqrt)
    }

    /// Whether feature `f` has (effectively) zero variance and must not be scaled.
    pub fn is_constant(&self, f: usize) -> bool {
        let variance = self.variance[f];
        variance <= 0.0 || variance.sqrt() <= CONSTANT_FEATURE_TOLERANCE * self.mean[f].abs()
    }

    /// The class count implied by the labels alone.
    pub fn inferred_num_classes(&self) -> usize {
        self.class_weights.len()
    }

    /// Classes carrying positive weight, ascending.
    pub fn observed_classes(&self) -> Vec<usize> {
        self.class_weights
            .iter()
            .enumerate()
            .filter(|&(_, &w)| w > 0.0)
            .map(|(k, _)| k)
            .collect()
    }
}

/// Runs the summarizer over every row of `data`.
pub fn summarize<D: RowSource>(data: &D) -> Result<FeatureSummary, SummaryError> {
    let summarizer = data.reduce_rows(
        || Ok(FeatureSummarizer::default()),
        |acc: Result<FeatureSummarizer, SummaryError>, row| acc.and_then(|s| s.add(row)),
        |a, b| match (a, b) {
            (Ok(a), Ok(b)) => a.merge(b),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
    )?;

    if summarizer.num_features.is_none() {
        return Err(SummaryError::EmptyDataset);
    }
    let variance = if summarizer.weight_sum > 0.0 {
        summarizer.m2.mapv(|m2| (m2 / summarizer.weight_sum).max(0.0))
    } else {
        Array1::zeros(summarizer.m2.len())
    };

    Ok(FeatureSummary {
        num_rows: summarizer.num_rows,
        weight_sum: summarizer.weight_sum,
        mean: summarizer.mean,
        variance,
        class_weights: summarizer.class_weights,
    })
}

/// The number of classes a model is fit over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassSpace {
    pub num_classes: usize,
    /// True when no declared count was supplied and the count came from the labels.
    pub inferred: bool,
}

impl ClassSpace {
    /// Uses the declared class count when present, otherwise `max(label) + 1`.
    /// A declared count must cover every observed label.
    pub fn resolve(declared: Option<usize>, summary: &FeatureSummary) -> Result<Self, SummaryError> {
        let required = summary.inferred_num_classes();
        match declared {
            Some(0) => Err(SummaryError::NoClasses),
            Some(k) if k < required => Err(SummaryError::ClassCountTooSmall {
                declared: k,
                max_label: required - 1,
                required,
            }),
            Some(k) => Ok(Self {
                num_classes: k,
                inferred: false,
            }),
            None => Ok(Self {
                num_classes: required,
                inferred: true,
            }),
        }
    }
}
