// logistic/model.rs

use crate::estimate::{ModelConfig, TrainingSummary};
use crate::postprocess::FittedParameters;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// A fitted multinomial logistic regression model.
///
/// Coefficients and intercepts are on the original feature scale, so prediction
/// is a plain affine map followed by a softmax. The optional per-class
/// thresholds only change which class `predict` picks and may be replaced at any
/// time without retraining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultinomialModel {
    num_classes: usize,
    num_features: usize,
    #[serde(default)]
    feature_names: Vec<String>,
    #[serde(default)]
    thresholds: Option<Vec<f64>>,
    /// The hyperparameters the model was fit with.
    config: ModelConfig,
    /// Shape: `[num_classes, num_features]`.
    coefficients: Array2<f64>,
    /// Shape: `[num_classes]`. May hold `+∞` for a class that was the only one observed.
    intercepts: Array1<f64>,
    #[serde(skip)]
    summary: Option<TrainingSummary>,
}

/// A comprehensive error type for model persistence and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Input has {found} features, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),
    #[error(
        "Model file is inconsistent: expected {expected} {what}, found {found}. The file may be corrupt or from a different model."
    )]
    InconsistentShape {
        what: &'static str,
        found: usize,
        expected: usize,
    },
}

/// The per-row output of `MultinomialModel::predict_batch`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPrediction {
    /// Shape: `[n_samples, num_classes]`.
    pub raw: Array2<f64>,
    /// Shape: `[n_samples, num_classes]`; every row sums to 1.
    pub probabilities: Array2<f64>,
    pub predictions: Vec<usize>,
}

impl MultinomialModel {
    pub(crate) fn new(
        config: ModelConfig,
        fitted: FittedParameters,
        summary: Option<TrainingSummary>,
    ) -> Self {
        let FittedParameters {
            coefficients,
            intercepts,
        } = fitted;
        Self {
            num_classes: coefficients.nrows(),
            num_features: coefficients.ncols(),
            feature_names: Vec::new(),
            thresholds: None,
            config,
            coefficients,
            intercepts,
            summary,
        }
    }

    /// Attaches the names of the feature columns, in coefficient order.
    pub fn with_feature_names(mut self, feature_names: Vec<String>) -> Result<Self, ModelError> {
        if feature_names.len() != self.num_features {
            return Err(ModelError::MismatchedFeatureCount {
                found: feature_names.len(),
                expected: self.num_features,
            });
        }
        self.feature_names = feature_names;
        Ok(self)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn coefficient_matrix(&self) -> ArrayView2<'_, f64> {
        self.coefficients.view()
    }

    /// Coefficients flattened class-major: entry `k * num_features + f`.
    pub fn coefficients(&self) -> Array1<f64> {
        self.coefficients.iter().copied().collect()
    }

    pub fn intercepts(&self) -> ArrayView1<'_, f64> {
        self.intercepts.view()
    }

    pub fn thresholds(&self) -> Option<&[f64]> {
        self.thresholds.as_deref()
    }

    /// Diagnostics of the fit. Absent for models loaded from disk.
    pub fn summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }

    /// Sets the per-class decision thresholds. There must be exactly one per
    /// class and each must be a finite positive number.
    pub fn set_thresholds(&mut self, thresholds: Vec<f64>) -> Result<(), ModelError> {
        validate_thresholds(&thresholds, self.num_classes)?;
        self.thresholds = Some(thresholds);
        Ok(())
    }

    pub fn clear_thresholds(&mut self) {
        self.thresholds = None;
    }

    /// Per-class margins `β_k · x + b_k`.
    pub fn predict_raw(&self, features: ArrayView1<f64>) -> Result<Array1<f64>, ModelError> {
        self.check_feature_count(features.len())?;
        Ok(self.margins(features))
    }

    pub fn predict_probability(
        &self,
        features: ArrayView1<f64>,
    ) -> Result<Array1<f64>, ModelError> {
        Ok(raw_to_probability(self.predict_raw(features)?.view()))
    }

    /// The predicted class: `argmax_k p_k / T_k` with thresholds, `argmax_k p_k`
    /// without. Ties go to the lowest class index.
    pub fn predict(&self, features: ArrayView1<f64>) -> Result<usize, ModelError> {
        let probabilities = self.predict_probability(features)?;
        Ok(self.decide(probabilities.view()))
    }

    /// Margins, probabilities and predicted classes for every row of `features`.
    pub fn predict_batch(&self, features: ArrayView2<f64>) -> Result<BatchPrediction, ModelError> {
        self.check_feature_count(features.ncols())?;
        let mut raw = features.dot(&self.coefficients.t());
        raw += &self.intercepts;

        let mut probabilities = Array2::zeros(raw.raw_dim());
        Zip::from(probabilities.rows_mut())
            .and(raw.rows())
            .par_for_each(|mut p, r| p.assign(&raw_to_probability(r)));

        let predictions = probabilities
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|p| self.decide(p))
            .collect();

        Ok(BatchPrediction {
            raw,
            probabilities,
            predictions,
        })
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        log::info!("Model saved to '{path}'");
        Ok(())
    }

    /// Loads a model from a TOML file and checks that its shapes agree.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: Self = toml::from_str(&toml_string)?;
        model.check_consistency()?;
        Ok(model)
    }

    fn margins(&self, features: ArrayView1<f64>) -> Array1<f64> {
        self.coefficients.dot(&features) + &self.intercepts
    }

    /// Applies the thresholds (if any) to a probability vector.
    pub(crate) fn decide(&self, probabilities: ArrayView1<f64>) -> usize {
        match &self.thresholds {
            Some(thresholds) => argmax(
                probabilities
                    .iter()
                    .zip(thresholds)
                    .map(|(&p, &t)| p / t),
            ),
            None => argmax(probabilities.iter().copied()),
        }
    }

    fn check_feature_count(&self, found: usize) -> Result<(), ModelError> {
        if found != self.num_features {
            return Err(ModelError::MismatchedFeatureCount {
                found,
                expected: self.num_features,
            });
        }
        Ok(())
    }

    fn check_consistency(&self) -> Result<(), ModelError> {
        let checks = [
            ("coefficient rows", self.coefficients.nrows(), self.num_classes),
            ("coefficient columns", self.coefficients.ncols(), self.num_features),
            ("intercepts", self.intercepts.len(), self.num_classes),
        ];
        for (what, found, expected) in checks {
            if found != expected {
                return Err(ModelError::InconsistentShape {
                    what,
                    found,
                    expected,
                });
            }
        }
        if !self.feature_names.is_empty() && self.feature_names.len() != self.num_features {
            return Err(ModelError::InconsistentShape {
                what: "feature names",
                found: self.feature_names.len(),
                expected: self.num_features,
            });
        }
        if let Some(thresholds) = &self.thresholds {
            validate_thresholds(thresholds, self.num_classes)?;
        }
        Ok(())
    }
}

fn validate_thresholds(thresholds: &[f64], num_classes: usize) -> Result<(), ModelError> {
    if thresholds.len() != num_classes {
        return Err(ModelError::InvalidThresholds(format!(
            "expected {} thresholds (one per class), got {}",
            num_classes,
            thresholds.len()
        )));
    }
    if let Some((k, t)) = thresholds
        .iter()
        .enumerate()
        .find(|&(_, &t)| !(t > 0.0 && t.is_finite()))
    {
        return Err(ModelError::InvalidThresholds(format!(
            "threshold for class {k} is {t}; every threshold must be a finite value > 0"
        )));
    }
    Ok(())
}

/// First index of the largest value.
fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

/// Softmax of a margin vector without overflow.
///
/// Margins are shifted by their maximum before exponentiation. When some margins
/// are `+∞` the probability mass is split evenly among them and every other
/// class gets exactly zero.
pub fn raw_to_probability(raw: ArrayView1<f64>) -> Array1<f64> {
    let infinite = raw.iter().filter(|&&m| m == f64::INFINITY).count();
    if infinite > 0 {
        let share = 1.0 / infinite as f64;
        return raw.mapv(|m| if m == f64::INFINITY { share } else { 0.0 });
    }

    let max = raw.fold(f64::NEG_INFINITY, |m, &x| m.max(x));
    let mut probabilities = raw.mapv(|m| (m - max).exp());
    let total = probabilities.sum();
    probabilities /= total;
    probabilities
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn small_model() -> MultinomialModel {
        MultinomialModel::new(
            ModelConfig::default(),
            FittedParameters {
                coefficients: array![[1.0, -0.5], [0.0, 0.25], [-1.0, 0.25]],
                intercepts: array![0.1, -0.3, 0.2],
            },
            None,
        )
    }

    #[test]
    fn softmax_of_huge_margins_does_not_overflow() {
        let p = raw_to_probability(array![1000.0, 2000.0, 3000.0].view());
        assert_eq!(p, array![0.0, 0.0, 1.0]);
    }

    #[test]
    fn softmax_of_negative_margins() {
        let p = raw_to_probability(array![-1.0, -2.0, -3.0].view());
        assert_abs_diff_eq!(p[0], 0.66524096, epsilon = 1e-8);
        assert_abs_diff_eq!(p[1], 0.24472847, epsilon = 1e-8);
        assert_abs_diff_eq!(p[2], 0.09003057, epsilon = 1e-8);
    }

    #[test]
    fn softmax_with_infinite_margin() {
        let p = raw_to_probability(array![0.0, 0.0, 0.0, 0.0, f64::INFINITY].view());
        assert_eq!(p, array![0.0, 0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn raw_margins_are_affine_in_the_features() {
        let model = small_model();
        let raw = model.predict_raw(array![2.0, 4.0].view()).unwrap();
        assert_abs_diff_eq!(raw[0], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(raw[1], 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(raw[2], -0.8, epsilon = 1e-12);
        assert_eq!(model.predict(array![2.0, 4.0].view()).unwrap(), 1);
    }

    #[test]
    fn feature_count_is_checked() {
        let model = small_model();
        let err = model.predict_raw(array![1.0].view()).unwrap_err();
        assert!(matches!(
            err,
            ModelError::MismatchedFeatureCount {
                found: 1,
                expected: 2
            }
        ));
    }

    #[test]
    fn thresholds_rescale_the_decision() {
        let mut model = small_model();
        let x = array![2.0, 4.0];
        model.set_thresholds(vec![0.01, 1.0, 1.0]).unwrap();
        assert_eq!(model.predict(x.view()).unwrap(), 0);

        model.set_thresholds(vec![3.0, 3.0, 3.0]).unwrap();
        assert_eq!(model.predict(x.view()).unwrap(), 1);

        model.clear_thresholds();
        assert!(model.thresholds().is_none());
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let mut model = small_model();
        for bad in [vec![1.0, 1.0], vec![1.0, 0.0, 1.0], vec![1.0, -2.0, 1.0]] {
            assert!(matches!(
                model.set_thresholds(bad),
                Err(ModelError::InvalidThresholds(_))
            ));
        }
        assert!(model.thresholds().is_none());
    }

    #[test]
    fn ties_go_to_the_lowest_class() {
        assert_eq!(argmax([0.25, 0.5, 0.5, 0.25].into_iter()), 1);
    }

    #[test]
    fn batch_prediction_matches_single_rows() {
        let model = small_model();
        let x = array![[2.0, 4.0], [-1.0, 0.0], [0.0, 10.0]];
        let batch = model.predict_batch(x.view()).unwrap();
        for (i, row) in x.axis_iter(Axis(0)).enumerate() {
            let p = model.predict_probability(row).unwrap();
            for k in 0..3 {
                assert_abs_diff_eq!(batch.probabilities[[i, k]], p[k], epsilon = 1e-12);
            }
            assert_abs_diff_eq!(batch.probabilities.row(i).sum(), 1.0, epsilon = 1e-12);
            assert_eq!(batch.predictions[i], model.predict(row).unwrap());
        }
    }

    #[test]
    fn save_and_load_round_trip_is_exact() {
        let mut model = MultinomialModel::new(
            ModelConfig {
                reg_param: 0.1,
                elastic_net_param: 0.3,
                ..Default::default()
            },
            FittedParameters {
                coefficients: array![[0.1 + 0.2, -1.0 / 3.0], [1e-300, 7.123456789012345]],
                intercepts: array![std::f64::consts::PI, -std::f64::consts::PI],
            },
            None,
        )
        .with_feature_names(vec!["x1".to_string(), "x2".to_string()])
        .unwrap();
        model.set_thresholds(vec![0.5, 2.0]).unwrap();

        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        model.save(path).unwrap();
        let loaded = MultinomialModel::load(path).unwrap();

        assert_eq!(loaded.num_classes(), 2);
        assert_eq!(loaded.num_features(), 2);
        assert_eq!(loaded.coefficients(), model.coefficients());
        assert_eq!(loaded.intercepts(), model.intercepts());
        assert_eq!(loaded.feature_names(), model.feature_names());
        assert_eq!(loaded.thresholds(), Some(&[0.5, 2.0][..]));
        assert_eq!(loaded.config(), model.config());
        assert!(loaded.summary().is_none());
    }

    #[test]
    fn infinite_intercepts_survive_persistence() {
        let model = MultinomialModel::new(
            ModelConfig::default(),
            FittedParameters {
                coefficients: Array2::zeros((3, 1)),
                intercepts: array![0.0, 0.0, f64::INFINITY],
            },
            None,
        );
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        model.save(path).unwrap();
        let loaded = MultinomialModel::load(path).unwrap();
        assert_eq!(loaded.intercepts()[2], f64::INFINITY);
        assert_eq!(loaded.predict(array![5.0].view()).unwrap(), 2);
    }
}
