//! Weighted evaluation of a fitted model over a row source.

use crate::data::RowSource;
use crate::model::{ModelError, MultinomialModel};
use ndarray::Array2;
use thiserror::Error;

/// Probabilities are clipped to `[EPS, 1]` before taking the log.
const LOG_LOSS_EPS: f64 = 1e-15;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Label {label} is not a class of a {num_classes}-class model.")]
    UnknownLabel { label: f64, num_classes: usize },
    #[error("The evaluation data has no positive total weight.")]
    NoWeight,
}

/// Weighted classification quality. Every row contributes its instance weight.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationMetrics {
    /// Entry `[actual, predicted]` is the total weight of such rows.
    pub confusion: Array2<f64>,
    pub weight_sum: f64,
    /// Weighted mean of `-ln p(actual)`.
    pub log_loss: f64,
}

impl ClassificationMetrics {
    pub fn num_classes(&self) -> usize {
        self.confusion.nrows()
    }

    pub fn accuracy(&self) -> f64 {
        self.confusion.diag().sum() / self.weight_sum
    }

    /// Zero when the class was never predicted.
    pub fn precision(&self, class: usize) -> f64 {
        ratio(
            self.confusion[[class, class]],
            self.confusion.column(class).sum(),
        )
    }

    /// Zero when the class never occurs.
    pub fn recall(&self, class: usize) -> f64 {
        ratio(self.confusion[[class, class]], self.confusion.row(class).sum())
    }

    pub fn f1(&self, class: usize) -> f64 {
        let p = self.precision(class);
        let r = self.recall(class);
        ratio(2.0 * p * r, p + r)
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
struct MetricsAggregator {
    confusion: Array2<f64>,
    weight_sum: f64,
    log_loss_sum: f64,
}

impl MetricsAggregator {
    fn new(num_classes: usize) -> Self {
        Self {
            confusion: Array2::zeros((num_classes, num_classes)),
            weight_sum: 0.0,
            log_loss_sum: 0.0,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.confusion += &other.confusion;
        self.weight_sum += other.weight_sum;
        self.log_loss_sum += other.log_loss_sum;
        self
    }
}

/// Scores `model` on `data`. Labels must be class indices of the model.
pub fn evaluate<D: RowSource>(
    model: &MultinomialModel,
    data: &D,
) -> Result<ClassificationMetrics, MetricsError> {
    let num_classes = model.num_classes();
    let aggregate = data.reduce_rows(
        || Ok(MetricsAggregator::new(num_classes)),
        |acc: Result<MetricsAggregator, MetricsError>, row| {
            let mut acc = acc?;
            let label = row.label;
            if !(label >= 0.0 && label.fract() == 0.0 && (label as usize) < num_classes) {
                return Err(MetricsError::UnknownLabel { label, num_classes });
            }
            let actual = label as usize;
            let probabilities = model.predict_probability(row.features.view())?;
            let predicted = model.decide(probabilities.view());
            let p = probabilities[actual].clamp(LOG_LOSS_EPS, 1.0);
            acc.confusion[[actual, predicted]] += row.weight;
            acc.weight_sum += row.weight;
            acc.log_loss_sum -= row.weight * p.ln();
            Ok(acc)
        },
        |a, b| Ok(a?.merge(b?)),
    )?;

    if !(aggregate.weight_sum > 0.0) {
        return Err(MetricsError::NoWeight);
    }
    Ok(ClassificationMetrics {
        log_loss: aggregate.log_loss_sum / aggregate.weight_sum,
        confusion: aggregate.confusion,
        weight_sum: aggregate.weight_sum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryDataset, Instance};
    use crate::estimate::ModelConfig;
    use crate::postprocess::FittedParameters;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Predicts class 0 for negative inputs and class 1 otherwise.
    fn sign_model() -> MultinomialModel {
        MultinomialModel::new(
            ModelConfig::default(),
            FittedParameters {
                coefficients: array![[-5.0], [5.0]],
                intercepts: array![0.0, 0.0],
            },
            None,
        )
    }

    #[test]
    fn weighted_confusion_and_scores() {
        let data = InMemoryDataset::new(vec![
            Instance::weighted(0.0, 2.0, array![-1.0]),
            Instance::weighted(1.0, 1.0, array![1.0]),
            Instance::weighted(1.0, 1.0, array![-1.0]),
        ]);
        let metrics = evaluate(&sign_model(), &data).unwrap();

        assert_eq!(metrics.confusion, array![[2.0, 0.0], [1.0, 1.0]]);
        assert_abs_diff_eq!(metrics.accuracy(), 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(metrics.precision(0), 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(metrics.recall(0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(metrics.recall(1), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(metrics.f1(1), 2.0 / 3.0, epsilon = 1e-12);
        assert!(metrics.log_loss > 0.0);
    }

    #[test]
    fn log_loss_of_a_confident_correct_model_is_small() {
        let data = InMemoryDataset::new(vec![
            Instance::new(0.0, array![-3.0]),
            Instance::new(1.0, array![3.0]),
        ]);
        let metrics = evaluate(&sign_model(), &data).unwrap();
        assert!(metrics.log_loss < 1e-6);
        assert_eq!(metrics.accuracy(), 1.0);
    }

    #[test]
    fn confusion_follows_the_model_thresholds() {
        let data = InMemoryDataset::new(vec![Instance::new(1.0, array![0.5])]);
        let mut model = sign_model();
        let plain = evaluate(&model, &data).unwrap();
        assert_eq!(plain.confusion, array![[0.0, 0.0], [0.0, 1.0]]);

        model.set_thresholds(vec![1.0, 1000.0]).unwrap();
        let skewed = evaluate(&model, &data).unwrap();
        assert_eq!(skewed.confusion, array![[0.0, 0.0], [1.0, 0.0]]);
        assert_eq!(skewed.log_loss, plain.log_loss);
    }

    #[test]
    fn labels_outside_the_model_are_rejected() {
        let data = InMemoryDataset::new(vec![Instance::new(2.0, array![0.0])]);
        assert!(matches!(
            evaluate(&sign_model(), &data),
            Err(MetricsError::UnknownLabel { .. })
        ));
    }
}
