// logistic/estimate.rs

//! # Model Estimation
//!
//! `train_model` runs the full fit:
//!
//! 1.  **Validate** the configuration.
//! 2.  **Summarize** the rows once (means, variances, class histogram) and resolve
//!     the class space from the declared count or the labels.
//! 3.  **Short-circuit** when a single class carries all the weight and an intercept
//!     is fit: the maximum-likelihood model is then known in closed form.
//! 4.  **Optimize** the mean weighted softmax loss plus elastic-net penalty in
//!     standardized coordinates, with L-BFGS when the penalty is smooth and OWL-QN
//!     when it has an L1 part.
//! 5.  **Post-process** the solution back to the original feature scale and center
//!     it.

use crate::data::{self, DataError, RowSource};
use crate::model::{ModelError, MultinomialModel};
use crate::objective::{MultinomialObjective, ParameterLayout, Standardizer};
use crate::optimizer::{DEFAULT_HISTORY_SIZE, Minimizer, OptimizerStatus, SearchStrategy};
use crate::postprocess::{self, FittedParameters};
use crate::regularization::ElasticNet;
use crate::summary::{self, ClassSpace, FeatureSummary, SummaryError};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "The total instance weight is {0}; at least one row must have a positive weight."
    )]
    NoTrainingWeight(f64),

    #[error("Failed to load training data: {0}")]
    Data(#[from] DataError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl From<SummaryError> for EstimationError {
    fn from(err: SummaryError) -> Self {
        EstimationError::InvalidArgument(err.to_string())
    }
}

fn default_label_col() -> String {
    "label".to_string()
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

/// Hyperparameters of a fit. Persisted with the model as its parameter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub fit_intercept: bool,
    /// Penalize standardized coefficients (scale-invariant penalty) rather than
    /// original-scale ones.
    pub standardization: bool,
    /// Overall penalty strength λ ≥ 0.
    pub reg_param: f64,
    /// L1/L2 mix α ∈ [0, 1]: 0 is ridge, 1 is lasso.
    pub elastic_net_param: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Number of curvature pairs kept by the quasi-Newton solver.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Declared class count; inferred from the labels when absent.
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(default = "default_label_col")]
    pub label_col: String,
    #[serde(default)]
    pub weight_col: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fit_intercept: true,
            standardization: true,
            reg_param: 0.0,
            elastic_net_param: 0.0,
            max_iterations: 100,
            tolerance: 1e-6,
            history_size: DEFAULT_HISTORY_SIZE,
            num_classes: None,
            label_col: default_label_col(),
            weight_col: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), EstimationError> {
        if !self.reg_param.is_finite() || self.reg_param < 0.0 {
            return Err(EstimationError::InvalidArgument(format!(
                "regParam must be a finite value >= 0, got {}",
                self.reg_param
            )));
        }
        if !(0.0..=1.0).contains(&self.elastic_net_param) {
            return Err(EstimationError::InvalidArgument(format!(
                "elasticNetParam must be in [0, 1], got {}",
                self.elastic_net_param
            )));
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(EstimationError::InvalidArgument(format!(
                "tol must be a finite value > 0, got {}",
                self.tolerance
            )));
        }
        if self.history_size == 0 {
            return Err(EstimationError::InvalidArgument(
                "history size of the quasi-Newton solver must be positive".to_string(),
            ));
        }
        if self.num_classes == Some(0) {
            return Err(EstimationError::InvalidArgument(
                "numClasses must be positive when declared".to_string(),
            ));
        }
        Ok(())
    }
}

/// Diagnostics of a fit. Kept on the model in memory but never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Objective value at the start and after every iteration.
    pub objective_history: Vec<f64>,
    pub total_iterations: usize,
    pub status: OptimizerStatus,
}

/// The main entry point for model training.
pub fn train_model<D: RowSource>(
    data: &D,
    config: &ModelConfig,
) -> Result<MultinomialModel, EstimationError> {
    config.validate()?;
    log::info!(
        "Starting multinomial logistic regression on {} rows (regParam = {}, elasticNetParam = {}).",
        data.num_rows(),
        config.reg_param,
        config.elastic_net_param
    );

    let summary = summary::summarize(data)?;
    let class_space = ClassSpace::resolve(config.num_classes, &summary)?;
    let num_classes = class_space.num_classes;
    let num_features = summary.num_features();
    if !(summary.weight_sum > 0.0) {
        return Err(EstimationError::NoTrainingWeight(summary.weight_sum));
    }
    log::info!(
        "{} features, {} classes ({}), total weight {:.6}.",
        num_features,
        num_classes,
        if class_space.inferred {
            "inferred from labels"
        } else {
            "declared"
        },
        summary.weight_sum
    );

    let observed = summary.observed_classes();
    if let [only_class] = observed.as_slice() {
        if config.fit_intercept {
            log::warn!(
                "All labels are class {only_class} and fitIntercept=true; the coefficients will be zero and no optimization is needed."
            );
            return Ok(MultinomialModel::new(
                config.clone(),
                internal::constant_label_parameters(*only_class, num_classes, num_features),
                Some(TrainingSummary {
                    objective_history: Vec::new(),
                    total_iterations: 0,
                    status: OptimizerStatus::Converged,
                }),
            ));
        }
        log::warn!(
            "All labels are class {only_class} but fitIntercept=false; fitting coefficients anyway."
        );
    }

    let (fitted, training_summary) = internal::optimize(data, &summary, num_classes, config);
    Ok(MultinomialModel::new(
        config.clone(),
        fitted,
        Some(training_summary),
    ))
}

/// Loads a TSV training file using the label and weight columns named in
/// `config` and fits a model that remembers the feature column names.
pub fn train_from_file(
    path: &str,
    config: &ModelConfig,
) -> Result<MultinomialModel, EstimationError> {
    config.validate()?;
    let training =
        data::load_training_data(path, &config.label_col, config.weight_col.as_deref())?;
    let model = train_model(&training.dataset, config)?;
    Ok(model.with_feature_names(training.feature_names)?)
}

/// Internal module for estimation implementation details.
mod internal {
    use super::*;

    /// The closed-form model for data with a single observed class: margin `+∞`
    /// for that class and `0` elsewhere.
    pub(super) fn constant_label_parameters(
        class: usize,
        num_classes: usize,
        num_features: usize,
    ) -> FittedParameters {
        let mut intercepts = Array1::zeros(num_classes);
        intercepts[class] = f64::INFINITY;
        FittedParameters {
            coefficients: Array2::zeros((num_classes, num_features)),
            intercepts,
        }
    }

    pub(super) fn optimize<D: RowSource>(
        data: &D,
        summary: &FeatureSummary,
        num_classes: usize,
        config: &ModelConfig,
    ) -> (FittedParameters, TrainingSummary) {
        let layout = ParameterLayout::new(num_classes, summary.num_features(), config.fit_intercept);
        let standardizer = Standardizer::new(summary, config.fit_intercept);
        let regularization = ElasticNet::new(
            config.reg_param,
            config.elastic_net_param,
            config.standardization,
            standardizer.scale(),
        );
        let strategy = SearchStrategy::for_l1_weights(regularization.l1_weights(&layout));
        log::info!(
            "Optimizing {} parameters with {}.",
            layout.len(),
            match strategy {
                SearchStrategy::Smooth => "L-BFGS",
                SearchStrategy::OrthantWise { .. } => "OWL-QN",
            }
        );

        let objective = MultinomialObjective::new(data, layout, &standardizer, &regularization);
        let solution = Minimizer::new(Array1::zeros(layout.len()), |theta: &Array1<f64>| {
            objective.evaluate(theta)
        })
        .with_strategy(strategy)
        .with_tolerance(config.tolerance)
        .with_max_iterations(config.max_iterations)
        .with_history_size(config.history_size)
        .run();

        match solution.status {
            OptimizerStatus::Converged => log::info!(
                "Converged after {} iterations with objective {:.8}.",
                solution.iterations,
                solution.final_value
            ),
            OptimizerStatus::MaxIterationsReached => log::warn!(
                "Stopped at maxIter = {} with objective {:.8}; the model may not be fully converged.",
                solution.iterations,
                solution.final_value
            ),
            OptimizerStatus::Failed => log::warn!(
                "Optimizer could not make further progress after {} iterations; returning the best parameters found.",
                solution.iterations
            ),
        }

        let fitted = postprocess::finalize(
            solution.final_point.view(),
            &layout,
            &standardizer,
            !regularization.has_l1(),
        );
        let training_summary = TrainingSummary {
            objective_history: solution.objective_history,
            total_iterations: solution.iterations,
            status: solution.status,
        };
        (fitted, training_summary)
    }
}
