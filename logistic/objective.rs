//! # Multinomial Logistic Loss
//!
//! Evaluates the mean weighted negative log-likelihood of a softmax model and its
//! gradient for a flattened parameter vector `θ`. The parameters live in the
//! *standardized* coordinate space: every feature is divided by its standard
//! deviation (and, when an intercept is fit, shifted by its mean) before it meets
//! a coefficient. `postprocess` maps the solution back onto the original scale,
//! so the change of variables never leaks into the fitted model.
//!
//! ## Parameter layout
//!
//! `θ` is class-major: coefficient `(k, f)` sits at `k * F + f`, followed by the
//! `K` intercepts when they are fit. See `ParameterLayout`.
//!
//! ## Numerical stability
//!
//! Per row the margins are shifted by `max(0, max_k m_k)` before exponentiating,
//! so `log Σ exp(m_k)` and the class probabilities stay finite for margins in the
//! thousands.

use crate::data::{Instance, RowSource};
use crate::regularization::ElasticNet;
use crate::summary::FeatureSummary;
use ndarray::{Array1, ArrayView1, Zip, s};

/// Maps `(class, feature)` pairs and intercepts onto positions of the flat `θ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub num_classes: usize,
    pub num_features: usize,
    pub fit_intercept: bool,
}

impl ParameterLayout {
    pub fn new(num_classes: usize, num_features: usize, fit_intercept: bool) -> Self {
        Self {
            num_classes,
            num_features,
            fit_intercept,
        }
    }

    /// Number of coefficient entries (`K * F`), excluding intercepts.
    pub fn num_coefficients(&self) -> usize {
        self.num_classes * self.num_features
    }

    /// Total length of `θ`.
    pub fn len(&self) -> usize {
        if self.fit_intercept {
            self.num_coefficients() + self.num_classes
        } else {
            self.num_coefficients()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn coefficient_index(&self, class: usize, feature: usize) -> usize {
        class * self.num_features + feature
    }

    #[inline]
    pub fn intercept_index(&self, class: usize) -> Option<usize> {
        self.fit_intercept
            .then(|| self.num_coefficients() + class)
    }

    /// The coefficient row of `class` inside `θ`.
    pub fn class_coefficients<'a>(
        &self,
        theta: ArrayView1<'a, f64>,
        class: usize,
    ) -> ArrayView1<'a, f64> {
        let start = class * self.num_features;
        theta.slice_move(s![start..start + self.num_features])
    }
}

/// The internal change of variables `z_f = (x_f - offset_f) / scale_f`.
///
/// Constant features keep `scale = 1` and `offset = 0`: they are passed through
/// untouched rather than divided by a vanishing deviation.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardizer {
    offset: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    /// Builds the transform from summarizer output. Means are subtracted only when
    /// `center` is set, which the caller does only when an intercept absorbs them.
    pub fn new(summary: &FeatureSummary, center: bool) -> Self {
        let num_features = summary.num_features();
        let std_dev = summary.std_dev();
        let mut offset = Array1::zeros(num_features);
        let mut scale = Array1::ones(num_features);
        for f in 0..num_features {
            if summary.is_constant(f) {
                continue;
            }
            scale[f] = std_dev[f];
            if center {
                offset[f] = summary.mean[f];
            }
        }
        Self { offset, scale }
    }

    /// A transform that leaves every feature unchanged.
    pub fn identity(num_features: usize) -> Self {
        Self {
            offset: Array1::zeros(num_features),
            scale: Array1::ones(num_features),
        }
    }

    pub fn offset(&self) -> ArrayView1<'_, f64> {
        self.offset.view()
    }

    pub fn scale(&self) -> ArrayView1<'_, f64> {
        self.scale.view()
    }

    pub fn transform_into(&self, features: ArrayView1<f64>, out: &mut Array1<f64>) {
        Zip::from(out)
            .and(features)
            .and(&self.offset)
            .and(&self.scale)
            .for_each(|z, &x, &offset, &scale| *z = (x - offset) / scale);
    }
}

/// Per-shard loss and gradient totals. Totals are unnormalized weighted sums so
/// that merging shards is a plain addition.
#[derive(Debug, Clone)]
pub struct MultinomialAggregator {
    pub loss_sum: f64,
    pub weight_sum: f64,
    pub gradient: Array1<f64>,
    standardized: Array1<f64>,
    margins: Array1<f64>,
}

impl MultinomialAggregator {
    pub fn new(layout: &ParameterLayout) -> Self {
        Self {
            loss_sum: 0.0,
            weight_sum: 0.0,
            gradient: Array1::zeros(layout.len()),
            standardized: Array1::zeros(layout.num_features),
            margins: Array1::zeros(layout.num_classes),
        }
    }

    /// Absorbs one row's contribution at parameters `theta`.
    pub fn add(
        mut self,
        row: &Instance,
        theta: ArrayView1<f64>,
        layout: &ParameterLayout,
        standardizer: &Standardizer,
    ) -> Self {
        let weight = row.weight;
        if weight == 0.0 {
            return self;
        }
        let label = row.label as usize;
        standardizer.transform_into(row.features.view(), &mut self.standardized);

        for k in 0..layout.num_classes {
            let mut margin = layout
                .class_coefficients(theta, k)
                .dot(&self.standardized);
            if let Some(i) = layout.intercept_index(k) {
                margin += theta[i];
            }
            self.margins[k] = margin;
        }

        let label_margin = self.margins[label];
        let max_margin = self.margins.fold(0.0f64, |m, &v| m.max(v));
        let mut sum_exp = 0.0;
        // From here on `margins` holds the shifted exponentials.
        self.margins.mapv_inplace(|m| {
            let e = (m - max_margin).exp();
            sum_exp += e;
            e
        });
        self.loss_sum += weight * (sum_exp.ln() + max_margin - label_margin);
        self.weight_sum += weight;

        for k in 0..layout.num_classes {
            let indicator = if k == label { 1.0 } else { 0.0 };
            let multiplier = weight * (self.margins[k] / sum_exp - indicator);
            let start = layout.coefficient_index(k, 0);
            self.gradient
                .slice_mut(s![start..start + layout.num_features])
                .scaled_add(multiplier, &self.standardized);
            if let Some(i) = layout.intercept_index(k) {
                self.gradient[i] += multiplier;
            }
        }
        self
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.loss_sum += other.loss_sum;
        self.weight_sum += other.weight_sum;
        self.gradient += &other.gradient;
        self
    }
}

/// Mean weighted multinomial loss plus the smooth (L2) part of the penalty.
///
/// The L1 part is not included here; the orthant-wise solver applies it.
pub struct MultinomialObjective<'a, D: RowSource> {
    data: &'a D,
    layout: ParameterLayout,
    standardizer: &'a Standardizer,
    regularization: &'a ElasticNet,
}

impl<'a, D: RowSource> MultinomialObjective<'a, D> {
    pub fn new(
        data: &'a D,
        layout: ParameterLayout,
        standardizer: &'a Standardizer,
        regularization: &'a ElasticNet,
    ) -> Self {
        Self {
            data,
            layout,
            standardizer,
            regularization,
        }
    }

    /// Unnormalized totals over every shard.
    pub fn aggregate(&self, theta: ArrayView1<f64>) -> MultinomialAggregator {
        let layout = &self.layout;
        let standardizer = self.standardizer;
        self.data.reduce_rows(
            || MultinomialAggregator::new(layout),
            |agg, row| agg.add(row, theta, layout, standardizer),
            MultinomialAggregator::merge,
        )
    }

    /// Returns `(loss, gradient)` at `theta`. A dataset whose total weight is zero
    /// yields a non-finite loss, which the optimizer treats as a failed step.
    pub fn evaluate(&self, theta: &Array1<f64>) -> (f64, Array1<f64>) {
        let agg = self.aggregate(theta.view());
        let mut gradient = agg.gradient / agg.weight_sum;
        let penalty = self
            .regularization
            .apply_smooth(&self.layout, theta.view(), &mut gradient);
        (agg.loss_sum / agg.weight_sum + penalty, gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryDataset;
    use crate::summary::summarize;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn toy_data() -> InMemoryDataset {
        InMemoryDataset::new(vec![
            Instance::weighted(0.0, 1.0, array![0.5, -1.0]),
            Instance::weighted(1.0, 2.0, array![1.5, 0.3]),
            Instance::weighted(2.0, 0.5, array![-0.7, 2.0]),
            Instance::weighted(1.0, 1.0, array![0.1, 0.1]),
            Instance::weighted(0.0, 1.5, array![-1.2, 0.8]),
        ])
    }

    fn numerical_gradient<F: Fn(&Array1<f64>) -> f64>(f: F, theta: &Array1<f64>) -> Array1<f64> {
        let h = 1e-6;
        Array1::from_shape_fn(theta.len(), |i| {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[i] += h;
            minus[i] -= h;
            (f(&plus) - f(&minus)) / (2.0 * h)
        })
    }

    #[test]
    fn zero_parameters_give_log_k_loss() {
        let data = toy_data();
        let summary = summarize(&data).unwrap();
        let layout = ParameterLayout::new(3, 2, true);
        let standardizer = Standardizer::new(&summary, true);
        let reg = ElasticNet::new(0.0, 0.0, true, standardizer.scale());
        let objective = MultinomialObjective::new(&data, layout, &standardizer, &reg);

        let (loss, _) = objective.evaluate(&Array1::zeros(layout.len()));
        assert_abs_diff_eq!(loss, 3.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn analytic_gradient_matches_finite_differences() {
        let data = toy_data();
        let summary = summarize(&data).unwrap();
        for &(fit_intercept, standardization) in
            &[(true, true), (false, true), (true, false), (false, false)]
        {
            let layout = ParameterLayout::new(3, 2, fit_intercept);
            let standardizer = Standardizer::new(&summary, fit_intercept);
            let reg = ElasticNet::new(0.3, 0.0, standardization, standardizer.scale());
            let objective = MultinomialObjective::new(&data, layout, &standardizer, &reg);

            let theta = Array1::from_shape_fn(layout.len(), |i| 0.3 * (i as f64) - 0.8);
            let (_, analytic) = objective.evaluate(&theta);
            let numeric = numerical_gradient(|t| objective.evaluate(t).0, &theta);
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                assert_abs_diff_eq!(a, n, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn large_margins_do_not_overflow() {
        let data = InMemoryDataset::new(vec![Instance::new(0.0, array![1.0])]);
        let layout = ParameterLayout::new(3, 1, false);
        let standardizer = Standardizer::identity(1);
        let reg = ElasticNet::new(0.0, 0.0, true, standardizer.scale());
        let objective = MultinomialObjective::new(&data, layout, &standardizer, &reg);

        let theta = array![1000.0, 2000.0, 3000.0];
        let (loss, gradient) = objective.evaluate(&theta);
        assert!(loss.is_finite());
        // The row belongs to class 0 but class 2 dominates: loss = 3000 - 1000.
        assert_abs_diff_eq!(loss, 2000.0, epsilon = 1e-9);
        assert_abs_diff_eq!(gradient[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(gradient[1], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(gradient[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_weight_rows_are_ignored() {
        let mut with_ghost = toy_data();
        with_ghost.push(Instance::weighted(2.0, 0.0, array![100.0, -100.0]));
        let data = toy_data();

        let layout = ParameterLayout::new(3, 2, true);
        let standardizer = Standardizer::identity(2);
        let reg = ElasticNet::new(0.0, 0.0, true, standardizer.scale());
        let theta = Array1::from_shape_fn(layout.len(), |i| 0.1 * i as f64);

        let (a, ga) = MultinomialObjective::new(&data, layout, &standardizer, &reg).evaluate(&theta);
        let (b, gb) =
            MultinomialObjective::new(&with_ghost, layout, &standardizer, &reg).evaluate(&theta);
        assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        for (x, y) in ga.iter().zip(gb.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-14);
        }
    }

    #[test]
    fn constant_features_pass_through_unscaled() {
        let data = InMemoryDataset::new(vec![
            Instance::new(0.0, array![2.0, 1.0]),
            Instance::new(1.0, array![2.0, 3.0]),
        ]);
        let summary = summarize(&data).unwrap();
        let standardizer = Standardizer::new(&summary, true);
        assert_eq!(standardizer.scale()[0], 1.0);
        assert_eq!(standardizer.offset()[0], 0.0);
        assert_abs_diff_eq!(standardizer.scale()[1], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(standardizer.offset()[1], 2.0, epsilon = 1e-12);

        let mut out = Array1::zeros(2);
        standardizer.transform_into(array![2.0, 3.0].view(), &mut out);
        assert_abs_diff_eq!(out[0], 2.0);
        assert_abs_diff_eq!(out[1], 1.0, epsilon = 1e-12);
    }
}
