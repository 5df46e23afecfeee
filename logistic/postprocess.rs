//! Maps an optimizer solution from standardized coordinates back onto the
//! original feature scale and fixes the softmax identifiability.
//!
//! Adding the same constant to every class's coefficient for a feature (or to
//! every intercept) leaves the probabilities unchanged, so the reported model is
//! recentered to have zero-sum columns.

use crate::objective::{ParameterLayout, Standardizer};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Coefficients (`[K, F]`) and intercepts (`[K]`) on the original feature scale.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedParameters {
    pub coefficients: Array2<f64>,
    pub intercepts: Array1<f64>,
}

/// `β_orig[k][f] = β_std[k][f] / σ_f` and
/// `b_orig[k] = b_std[k] - Σ_f β_std[k][f] · μ_f / σ_f`.
pub fn unstandardize(
    theta: ArrayView1<f64>,
    layout: &ParameterLayout,
    standardizer: &Standardizer,
) -> FittedParameters {
    let scale = standardizer.scale();
    let offset = standardizer.offset();
    let mut coefficients = Array2::zeros((layout.num_classes, layout.num_features));
    let mut intercepts = Array1::zeros(layout.num_classes);

    for k in 0..layout.num_classes {
        let standardized = layout.class_coefficients(theta, k);
        let mut row = coefficients.row_mut(k);
        row.assign(&(&standardized / &scale));
        if let Some(i) = layout.intercept_index(k) {
            intercepts[k] = theta[i] - row.dot(&offset);
        }
    }
    FittedParameters {
        coefficients,
        intercepts,
    }
}

/// Subtracts the across-class mean from every coefficient column.
pub fn center_coefficients(coefficients: &mut Array2<f64>) {
    if coefficients.nrows() == 0 {
        return;
    }
    if let Some(column_means) = coefficients.mean_axis(Axis(0)) {
        *coefficients -= &column_means.insert_axis(Axis(0));
    }
}

/// Subtracts the mean intercept from every intercept.
pub fn center_intercepts(intercepts: &mut Array1<f64>) {
    if let Some(mean) = intercepts.mean() {
        *intercepts -= mean;
    }
}

/// Full post-processing: un-standardize, then center the intercepts (when fit)
/// and, if requested, the coefficient columns.
///
/// Coefficient centering is skipped when an L1 penalty is active: subtracting a
/// column mean would turn the exact zeros found by the orthant-wise solver into
/// small non-zero values.
pub fn finalize(
    theta: ArrayView1<f64>,
    layout: &ParameterLayout,
    standardizer: &Standardizer,
    center_coefs: bool,
) -> FittedParameters {
    let mut fitted = unstandardize(theta, layout, standardizer);
    if center_coefs {
        center_coefficients(&mut fitted.coefficients);
    }
    if layout.fit_intercept {
        center_intercepts(&mut fitted.intercepts);
    }
    fitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryDataset, Instance};
    use crate::summary::summarize;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn unstandardized_margins_match_standardized_margins() {
        let data = InMemoryDataset::new(vec![
            Instance::new(0.0, array![1.0, 10.0, 5.0]),
            Instance::new(1.0, array![3.0, 30.0, 5.0]),
            Instance::new(2.0, array![2.0, 50.0, 5.0]),
        ]);
        let summary = summarize(&data).unwrap();
        let standardizer = Standardizer::new(&summary, true);
        let layout = ParameterLayout::new(3, 3, true);
        let theta = Array1::from_shape_fn(layout.len(), |i| (i as f64 * 0.7).sin());

        let fitted = unstandardize(theta.view(), &layout, &standardizer);
        let x = array![2.5, 17.0, 5.0];
        let mut z = Array1::zeros(3);
        standardizer.transform_into(x.view(), &mut z);
        for k in 0..3 {
            let standardized_margin = layout.class_coefficients(theta.view(), k).dot(&z)
                + theta[layout.intercept_index(k).unwrap()];
            let original_margin = fitted.coefficients.row(k).dot(&x) + fitted.intercepts[k];
            assert_abs_diff_eq!(standardized_margin, original_margin, epsilon = 1e-10);
        }
    }

    #[test]
    fn centering_yields_zero_sum_columns() {
        let mut coefficients = array![[1.0, -2.0], [4.0, 0.5], [-1.0, 3.0]];
        let mut intercepts = array![0.3, 1.2, -2.0];
        center_coefficients(&mut coefficients);
        center_intercepts(&mut intercepts);
        for column in coefficients.columns() {
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(intercepts.sum(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(coefficients[[1, 0]] - coefficients[[0, 0]], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn finalize_without_intercept_leaves_zero_intercepts() {
        let layout = ParameterLayout::new(2, 1, false);
        let standardizer = Standardizer::identity(1);
        let fitted = finalize(array![1.0, 3.0].view(), &layout, &standardizer, true);
        assert_eq!(fitted.intercepts, array![0.0, 0.0]);
        assert_eq!(fitted.coefficients, array![[-1.0], [1.0]]);
    }
}
