//! Elastic-net penalty over the coefficient block of `θ`.
//!
//! `regParam` (λ) sets the overall strength and `elasticNetParam` (α) the mix:
//! the smooth part is `0.5 · λ(1-α) · Σ β²` and the non-smooth part is
//! `λα · Σ |β|`. Intercepts are never penalized.
//!
//! The optimizer always works on standardized coefficients. With
//! `standardization = true` the penalty is applied to them directly, which makes
//! it invariant to the units of each feature. With `standardization = false` the
//! penalty must act on the original-scale coefficient `β / σ_f`, so the
//! per-feature weights become `λ(1-α)/σ_f²` and `λα/σ_f`.

use crate::objective::ParameterLayout;
use ndarray::{Array1, ArrayView1, Zip};

#[derive(Debug, Clone, PartialEq)]
pub struct ElasticNet {
    reg_param: f64,
    elastic_net_param: f64,
    /// Per-feature weight of the squared term.
    l2_weights: Array1<f64>,
    /// Per-feature weight of the absolute-value term.
    l1_weights: Array1<f64>,
}

impl ElasticNet {
    /// `scale` holds the per-feature deviation the optimizer's coordinates are
    /// divided by (1 for features that are not scaled).
    pub fn new(
        reg_param: f64,
        elastic_net_param: f64,
        standardization: bool,
        scale: ArrayView1<f64>,
    ) -> Self {
        let l2 = reg_param * (1.0 - elastic_net_param);
        let l1 = reg_param * elastic_net_param;
        let (l2_weights, l1_weights) = if standardization {
            (
                Array1::from_elem(scale.len(), l2),
                Array1::from_elem(scale.len(), l1),
            )
        } else {
            (scale.mapv(|s| l2 / (s * s)), scale.mapv(|s| l1 / s))
        };
        Self {
            reg_param,
            elastic_net_param,
            l2_weights,
            l1_weights,
        }
    }

    /// Effective L2 strength `λ(1-α)`.
    pub fn l2_strength(&self) -> f64 {
        self.reg_param * (1.0 - self.elastic_net_param)
    }

    /// Effective L1 strength `λα`.
    pub fn l1_strength(&self) -> f64 {
        self.reg_param * self.elastic_net_param
    }

    pub fn has_l1(&self) -> bool {
        self.l1_strength() > 0.0
    }

    /// Adds the gradient of the smooth penalty to `gradient` and returns its value.
    pub fn apply_smooth(
        &self,
        layout: &ParameterLayout,
        theta: ArrayView1<f64>,
        gradient: &mut Array1<f64>,
    ) -> f64 {
        if self.l2_strength() == 0.0 {
            return 0.0;
        }
        let mut penalty = 0.0;
        for k in 0..layout.num_classes {
            let start = layout.coefficient_index(k, 0);
            let end = start + layout.num_features;
            Zip::from(theta.slice(ndarray::s![start..end]))
                .and(gradient.slice_mut(ndarray::s![start..end]))
                .and(&self.l2_weights)
                .for_each(|&beta, g, &w| {
                    penalty += 0.5 * w * beta * beta;
                    *g += w * beta;
                });
        }
        penalty
    }

    /// The L1 weight of every entry of `θ`, zero for intercepts. This is what the
    /// orthant-wise solver consumes.
    pub fn l1_weights(&self, layout: &ParameterLayout) -> Array1<f64> {
        let mut weights = Array1::zeros(layout.len());
        for k in 0..layout.num_classes {
            let start = layout.coefficient_index(k, 0);
            weights
                .slice_mut(ndarray::s![start..start + layout.num_features])
                .assign(&self.l1_weights);
        }
        weights
    }
}
