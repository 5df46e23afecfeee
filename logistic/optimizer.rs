//! # Quasi-Newton Minimization
//!
//! A limited-memory quasi-Newton solver with two search strategies selected once
//! before the first iteration:
//!
//! - `SearchStrategy::Smooth` is plain L-BFGS for differentiable objectives
//!   (including an L2 penalty).
//! - `SearchStrategy::OrthantWise` is OWL-QN (Andrew & Gao, 2007) for objectives
//!   with an additional `Σ w_i |x_i|` term. The L1 term never enters the
//!   gradient supplied by the caller; it is applied through the pseudo-gradient,
//!   the direction constraint and the orthant projection of each trial point, which
//!   is how the solver produces coefficients that are exactly zero.
//!
//! All iteration state (current point, value, gradient and curvature pairs) lives
//! in an `IterationState` value owned by the loop. `step` consumes one state and
//! returns the next, so a single iteration can be exercised in isolation.
//!
//! The solver never fails with an error. A non-finite starting value, or a line
//! search that cannot find an acceptable point, ends the run with
//! `OptimizerStatus::Failed` and the last finite state.

use ndarray::{Array1, Zip};
use std::collections::VecDeque;

/// Sufficient-decrease constant of the Armijo condition.
const ARMIJO_C1: f64 = 1e-4;
const MAX_LINE_SEARCH_STEPS: usize = 30;
/// Curvature pairs with `sᵀy` at or below this are not stored.
const MIN_CURVATURE: f64 = 1e-10;
/// Floor of the gradient-norm convergence threshold.
const MIN_GRADIENT_TOLERANCE: f64 = 1e-8;

pub const DEFAULT_HISTORY_SIZE: usize = 10;

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStatus {
    /// Relative improvement or the (pseudo-)gradient fell below tolerance.
    Converged,
    /// The iteration budget ran out first.
    MaxIterationsReached,
    /// The objective was not finite at the start, or no step made progress.
    Failed,
}

/// The limited-memory inverse Hessian approximation: the last `capacity` pairs
/// `s = x_{k+1} - x_k`, `y = g_{k+1} - g_k`.
#[derive(Debug, Clone)]
pub struct CurvatureHistory {
    capacity: usize,
    pairs: VecDeque<(Array1<f64>, Array1<f64>, f64)>,
}

impl CurvatureHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pairs: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Stores a pair if it has positive curvature. Returns whether it was kept.
    pub fn push(&mut self, s: Array1<f64>, y: Array1<f64>) -> bool {
        let sy = s.dot(&y);
        if !(sy > MIN_CURVATURE) || self.capacity == 0 {
            return false;
        }
        if self.pairs.len() == self.capacity {
            self.pairs.pop_front();
        }
        self.pairs.push_back((s, y, 1.0 / sy));
        true
    }

    /// Two-loop recursion: returns `H · g` for the current approximation `H`.
    pub fn apply_inverse_hessian(&self, g: &Array1<f64>) -> Array1<f64> {
        let mut q = g.clone();
        let mut alphas = Vec::with_capacity(self.pairs.len());
        for (s, y, rho) in self.pairs.iter().rev() {
            let alpha = rho * s.dot(&q);
            q.scaled_add(-alpha, y);
            alphas.push(alpha);
        }

        if let Some((s, y, _)) = self.pairs.back() {
            let yy = y.dot(y);
            if yy > 0.0 {
                q *= s.dot(y) / yy;
            }
        }

        for ((s, y, rho), alpha) in self.pairs.iter().zip(alphas.into_iter().rev()) {
            let beta = rho * y.dot(&q);
            q.scaled_add(alpha - beta, s);
        }
        q
    }
}

/// How search directions and trial points are formed.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchStrategy {
    /// L-BFGS on a smooth objective.
    Smooth,
    /// OWL-QN with per-coordinate L1 weights (zero for unpenalized coordinates).
    OrthantWise { l1_weights: Array1<f64> },
}

impl SearchStrategy {
    /// Picks OWL-QN whenever any coordinate carries an L1 weight.
    pub fn for_l1_weights(l1_weights: Array1<f64>) -> Self {
        if l1_weights.iter().any(|&w| w > 0.0) {
            Self::OrthantWise { l1_weights }
        } else {
            Self::Smooth
        }
    }

    /// The non-smooth part of the objective at `x`.
    pub fn penalty(&self, x: &Array1<f64>) -> f64 {
        match self {
            Self::Smooth => 0.0,
            Self::OrthantWise { l1_weights } => {
                Zip::from(x)
                    .and(l1_weights)
                    .fold(0.0, |acc, &xi, &w| acc + w * xi.abs())
            }
        }
    }

    /// The minimum-norm subgradient of the full objective; the plain gradient for
    /// `Smooth`.
    pub fn pseudo_gradient(&self, x: &Array1<f64>, gradient: &Array1<f64>) -> Array1<f64> {
        match self {
            Self::Smooth => gradient.clone(),
            Self::OrthantWise { l1_weights } => {
                let mut pg = gradient.clone();
                Zip::from(&mut pg)
                    .and(x)
                    .and(l1_weights)
                    .for_each(|g, &xi, &w| {
                        if w == 0.0 {
                            return;
                        }
                        *g = if xi > 0.0 {
                            *g + w
                        } else if xi < 0.0 {
                            *g - w
                        } else if *g + w < 0.0 {
                            *g + w
                        } else if *g - w > 0.0 {
                            *g - w
                        } else {
                            0.0
                        };
                    });
                pg
            }
        }
    }

    /// Zeroes penalized direction components that disagree in sign with the
    /// steepest descent direction `-pg`.
    fn constrain_direction(&self, direction: &mut Array1<f64>, pg: &Array1<f64>) {
        if let Self::OrthantWise { l1_weights } = self {
            Zip::from(direction)
                .and(pg)
                .and(l1_weights)
                .for_each(|d, &g, &w| {
                    if w > 0.0 && *d * g >= 0.0 {
                        *d = 0.0;
                    }
                });
        }
    }

    /// Projects a trial point onto the orthant chosen at `x`: penalized
    /// coordinates that would cross zero are clamped to zero.
    fn project(&self, candidate: &mut Array1<f64>, x: &Array1<f64>, pg: &Array1<f64>) {
        if let Self::OrthantWise { l1_weights } = self {
            Zip::from(candidate)
                .and(x)
                .and(pg)
                .and(l1_weights)
                .for_each(|c, &xi, &g, &w| {
                    if w == 0.0 {
                        return;
                    }
                    let orthant = if xi != 0.0 {
                        xi.signum()
                    } else if g != 0.0 {
                        -g.signum()
                    } else {
                        0.0
                    };
                    if *c * orthant <= 0.0 {
                        *c = 0.0;
                    }
                });
        }
    }
}

/// Everything the loop carries from one iteration to the next.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub x: Array1<f64>,
    /// Full objective value at `x`, including the L1 term.
    pub value: f64,
    /// Gradient of the smooth part at `x`.
    pub gradient: Array1<f64>,
    pub iteration: usize,
    pub history: CurvatureHistory,
}

impl IterationState {
    pub fn new(
        x: Array1<f64>,
        value: f64,
        gradient: Array1<f64>,
        history_size: usize,
    ) -> Self {
        Self {
            x,
            value,
            gradient,
            iteration: 0,
            history: CurvatureHistory::new(history_size),
        }
    }
}

/// Result of a single iteration.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Moved to a better point; keep going.
    Advanced(IterationState),
    /// The convergence test passed (either before or after moving).
    Converged(IterationState),
    /// No acceptable step was found; the state is unchanged.
    Stalled(IterationState),
}

fn max_abs(v: &Array1<f64>) -> f64 {
    v.fold(0.0f64, |m, &x| m.max(x.abs()))
}

/// Performs one iteration from `state`.
pub fn step<F>(
    mut state: IterationState,
    strategy: &SearchStrategy,
    objective: &F,
    tolerance: f64,
) -> StepOutcome
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let pg = strategy.pseudo_gradient(&state.x, &state.gradient);
    if max_abs(&pg) <= (tolerance * state.value.abs()).max(MIN_GRADIENT_TOLERANCE) {
        return StepOutcome::Converged(state);
    }

    let mut direction = -state.history.apply_inverse_hessian(&pg);
    strategy.constrain_direction(&mut direction, &pg);
    let mut slope = direction.dot(&pg);
    if !(slope < 0.0) {
        log::debug!(
            "Quasi-Newton direction is not a descent direction (slope {slope:.3e}); resetting history"
        );
        state.history.clear();
        direction = -&pg;
        strategy.constrain_direction(&mut direction, &pg);
        slope = direction.dot(&pg);
        if !(slope < 0.0) {
            return StepOutcome::Converged(state);
        }
    }

    let mut step_size = if state.history.is_empty() {
        (1.0 / pg.dot(&pg).sqrt()).min(1.0)
    } else {
        1.0
    };

    let mut accepted = None;
    for _ in 0..MAX_LINE_SEARCH_STEPS {
        let mut candidate = &state.x + &(&direction * step_size);
        strategy.project(&mut candidate, &state.x, &pg);
        let (smooth_value, gradient) = objective(&candidate);
        let value = smooth_value + strategy.penalty(&candidate);
        let decrease = ARMIJO_C1 * pg.dot(&(&candidate - &state.x));
        if value.is_finite()
            && gradient.iter().all(|g| g.is_finite())
            && value <= state.value + decrease
        {
            accepted = Some((candidate, value, gradient));
            break;
        }
        step_size *= 0.5;
    }

    let Some((x, value, gradient)) = accepted else {
        log::warn!(
            "Line search found no acceptable step at iteration {}; stopping with value {:.6e}",
            state.iteration,
            state.value
        );
        return StepOutcome::Stalled(state);
    };

    let s = &x - &state.x;
    let y = &gradient - &state.gradient;
    state.history.push(s, y);

    let previous = state.value;
    let improvement = (previous - value).abs() / previous.abs().max(value.abs()).max(1e-6);
    let next = IterationState {
        x,
        value,
        gradient,
        iteration: state.iteration + 1,
        history: state.history,
    };
    log::debug!(
        "Iteration {}: objective {:.10e} (relative improvement {:.3e}, step {:.3e})",
        next.iteration,
        next.value,
        improvement,
        step_size
    );

    if improvement <= tolerance {
        StepOutcome::Converged(next)
    } else {
        StepOutcome::Advanced(next)
    }
}

/// Output of `Minimizer::run`.
#[derive(Debug, Clone)]
pub struct Solution {
    pub final_point: Array1<f64>,
    pub final_value: f64,
    pub iterations: usize,
    pub status: OptimizerStatus,
    /// Objective value at the start and after every accepted iteration.
    pub objective_history: Vec<f64>,
}

/// Builder-style driver around `step`.
pub struct Minimizer<F> {
    x0: Array1<f64>,
    objective: F,
    strategy: SearchStrategy,
    tolerance: f64,
    max_iterations: usize,
    history_size: usize,
}

impl<F> Minimizer<F>
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    pub fn new(x0: Array1<f64>, objective: F) -> Self {
        Self {
            x0,
            objective,
            strategy: SearchStrategy::Smooth,
            tolerance: 1e-6,
            max_iterations: 100,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }

    pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    pub fn run(self) -> Solution {
        let (smooth_value, gradient) = (self.objective)(&self.x0);
        let value = smooth_value + self.strategy.penalty(&self.x0);
        if !value.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
            log::warn!("Objective is not finite at the starting point ({value}); not iterating");
            return Solution {
                final_point: self.x0,
                final_value: value,
                iterations: 0,
                status: OptimizerStatus::Failed,
                objective_history: vec![value],
            };
        }

        let mut objective_history = vec![value];
        let mut state = IterationState::new(self.x0, value, gradient, self.history_size);
        let status = loop {
            if state.iteration >= self.max_iterations {
                break OptimizerStatus::MaxIterationsReached;
            }
            let before = state.iteration;
            let (next, status) = match step(state, &self.strategy, &self.objective, self.tolerance)
            {
                StepOutcome::Advanced(s) => (s, None),
                StepOutcome::Converged(s) => (s, Some(OptimizerStatus::Converged)),
                StepOutcome::Stalled(s) => (s, Some(OptimizerStatus::Failed)),
            };
            if next.iteration > before {
                objective_history.push(next.value);
            }
            state = next;
            if let Some(status) = status {
                break status;
            }
        };

        log::debug!(
            "Optimizer stopped after {} iterations: {:?}, objective {:.10e}",
            state.iteration,
            status,
            state.value
        );
        Solution {
            final_point: state.x,
            final_value: state.value,
            iterations: state.iteration,
            status,
            objective_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// f(x) = Σ c_i (x_i - t_i)² with minimum at t.
    fn quadratic(x: &Array1<f64>) -> (f64, Array1<f64>) {
        let c = array![1.0, 10.0, 0.5];
        let t = array![1.0, -2.0, 3.0];
        let diff = x - &t;
        let value = (&c * &diff * &diff).sum();
        (value, 2.0 * &c * &diff)
    }

    fn rosenbrock(x: &Array1<f64>) -> (f64, Array1<f64>) {
        let (a, b) = (x[0], x[1]);
        let value = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let grad = array![
            -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
            200.0 * (b - a * a)
        ];
        (value, grad)
    }

    #[test]
    fn lbfgs_minimizes_a_quadratic() {
        let solution = Minimizer::new(Array1::zeros(3), quadratic)
            .with_tolerance(1e-12)
            .run();
        assert_eq!(solution.status, OptimizerStatus::Converged);
        assert_abs_diff_eq!(solution.final_point[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(solution.final_point[1], -2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(solution.final_point[2], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn lbfgs_minimizes_rosenbrock() {
        let solution = Minimizer::new(array![-1.2, 1.0], rosenbrock)
            .with_tolerance(1e-14)
            .with_max_iterations(500)
            .run();
        assert_abs_diff_eq!(solution.final_point[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(solution.final_point[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn objective_history_never_increases() {
        let solution = Minimizer::new(array![-1.2, 1.0], rosenbrock)
            .with_tolerance(1e-10)
            .with_max_iterations(200)
            .run();
        assert_eq!(solution.objective_history.len(), solution.iterations + 1);
        for pair in solution.objective_history.windows(2) {
            assert!(pair[1] <= pair[0], "objective increased: {pair:?}");
        }
    }

    #[test]
    fn zero_iterations_returns_the_start() {
        let x0 = array![5.0, 5.0, 5.0];
        let solution = Minimizer::new(x0.clone(), quadratic)
            .with_max_iterations(0)
            .run();
        assert_eq!(solution.status, OptimizerStatus::MaxIterationsReached);
        assert_eq!(solution.iterations, 0);
        assert_eq!(solution.final_point, x0);
    }

    #[test]
    fn owlqn_matches_soft_thresholding() {
        // 0.5 (x - t)² + w|x| is minimized at sign(t) max(|t| - w, 0).
        let t = array![3.0, -0.5, 0.2, -4.0];
        let target = t.clone();
        let smooth = move |x: &Array1<f64>| {
            let diff = x - &target;
            (0.5 * diff.dot(&diff), diff)
        };
        let strategy = SearchStrategy::for_l1_weights(Array1::from_elem(4, 1.0));
        assert!(matches!(strategy, SearchStrategy::OrthantWise { .. }));

        let solution = Minimizer::new(Array1::zeros(4), smooth)
            .with_strategy(strategy)
            .with_tolerance(1e-12)
            .with_max_iterations(200)
            .run();
        assert_abs_diff_eq!(solution.final_point[0], 2.0, epsilon = 1e-6);
        assert_eq!(solution.final_point[1], 0.0);
        assert_eq!(solution.final_point[2], 0.0);
        assert_abs_diff_eq!(solution.final_point[3], -3.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_l1_weights_select_the_smooth_strategy() {
        let strategy = SearchStrategy::for_l1_weights(Array1::zeros(3));
        assert_eq!(strategy, SearchStrategy::Smooth);
    }

    #[test]
    fn non_finite_start_fails_without_panicking() {
        let solution = Minimizer::new(array![1.0], |_x: &Array1<f64>| {
            (f64::NAN, array![0.0])
        })
        .run();
        assert_eq!(solution.status, OptimizerStatus::Failed);
        assert_eq!(solution.final_point, array![1.0]);
    }

    #[test]
    fn objective_turning_non_finite_mid_run_keeps_last_finite_point() {
        // Finite only for x <= 0.5, while the unconstrained minimum sits at 2.
        let bounded = |x: &Array1<f64>| {
            if x[0] <= 0.5 {
                let diff = x[0] - 2.0;
                (diff * diff, array![2.0 * diff])
            } else {
                (f64::NAN, array![f64::NAN])
            }
        };
        let solution = Minimizer::new(array![-3.0], bounded).run();

        assert_eq!(solution.status, OptimizerStatus::Failed);
        assert!(solution.final_point[0].is_finite());
        assert!(solution.final_point[0] <= 0.5);
        assert!(solution.final_value.is_finite());
        assert!(solution.final_value < 25.0);
        assert_eq!(solution.objective_history.len(), solution.iterations + 1);
        for pair in solution.objective_history.windows(2) {
            assert!(pair[1] <= pair[0], "objective increased: {pair:?}");
        }
    }

    #[test]
    fn a_single_step_can_be_driven_by_hand() {
        let x0 = Array1::zeros(3);
        let (value, gradient) = quadratic(&x0);
        let state = IterationState::new(x0, value, gradient, 5);
        match step(state, &SearchStrategy::Smooth, &quadratic, 1e-12) {
            StepOutcome::Advanced(next) => {
                assert_eq!(next.iteration, 1);
                assert!(next.value < value);
                assert_eq!(next.history.len(), 1);
            }
            other => panic!("expected the first step to advance, got {other:?}"),
        }
    }

    #[test]
    fn curvature_history_drops_oldest_pairs() {
        let mut history = CurvatureHistory::new(2);
        assert!(history.push(array![1.0], array![1.0]));
        assert!(history.push(array![2.0], array![1.0]));
        assert!(history.push(array![3.0], array![1.0]));
        assert!(!history.push(array![1.0], array![-1.0]));
        assert_eq!(history.len(), 2);
        // For a 1-D quadratic with curvature 1/3 the recursion returns 3·g.
        let hg = history.apply_inverse_hessian(&array![1.0]);
        assert_abs_diff_eq!(hg[0], 3.0, epsilon = 1e-12);
    }
}
