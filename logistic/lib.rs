#![deny(unused_imports)]

//! Regularized multinomial (softmax) logistic regression.
//!
//! The fitting pipeline runs leaf to root:
//! `data` rows are summarized once by `summary`, the `objective` evaluates
//! loss and gradient over every shard for a candidate parameter vector,
//! `regularization` splits the elastic-net penalty into its smooth and
//! orthant-wise parts, the `optimizer` drives L-BFGS or OWL-QN to
//! convergence, and `postprocess` maps the solution back onto the original
//! feature scale. `estimate::train_model` wires these together and returns a
//! `model::MultinomialModel`.

pub mod data;
pub mod estimate;
pub mod metrics;
pub mod model;
pub mod objective;
pub mod optimizer;
pub mod postprocess;
pub mod regularization;
pub mod summary;

pub use data::{InMemoryDataset, Instance, RowSource};
pub use estimate::{EstimationError, ModelConfig, train_model};
pub use model::{ModelError, MultinomialModel, raw_to_probability};
