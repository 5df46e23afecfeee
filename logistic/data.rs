//! # Training Rows and Data Loading
//!
//! This module owns everything that feeds rows into the fitting core:
//!
//! - `Instance` is one training row: a class label, a non-negative weight and a
//!   dense feature vector.
//! - `RowSource` is the reduction contract the summarizer and the objective are
//!   written against. A source folds every row into a per-shard accumulator and
//!   merges the accumulators; nothing downstream may depend on row order.
//! - `InMemoryDataset` is the in-process implementation, sharded with `rayon`.
//! - `load_training_data` / `load_prediction_data` read tab-separated files with
//!   the `polars` CSV reader and validate them into `ndarray` structures.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Rows handed to a single rayon task before it may be split further.
const MIN_SHARD_ROWS: usize = 256;

/// Name of the optional row identifier column.
pub const SAMPLE_ID_COLUMN: &str = "sample_id";

/// One training row.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    /// Class index, stored as a float the way it arrives from tabular input.
    /// The summarizer rejects values that are not non-negative integers.
    pub label: f64,
    pub weight: f64,
    pub features: Array1<f64>,
}

impl Instance {
    /// A row with unit weight.
    pub fn new(label: f64, features: Array1<f64>) -> Self {
        Self::weighted(label, 1.0, features)
    }

    pub fn weighted(label: f64, weight: f64, features: Array1<f64>) -> Self {
        Self {
            label,
            weight,
            features,
        }
    }
}

/// A collection of training rows that can be reduced in parallel shards.
///
/// `identity` creates an empty accumulator for each shard, `fold` absorbs one row
/// into it and `combine` merges two accumulators. `combine` must be associative
/// and commutative: implementations are free to shard and merge in any order.
pub trait RowSource: Sync {
    fn num_rows(&self) -> usize;

    fn reduce_rows<A, Z, F, C>(&self, identity: Z, fold: F, combine: C) -> A
    where
        A: Send,
        Z: Fn() -> A + Sync + Send,
        F: Fn(A, &Instance) -> A + Sync + Send,
        C: Fn(A, A) -> A + Sync + Send;
}

/// Rows held in memory and reduced with a rayon fold/reduce.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    rows: Vec<Instance>,
}

impl InMemoryDataset {
    pub fn new(rows: Vec<Instance>) -> Self {
        Self { rows }
    }

    /// Builds a dataset from a label vector, a `[n_rows, n_features]` matrix and
    /// optional per-row weights (unit weights when absent).
    pub fn from_arrays(
        labels: ArrayView1<f64>,
        features: ArrayView2<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<Self, DataError> {
        let n = labels.len();
        if features.nrows() != n {
            return Err(DataError::LengthMismatch {
                what: "feature matrix rows",
                found: features.nrows(),
                expected: n,
            });
        }
        if let Some(w) = weights.as_ref() {
            if w.len() != n {
                return Err(DataError::LengthMismatch {
                    what: "weights",
                    found: w.len(),
                    expected: n,
                });
            }
        }

        let rows = features
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, row)| {
                let weight = weights.as_ref().map_or(1.0, |w| w[i]);
                Instance::weighted(labels[i], weight, row.to_owned())
            })
            .collect();
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Instance] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Instance) {
        self.rows.push(row);
    }
}

impl From<Vec<Instance>> for InMemoryDataset {
    fn from(rows: Vec<Instance>) -> Self {
        Self::new(rows)
    }
}

impl RowSource for InMemoryDataset {
    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn reduce_rows<A, Z, F, C>(&self, identity: Z, fold: F, combine: C) -> A
    where
        A: Send,
        Z: Fn() -> A + Sync + Send,
        F: Fn(A, &Instance) -> A + Sync + Send,
        C: Fn(A, A) -> A + Sync + Send,
    {
        self.rows
            .par_iter()
            .with_min_len(MIN_SHARD_ROWS)
            .fold(&identity, &fold)
            .reduce(&identity, &combine)
    }
}

/// A validated training file.
#[derive(Debug)]
pub struct TrainingData {
    pub dataset: InMemoryDataset,
    /// Feature column names in file order; the model keeps them for prediction.
    pub feature_names: Vec<String>,
}

/// A validated prediction file.
#[derive(Debug)]
pub struct PredictionData {
    /// Shape: `[n_samples, n_features]`, columns ordered like the model's features.
    pub features: Array2<f64>,
    /// Values of the `sample_id` column, or 1-based row numbers when it is absent.
    pub sample_ids: Vec<String>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The input file '{0}' contains no data rows.")]
    EmptyInput(String),
    #[error("The input file '{0}' has no feature columns besides the label and weight columns.")]
    NoFeatureColumns(String),
    #[error("Length of {what} is {found}, but {expected} rows were expected.")]
    LengthMismatch {
        what: &'static str,
        found: usize,
        expected: usize,
    },
}

/// Loads a training file. The label column is required; the weight column is
/// required only when named. Every other column except `sample_id` is a feature.
pub fn load_training_data(
    path: &str,
    label_col: &str,
    weight_col: Option<&str>,
) -> Result<TrainingData, DataError> {
    let df = internal::read_tsv(path)?;
    let columns = internal::column_names(&df);

    if !columns.iter().any(|c| c == label_col) {
        return Err(DataError::ColumnNotFound(label_col.to_string()));
    }
    if let Some(weight_col) = weight_col {
        if !columns.iter().any(|c| c == weight_col) {
            return Err(DataError::ColumnNotFound(weight_col.to_string()));
        }
    }

    let feature_names: Vec<String> = columns
        .iter()
        .filter(|c| {
            c.as_str() != label_col
                && Some(c.as_str()) != weight_col
                && c.as_str() != SAMPLE_ID_COLUMN
        })
        .cloned()
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatureColumns(path.to_string()));
    }

    let labels = Array1::from_vec(internal::extract_numeric_column(&df, label_col)?);
    let weights = match weight_col {
        Some(weight_col) => {
            let values = internal::extract_numeric_column(&df, weight_col)?;
            if let Some((i, &w)) = values.iter().enumerate().find(|&(_, &w)| w < 0.0) {
                return Err(DataError::ColumnWrongType {
                    column_name: weight_col.to_string(),
                    expected_type: "non-negative f64 values",
                    found_type: format!("negative value {} at row {}", w, i + 1),
                });
            }
            Some(Array1::from_vec(values))
        }
        None => None,
    };
    let features = internal::extract_feature_matrix(&df, &feature_names)?;

    log::info!(
        "Loaded {} training rows with {} features from '{}'",
        labels.len(),
        feature_names.len(),
        path
    );

    let dataset = InMemoryDataset::from_arrays(
        labels.view(),
        features.view(),
        weights.as_ref().map(Array1::view),
    )?;
    Ok(TrainingData {
        dataset,
        feature_names,
    })
}

/// Loads a prediction file containing (at least) the named feature columns.
pub fn load_prediction_data(
    path: &str,
    feature_names: &[String],
) -> Result<PredictionData, DataError> {
    let df = internal::read_tsv(path)?;
    let columns: HashSet<String> = internal::column_names(&df).into_iter().collect();
    for name in feature_names {
        if !columns.contains(name) {
            return Err(DataError::ColumnNotFound(name.clone()));
        }
    }

    let features = internal::extract_feature_matrix(&df, feature_names)?;
    let sample_ids = internal::build_sample_ids(&df, features.nrows())?;
    log::info!(
        "Loaded {} rows for prediction from '{}'",
        features.nrows(),
        path
    );
    Ok(PredictionData {
        features,
        sample_ids,
    })
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
        log::debug!("Reading '{path}'");
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;
        if df.height() == 0 {
            return Err(DataError::EmptyInput(path.to_string()));
        }
        Ok(df)
    }

    pub(super) fn column_names(df: &DataFrame) -> Vec<String> {
        df.get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        // A non-strict cast turns unparseable strings into nulls.
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_feature_matrix(
        df: &DataFrame,
        feature_names: &[String],
    ) -> Result<Array2<f64>, DataError> {
        let columns = feature_names
            .iter()
            .map(|name| extract_numeric_column(df, name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Array2::from_shape_fn(
            (df.height(), feature_names.len()),
            |(i, j)| columns[j][i],
        ))
    }

    pub(super) fn build_sample_ids(df: &DataFrame, n: usize) -> Result<Vec<String>, DataError> {
        let sequential = || (1..=n).map(|i| i.to_string()).collect::<Vec<_>>();
        if !df
            .get_column_names()
            .iter()
            .any(|c| c.as_str() == SAMPLE_ID_COLUMN)
        {
            return Ok(sequential());
        }

        let series = df.column(SAMPLE_ID_COLUMN)?;
        if series.null_count() > 0 {
            return Ok(sequential());
        }

        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let value = series.get(i).unwrap_or(AnyValue::Null);
            let text = match value {
                AnyValue::Null => String::new(),
                AnyValue::String(s) => s.to_string(),
                other => other.to_string(),
            };
            ids.push(if text.is_empty() {
                (i + 1).to_string()
            } else {
                text
            });
        }
        Ok(ids)
    }
}
