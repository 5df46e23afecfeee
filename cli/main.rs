#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::process;

use mlogit::data::{SAMPLE_ID_COLUMN, load_prediction_data, load_training_data};
use mlogit::estimate::{ModelConfig, train_from_file};
use mlogit::metrics;
use mlogit::model::{BatchPrediction, MultinomialModel};

#[derive(Args)]
pub struct TrainArgs {
    /// Path to training TSV file with a label column and numeric feature columns
    pub training_data: String,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    pub output: String,

    /// Name of the label column (class indices 0, 1, ...)
    #[arg(long, default_value = "label")]
    pub label_col: String,

    /// Optional column of non-negative instance weights
    #[arg(long)]
    pub weight_col: Option<String>,

    /// Number of classes; inferred as max(label) + 1 when omitted
    #[arg(long, value_name = "K")]
    pub num_classes: Option<usize>,

    /// Overall regularization strength
    #[arg(long, default_value = "0.0")]
    pub reg_param: f64,

    /// Elastic-net mixing: 0 is pure L2, 1 is pure L1
    #[arg(long, default_value = "0.0")]
    pub elastic_net_param: f64,

    /// Fit without per-class intercepts
    #[arg(long)]
    pub no_intercept: bool,

    /// Penalize coefficients on the original feature scale instead of the standardized one
    #[arg(long)]
    pub no_standardization: bool,

    /// Maximum number of optimizer iterations
    #[arg(long, default_value = "100")]
    pub max_iterations: usize,

    /// Convergence tolerance on the relative objective change
    #[arg(long, default_value = "1e-6")]
    pub tolerance: f64,

    /// Number of curvature pairs kept by the quasi-Newton solver
    #[arg(long, default_value = "10")]
    pub history_size: usize,
}

#[derive(Args)]
pub struct InferArgs {
    /// Path to TSV file containing the model's feature columns
    pub test_data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: String,

    /// Per-class decision thresholds, comma separated (one per class, all > 0)
    #[arg(long, value_delimiter = ',')]
    pub thresholds: Option<Vec<f64>>,
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Path to labeled TSV file
    pub test_data: String,

    /// Path to trained model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Per-class decision thresholds, comma separated (one per class, all > 0)
    #[arg(long, value_delimiter = ',')]
    pub thresholds: Option<Vec<f64>>,
}

#[derive(Parser)]
#[command(
    name = "mlogit",
    about = "Regularized multinomial logistic regression",
    long_about = "Fits softmax classifiers with elastic-net penalties using L-BFGS / OWL-QN \
                 and applies them to new data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model from labeled training data
    #[command(about = "Train a multinomial model (outputs: model.toml)")]
    Train(TrainArgs),

    /// Apply a trained model to new data
    #[command(about = "Apply a trained model to new data (outputs: predictions.tsv)")]
    Infer(InferArgs),

    /// Score a trained model against labeled data
    #[command(about = "Report accuracy, log-loss and per-class scores")]
    Evaluate(EvaluateArgs),
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ModelConfig {
        fit_intercept: !args.no_intercept,
        standardization: !args.no_standardization,
        reg_param: args.reg_param,
        elastic_net_param: args.elastic_net_param,
        max_iterations: args.max_iterations,
        tolerance: args.tolerance,
        history_size: args.history_size,
        num_classes: args.num_classes,
        label_col: args.label_col,
        weight_col: args.weight_col,
    };

    println!("Loading training data from: {}", args.training_data);
    let model = train_from_file(&args.training_data, &config)?;
    if let Some(summary) = model.summary() {
        println!(
            "Finished after {} iterations ({:?}), final objective {:.8}",
            summary.total_iterations,
            summary.status,
            summary.objective_history.last().copied().unwrap_or(f64::NAN)
        );
    }
    model.save(&args.output)?;
    println!("Model saved to: {}", args.output);
    Ok(())
}

fn load_model(
    path: &str,
    thresholds: Option<Vec<f64>>,
) -> Result<MultinomialModel, Box<dyn std::error::Error>> {
    println!("Loading model from: {path}");
    let mut model = MultinomialModel::load(path)?;
    if let Some(thresholds) = thresholds {
        model.set_thresholds(thresholds)?;
    }
    if model.feature_names().is_empty() {
        return Err(format!(
            "model '{path}' does not record its feature column names and cannot be applied to a TSV file"
        )
        .into());
    }
    Ok(model)
}

pub fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = load_model(&args.model, args.thresholds)?;
    println!(
        "Model expects {} features and predicts {} classes",
        model.num_features(),
        model.num_classes()
    );

    let data = load_prediction_data(&args.test_data, model.feature_names())?;
    println!("Loaded {} samples for prediction", data.sample_ids.len());

    let prediction = model.predict_batch(data.features.view())?;
    save_predictions(&data.sample_ids, &prediction, &args.output)?;
    println!("Predictions saved to: {}", args.output);
    Ok(())
}

pub fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let model = load_model(&args.model, args.thresholds)?;
    let config = model.config();
    let data = load_training_data(
        &args.test_data,
        &config.label_col,
        config.weight_col.as_deref(),
    )?;
    if data.feature_names != model.feature_names() {
        return Err(format!(
            "feature columns of '{}' ({}) do not match the model's ({})",
            args.test_data,
            data.feature_names.join(", "),
            model.feature_names().join(", ")
        )
        .into());
    }

    let scores = metrics::evaluate(&model, &data.dataset)?;
    println!("Total weight: {:.4}", scores.weight_sum);
    println!("Accuracy:     {:.6}", scores.accuracy());
    println!("Log-loss:     {:.6}", scores.log_loss);
    println!("class\tprecision\trecall\tf1");
    for k in 0..scores.num_classes() {
        println!(
            "{k}\t{:.6}\t{:.6}\t{:.6}",
            scores.precision(k),
            scores.recall(k),
            scores.f1(k)
        );
    }
    Ok(())
}

fn save_predictions(
    sample_ids: &[String],
    prediction: &BatchPrediction,
    output_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(output_path)?;

    let num_classes = prediction.probabilities.ncols();
    let mut header = vec![SAMPLE_ID_COLUMN.to_string(), "prediction".to_string()];
    header.extend((0..num_classes).map(|k| format!("prob_{k}")));
    writer.write_record(&header)?;

    for (i, id) in sample_ids.iter().enumerate() {
        let mut record = vec![id.clone(), prediction.predictions[i].to_string()];
        record.extend(
            prediction
                .probabilities
                .row(i)
                .iter()
                .map(|p| format!("{p:.6}")),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Infer(args)) => infer(args),
        Some(Commands::Evaluate(args)) => evaluate(args),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
