// ========================================================================================
//
//                      The command-line front end for cohort-cv
//
// ========================================================================================
//
// Loads the cohort CSVs, resolves the run configuration (TOML file first, then flags),
// runs the cross-validated evaluation and prints the markdown report. Every number in
// the report is also exported as CSV to the output directory.

use clap::{Args, Parser, Subcommand, ValueEnum};
use cohort_cv::cohort::{LabelMode, load_cohorts};
use cohort_cv::config::RunConfig;
use cohort_cv::curve::boosting_curve;
use cohort_cv::harness::UndefinedMetricPolicy;
use cohort_cv::models::{BoostingParams, LogisticParams, ModelSpec};
use cohort_cv::progress::FoldObserver;
use cohort_cv::report;
use cohort_cv::{EvaluationData, evaluate};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

const DEFAULT_OUTPUT_DIR: &str = "cohort_cv_results";
const DEFAULT_CONFIG_PATH: &str = "cohort-cv.toml";

#[derive(Clone, Copy, ValueEnum)]
enum LabelsCli {
    Binary,
    Severity,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelFamilyCli {
    Logistic,
    Boosted,
}

#[derive(Args)]
struct RunArgs {
    /// Cohort CSV files, stacked in the given order
    #[arg(value_name = "COHORT_CSV")]
    cohorts: Vec<PathBuf>,

    /// TOML run configuration; flags override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Fitting target derived from the COVID and CLASS columns
    #[arg(long, value_enum)]
    labels: Option<LabelsCli>,

    /// Comma-separated feature columns to use instead of every biomarker column
    #[arg(long, value_delimiter = ',')]
    features: Option<Vec<String>>,

    /// Add sex (F = 1, M = 0) and age to the features
    #[arg(long)]
    include_demographics: bool,

    #[arg(long, value_enum)]
    model: Option<ModelFamilyCli>,

    /// Number of stratified folds
    #[arg(long, value_name = "N")]
    folds: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Decision threshold on the positive-class score (binary targets only)
    #[arg(long)]
    threshold: Option<f64>,

    /// Averaging of precision, recall and F1: auto, binary or macro
    #[arg(long)]
    averaging: Option<String>,

    /// Abort instead of recording a metric as undefined for a fold
    #[arg(long)]
    abort_on_undefined: bool,

    /// Directory for the exported CSV tables
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Evaluate folds in parallel
    #[arg(long)]
    parallel: bool,

    /// Log per-fold and per-iteration details
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Parser)]
#[command(
    name = "cohort-cv",
    version,
    about = "Stratified cross-validated evaluation of biomarker classifiers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-validate a classifier and report per-fold and summary metrics
    #[command(about = "Cross-validate a classifier (outputs: performance_summary.csv, ...)")]
    Evaluate {
        #[command(flatten)]
        run: RunArgs,

        /// Number of features listed in the importance ranking
        #[arg(long, value_name = "N")]
        top: Option<usize>,
    },

    /// Trace held-out metrics of the boosted model round by round
    #[command(about = "Cross-validated boosting-round curve (outputs: boosting_curve.csv)")]
    Curve {
        #[command(flatten)]
        run: RunArgs,

        /// Number of boosting rounds to trace
        #[arg(long, value_name = "N")]
        rounds: Option<usize>,
    },

    /// Write the default configuration as TOML
    #[command(about = "Write a default run configuration (outputs: cohort-cv.toml)")]
    InitConfig {
        #[arg(value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Commands::Evaluate { run, .. } | Commands::Curve { run, .. } => run.verbose,
        Commands::InitConfig { .. } => false,
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .init();

    let result = match cli.command {
        Commands::Evaluate { run, top } => run_evaluate(run, top),
        Commands::Curve { run, rounds } => run_curve(run, rounds),
        Commands::InitConfig { path, force } => init_config(&path, force),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Loads the configuration file, if any, and applies every flag given on top of it.
fn resolve_config(args: &RunArgs) -> Result<RunConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    if !args.cohorts.is_empty() {
        config.cohorts = args.cohorts.clone();
    }
    if let Some(labels) = args.labels {
        config.data.labels = match labels {
            LabelsCli::Binary => LabelMode::Binary,
            LabelsCli::Severity => LabelMode::Severity,
        };
    }
    if let Some(features) = &args.features {
        config.data.features = Some(features.clone());
    }
    if args.include_demographics {
        config.data.include_demographics = true;
    }
    match (args.model, &config.model) {
        (Some(ModelFamilyCli::Logistic), ModelSpec::Boosted(_)) => {
            config.model = ModelSpec::Logistic(LogisticParams::default());
        }
        (Some(ModelFamilyCli::Boosted), ModelSpec::Logistic(_)) => {
            config.model = ModelSpec::Boosted(BoostingParams::default());
        }
        _ => {}
    }
    if let Some(folds) = args.folds {
        config.evaluation.n_folds = folds;
    }
    if let Some(seed) = args.seed {
        config.evaluation.seed = seed;
    }
    if let Some(threshold) = args.threshold {
        config.evaluation.threshold = threshold;
    }
    if let Some(averaging) = &args.averaging {
        config.evaluation.averaging = averaging.clone();
    }
    if args.abort_on_undefined {
        config.evaluation.undefined_metrics = UndefinedMetricPolicy::Abort;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if args.parallel {
        config.evaluation.parallel = true;
    }

    if config.cohorts.is_empty() {
        return Err(
            "No cohort CSV files were given on the command line or in the configuration.".into(),
        );
    }
    Ok(config)
}

fn load_data(config: &RunConfig) -> Result<EvaluationData, Box<dyn Error>> {
    let cohort = load_cohorts(&config.cohorts, &config.load_options())?;
    Ok(cohort.to_evaluation_data(config.data.labels)?)
}

fn output_dir(config: &RunConfig) -> PathBuf {
    config
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}

fn run_evaluate(args: RunArgs, top: Option<usize>) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();
    let config = resolve_config(&args)?;
    let settings = config.evaluation_settings()?;
    let data = load_data(&config)?;
    let classifier = config.classifier();

    let progress = FoldProgress::new(settings.n_folds as u64, "folds evaluated");
    let result = evaluate(&data, classifier.as_ref(), &settings, &progress)?;

    println!("{}", report::render_report(&result, top.unwrap_or(config.report.top_features)));

    let written = report::export_results(&result, &output_dir(&config))?;
    for path in &written {
        eprintln!("> Wrote {}", path.display());
    }
    eprintln!("> Finished in {:.2?}", start_time.elapsed());
    Ok(())
}

fn run_curve(args: RunArgs, rounds: Option<usize>) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args)?;
    let mut params = match config.seeded_model() {
        ModelSpec::Boosted(params) => params,
        ModelSpec::Logistic(_) => {
            return Err("The boosting curve is only defined for the boosted model.".into());
        }
    };
    if let Some(rounds) = rounds {
        params.num_rounds = rounds;
    }
    let settings = config.evaluation_settings()?;
    let data = load_data(&config)?;

    let progress = FoldProgress::new(settings.n_folds as u64, "folds traced");
    let curve = boosting_curve(&data, &params, &settings, &progress)?;

    println!("{}", report::render_curve(&curve));
    if let Some(best) = curve.best_round() {
        println!();
        println!(
            "Best round: {} (test AUC {:.5} +/- {:.5})",
            best.round,
            best.test.auc.mean.unwrap_or(f64::NAN),
            best.test.auc.std_dev.unwrap_or(f64::NAN)
        );
    }

    let path = report::export_curve(&curve, &output_dir(&config))?;
    eprintln!("> Wrote {}", path.display());
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!(
            "'{}' already exists; pass --force to overwrite it.",
            path.display()
        )
        .into());
    }
    RunConfig::default().save(path)?;
    eprintln!("> Wrote default configuration to {}", path.display());
    Ok(())
}

/// Terminal progress bar over folds.
struct FoldProgress {
    bar: ProgressBar,
}

impl FoldProgress {
    fn new(len: u64, message: &str) -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(len), draw_target);
        let template = "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(message.to_string());
        Self { bar }
    }
}

impl FoldObserver for FoldProgress {
    fn on_start(&self, n_folds: usize) {
        self.bar.set_length(n_folds as u64);
        self.bar.set_position(0);
    }

    fn on_fold_finished(&self, fold: usize) {
        self.bar.inc(1);
        log::debug!("Fold {fold} finished");
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}
