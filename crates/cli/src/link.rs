//! `reclink run | validate | synth | exact`: config-driven record linkage.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

use reclink_linkage::config::SourceConfig;
use reclink_linkage::deterministic::exact_join;
use reclink_linkage::load::{load_csv_records, load_truth, records_to_csv, truth_to_csv};
use reclink_linkage::normalize::normalize_records;
use reclink_linkage::synth::{self, SynthConfig};
use reclink_linkage::{run_with, LinkConfig, LinkInput, LinkResult, PersistedModel, RawRecord, RunOptions, Side};

use crate::exit_codes::{EXIT_INVALID_CONFIG, EXIT_NOT_CONVERGED, EXIT_RUNTIME, EXIT_USAGE};
use crate::CliError;

#[derive(Subcommand)]
pub enum LinkCommands {
    /// Link the two sources named in a TOML config
    #[command(after_help = "\
Examples:
  reclink run link.toml
  reclink run link.toml --json > result.json
  reclink run link.toml --truth truth.csv --save-model model.json
  reclink run link.toml --load-model model.json --upper 0.99")]
    Run {
        /// Path to the link config (.toml)
        config: PathBuf,

        /// Output JSON to stdout instead of human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Ground-truth CSV with id_a,id_b columns
        #[arg(long)]
        truth: Option<PathBuf>,

        /// Write fitted parameters to this file
        #[arg(long)]
        save_model: Option<PathBuf>,

        /// Classify with previously saved parameters instead of fitting
        #[arg(long)]
        load_model: Option<PathBuf>,

        /// Override the upper cutoff (match at or above)
        #[arg(long)]
        upper: Option<f64>,

        /// Override the lower cutoff (review at or above)
        #[arg(long)]
        lower: Option<f64>,

        /// Exit 5 when the estimator stops before converging
        #[arg(long)]
        fail_on_nonconvergence: bool,
    },

    /// Validate a link config without running
    Validate {
        /// Path to the link config (.toml)
        config: PathBuf,
    },

    /// Generate a seeded synthetic dataset pair with ground truth
    #[command(after_help = "\
Writes dataset_a.csv, dataset_b.csv, truth.csv and a ready-to-run link.toml.

Examples:
  reclink synth --out-dir demo
  reclink synth --rows 500 --seed 7 --out-dir demo && reclink run demo/link.toml --truth demo/truth.csv")]
    Synth {
        /// Rows drawn for set A before deduplication
        #[arg(long, default_value_t = 10_000)]
        rows: usize,

        #[arg(long, default_value_t = 123)]
        seed: u64,

        /// Per-record probability of each noise type
        #[arg(long, default_value_t = 0.25)]
        noise: f64,

        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Deterministic baseline: exact join on every configured field
    Exact {
        /// Path to the link config (.toml)
        config: PathBuf,

        /// Output JSON to stdout
        #[arg(long)]
        json: bool,
    },
}

pub fn cmd_link(cmd: LinkCommands) -> Result<(), CliError> {
    match cmd {
        LinkCommands::Run {
            config,
            json,
            output,
            truth,
            save_model,
            load_model,
            upper,
            lower,
            fail_on_nonconvergence,
        } => cmd_run(RunArgs {
            config_path: config,
            json,
            output,
            truth,
            save_model,
            load_model,
            upper,
            lower,
            fail_on_nonconvergence,
        }),
        LinkCommands::Validate { config } => cmd_validate(config),
        LinkCommands::Synth { rows, seed, noise, out_dir } => cmd_synth(SynthConfig { rows, seed, noise }, out_dir),
        LinkCommands::Exact { config, json } => cmd_exact(config, json),
    }
}

struct RunArgs {
    config_path: PathBuf,
    json: bool,
    output: Option<PathBuf>,
    truth: Option<PathBuf>,
    save_model: Option<PathBuf>,
    load_model: Option<PathBuf>,
    upper: Option<f64>,
    lower: Option<f64>,
    fail_on_nonconvergence: bool,
}

// ---------------------------------------------------------------------------
// Shared loading
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, CliError> {
    fs::read_to_string(path)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot read {}: {e}", path.display())))
}

fn write_file(path: &Path, contents: &str) -> Result<(), CliError> {
    fs::write(path, contents)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot write {}: {e}", path.display())))?;
    eprintln!("wrote {}", path.display());
    Ok(())
}

fn load_config(path: &Path) -> Result<LinkConfig, CliError> {
    let config_str = read_file(path)?;
    LinkConfig::from_toml(&config_str).map_err(|e| CliError::new(EXIT_INVALID_CONFIG, e.to_string()))
}

/// Load both sources, resolving file paths relative to the config file's directory.
fn load_sources(config_path: &Path, config: &LinkConfig) -> Result<(Vec<RawRecord>, Vec<RawRecord>), CliError> {
    let sources = config.sources.as_ref().ok_or_else(|| {
        CliError::new(EXIT_USAGE, format!("config '{}' has no [sources] section", config.name))
            .with_hint("add [sources.a] and [sources.b] tables with a `file` key")
    })?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let load = |name: &str, source: &SourceConfig| -> Result<Vec<RawRecord>, CliError> {
        let csv_path = base_dir.join(&source.file);
        let csv_data = read_file(&csv_path)?;
        Ok(load_csv_records(name, &csv_data, source, config)?)
    };
    Ok((load("a", &sources.a)?, load("b", &sources.b)?))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn cmd_run(args: RunArgs) -> Result<(), CliError> {
    let mut config = load_config(&args.config_path)?;
    if let Some(upper) = args.upper {
        config.classifier.upper = upper;
    }
    if let Some(lower) = args.lower {
        config.classifier.lower = lower;
    }
    config
        .classifier
        .validate()
        .map_err(|e| CliError::new(EXIT_USAGE, e.to_string()).with_hint("check --upper / --lower"))?;

    let (a, b) = load_sources(&args.config_path, &config)?;
    let truth = match &args.truth {
        Some(path) => Some(load_truth(&read_file(path)?)?),
        None => None,
    };
    let model = match &args.load_model {
        Some(path) => Some(PersistedModel::from_json(&read_file(path)?)?),
        None => None,
    };

    let input = LinkInput { a, b, truth };
    let options = RunOptions { model, ..RunOptions::default() };
    let result = run_with(&config, &input, options)?;

    if let Some(path) = &args.save_model {
        write_file(path, &PersistedModel::from_result(&result).to_json()?)?;
    }

    let json_str = serde_json::to_string_pretty(&result)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("JSON serialization error: {e}")))?;
    if let Some(path) = &args.output {
        write_file(path, &json_str)?;
    }
    if args.json {
        println!("{json_str}");
    }

    print_summary(&result);

    let status = result.estimation.status;
    if args.fail_on_nonconvergence && !status.is_converged() {
        return Err(CliError::new(
            EXIT_NOT_CONVERGED,
            format!("estimator stopped without converging ({status})"),
        )
        .with_hint("raise estimator.max_iterations or loosen estimator.tolerance"));
    }
    Ok(())
}

fn ratio(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".into())
}

/// Human summary to stderr.
fn print_summary(result: &LinkResult) {
    let eval = &result.evaluation;
    let counts = &eval.label_counts;
    eprintln!(
        "'{}': {} x {} records, {} candidate pair(s) (reduction {:.4})",
        result.meta.config_name,
        result.meta.records_a,
        result.meta.records_b,
        result.blocking.candidate_pairs,
        result.blocking.reduction_ratio,
    );
    eprintln!(
        "estimator: {} after {} iteration(s), prior {:.6}",
        result.estimation.status, result.estimation.iterations, result.model.prior,
    );
    eprintln!(
        "labels: {} match, {} review, {} non-match; {} cluster(s), {} conflict(s)",
        counts.matches,
        counts.review,
        counts.non_match,
        result.clusters.len(),
        result.conflicts.len(),
    );
    if let Some(gt) = &eval.ground_truth {
        eprintln!(
            "ground truth: precision {}, recall {}, f1 {}, pair completeness {}",
            ratio(gt.precision),
            ratio(gt.recall),
            ratio(gt.f1),
            ratio(gt.pair_completeness),
        );
    }
    eprintln!("deterministic baseline: {} exact match(es)", eval.deterministic_matches);
    if !result.warnings.is_empty() {
        eprintln!("{} warning(s); see `warnings` in the JSON output", result.warnings.len());
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn cmd_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = load_config(&config_path)?;
    eprintln!(
        "valid: '{}' with {} field(s) ({} compared), {} blocking rule(s)",
        config.name,
        config.fields.len(),
        config.compared_fields().len(),
        config.blocking.len(),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// synth
// ---------------------------------------------------------------------------

fn cmd_synth(synth_config: SynthConfig, out_dir: PathBuf) -> Result<(), CliError> {
    if !(0.0..=1.0).contains(&synth_config.noise) {
        return Err(CliError::new(EXIT_USAGE, format!("--noise {} is not a probability", synth_config.noise)));
    }
    fs::create_dir_all(&out_dir)
        .map_err(|e| CliError::new(EXIT_RUNTIME, format!("cannot create {}: {e}", out_dir.display())))?;

    let data = synth::generate(&synth_config);
    write_file(&out_dir.join("dataset_a.csv"), &records_to_csv("id", &synth::COLUMNS, &data.a)?)?;
    write_file(&out_dir.join("dataset_b.csv"), &records_to_csv("id", &synth::COLUMNS, &data.b)?)?;
    write_file(&out_dir.join("truth.csv"), &truth_to_csv(&data.truth)?)?;
    write_file(&out_dir.join("link.toml"), synth::DEMO_CONFIG)?;

    eprintln!("{} record(s) per side, seed {}", data.a.len(), synth_config.seed);
    Ok(())
}

// ---------------------------------------------------------------------------
// exact
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ExactOutput<'a> {
    fields: Vec<&'a str>,
    matches: usize,
    pairs: Vec<ExactPair>,
}

#[derive(Serialize)]
struct ExactPair {
    a_id: String,
    b_id: String,
}

fn cmd_exact(config_path: PathBuf, json: bool) -> Result<(), CliError> {
    let config = load_config(&config_path)?;
    let (raw_a, raw_b) = load_sources(&config_path, &config)?;

    let a = normalize_records(Side::A, &raw_a, &config)?;
    let b = normalize_records(Side::B, &raw_b, &config)?;
    for warning in a.warnings.iter().chain(&b.warnings) {
        log::warn!("{warning}");
    }

    let fields: Vec<&str> = config.fields.iter().map(|f| f.name.as_str()).collect();
    let pairs = exact_join(&a.records, &b.records, &fields);

    if json {
        let output = ExactOutput {
            fields,
            matches: pairs.len(),
            pairs: pairs.into_iter().map(|(a_id, b_id)| ExactPair { a_id, b_id }).collect(),
        };
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::new(EXIT_RUNTIME, format!("JSON serialization error: {e}")))?;
        println!("{json_str}");
    } else {
        println!("{}", pairs.len());
        eprintln!(
            "exact join on {}: {} pair(s) from {} x {} records",
            fields.join(", "),
            pairs.len(),
            a.records.len(),
            b.records.len(),
        );
    }
    Ok(())
}
