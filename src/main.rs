use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod aggregator;
mod codec;
mod config;
mod cooccurrence;
mod database;
mod dataset;
mod error;
mod inference;
mod logging;
mod models;
mod normalizer;
mod output;
mod prompts;
mod runner;
mod scoring;

use crate::config::Config;
use crate::database::Database;
use crate::inference::OpenAiService;
use crate::output::OutputFormat;
use crate::runner::Runner;

/// Text-to-SQL benchmark harness - run models, score their logs and analyze errors
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "sqlbench.toml")]
    config: PathBuf,

    /// Output format: plain or json
    #[arg(short, long, global = true, default_value = "plain")]
    output: OutputFormat,

    /// Verbose output - log every request and query
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score experiment logs, or bundle / filter them
    Results {
        /// Name of task to process; `main` reads the output directory itself
        #[arg(long, default_value = "main")]
        task: String,

        /// Space-separated list of LLM names to include
        #[arg(long, default_value = "gpt-4o deepseek-v3 llama3.3-70b")]
        llms: String,

        /// Write only the wrong answers to false_logs/all_false_cases.log
        #[arg(long = "filter_false", conflicts_with = "bundle")]
        filter_false: bool,

        /// Write one merged log per case to bundled_logs/
        #[arg(long)]
        bundle: bool,
    },
    /// Normalize a categorization log and write its error summary
    Cleanup {
        input: PathBuf,
        /// Cleaned log; the error summary is written beside it
        #[arg(value_name = "OUTPUT")]
        cleaned: PathBuf,
    },
    /// Error distribution and co-occurrence of an error summary log
    Cooccurrence { summary_log: PathBuf },
    /// Generate SQL for every dataset case with every enabled model
    Run {
        /// Resume at this case key without writing a new header
        #[arg(long)]
        continue_from: Option<String>,

        /// Space-separated subset of enabled models
        #[arg(long)]
        models: Option<String>,

        /// Run a single case
        #[arg(long)]
        filter_case: Option<String>,
    },
    /// Ask the judge model to categorize the wrong answers
    Categorize {
        #[arg(long)]
        continue_from: Option<String>,
    },
}

fn split_names(names: &str) -> Vec<String> {
    names.split_whitespace().map(str::to_string).collect()
}

fn results(config: &Config, task: &str, llms: &str, mode: ResultsMode, format: OutputFormat) -> Result<()> {
    let included = split_names(llms);
    config.validate_llms(&included)?;

    let output_dir = config.output_dir();
    let log_dir = if task == "main" {
        output_dir.clone()
    } else {
        output_dir.join(task)
    };
    let files = codec::list_log_files(&log_dir)?;
    info!(task, files = files.len(), llms = ?included, "processing logs");

    match mode {
        ResultsMode::Bundle => {
            let aggregation = aggregator::aggregate_files(&files, &included)?;
            let written = aggregator::write_bundles(&aggregation.cases, &output_dir.join("bundled_logs"))?;
            println!("Bundled {} cases", written.len());
        }
        ResultsMode::FilterFalse => {
            let aggregation = aggregator::aggregate_files(&files, &included)?;
            let false_cases = aggregator::filter_false(&aggregation.cases);
            aggregator::write_false_cases(
                &false_cases,
                &output_dir.join("false_logs").join("all_false_cases.log"),
            )?;
            println!(
                "Processed {} false cases out of {} total cases",
                false_cases.emitted, false_cases.total
            );
        }
        ResultsMode::Score => {
            let observations = scoring::collect_observations(&files, &included)?;
            let summaries = scoring::summarize(&observations, &config.price_table());
            output::write_csv(&output_dir.join(format!("results_{task}.csv")), &observations)?;
            output::write_csv(&output_dir.join(format!("summary_{task}.csv")), &summaries)?;
            output::print_summary(&summaries, format);
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ResultsMode {
    Score,
    Bundle,
    FilterFalse,
}

fn runner(config: &Config) -> Result<Runner> {
    let experiment = config.experiment()?;
    let system_prompt = match &experiment.prompts_file {
        Some(path) => prompts::load_system_prompt(path, &experiment.exclude_prompts)?,
        None => String::new(),
    };
    let service = OpenAiService::new(
        &config.models,
        config.retry.clone(),
        Duration::from_secs(experiment.request_timeout_secs),
    )?;
    Ok(Runner::new(experiment.clone(), Arc::new(service), system_prompt))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(args.verbose, args.log_json)?;

    match args.command {
        Command::Results {
            task,
            llms,
            filter_false,
            bundle,
        } => {
            let config = Config::from_file(&args.config)?;
            let mode = match (filter_false, bundle) {
                (true, _) => ResultsMode::FilterFalse,
                (_, true) => ResultsMode::Bundle,
                _ => ResultsMode::Score,
            };
            results(&config, &task, &llms, mode, args.output)?;
        }
        Command::Cleanup { input, cleaned } => {
            let report = normalizer::cleanup_file(&input, &cleaned)?;
            println!(
                "Cleaned {} cases ({} annotated, {} skipped), error summary in {}",
                report.cases,
                report.annotated_cases,
                report.skipped,
                report.summary_path.display()
            );
        }
        Command::Cooccurrence { summary_log } => {
            let report = cooccurrence::analyze_file(&summary_log)?;
            output::print_cooccurrence(&report, args.output);
        }
        Command::Run {
            continue_from,
            models,
            filter_case,
        } => {
            let config = Config::from_file(&args.config)?;
            let filter = models.as_deref().map(split_names);
            if let Some(names) = &filter {
                config.validate_llms(names)?;
            }
            let active = config.active_models(filter.as_deref());
            let database = Database::open(&config.experiment()?.database)?;

            let summary = runner(&config)?
                .run_experiment(&database, &active, continue_from.as_deref(), filter_case.as_deref())
                .await?;
            println!(
                "Wrote {} cases in {} batches to {}",
                summary.cases,
                summary.batches,
                summary.log_path.display()
            );
        }
        Command::Categorize { continue_from } => {
            let config = Config::from_file(&args.config)?;
            let summary = runner(&config)?
                .run_categorize(continue_from.as_deref())
                .await?;
            println!(
                "Categorized {} cases into {}",
                summary.cases,
                summary.log_path.display()
            );
        }
    }

    Ok(())
}
