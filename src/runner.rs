use crate::codec::{LogWriter, read_log_file};
use crate::config::ExperimentConfig;
use crate::database::{Database, QueryOutcome, render_answer};
use crate::dataset::{self, DatasetCase, Selection};
use crate::error::HarnessError;
use crate::inference::{InferenceService, QueryMode};
use crate::models::{Answer, Case, ModelOutput, Usage, UsageField, normalize};
use anyhow::{Context, Result};
use futures::future::{join_all, try_join_all};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Token budget for the judge model
const JUDGE_MAX_TOKENS: u32 = 1000;

const JUDGE_INSTRUCTIONS: &str = "Please analyze the errors in each LLM's query using the numbered categories. For each LLM output, provide the error numbers and brief explanation.";

/// What a finished run wrote
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub name: String,
    pub log_path: PathBuf,
    pub batches: usize,
    pub cases: usize,
}

fn exclude_info(experiment: &ExperimentConfig) -> String {
    if experiment.exclude_prompts.is_empty() {
        "none".to_string()
    } else {
        experiment.exclude_prompts.join("-")
    }
}

/// Name of a SQL generation run, used for its log file
pub fn experiment_name(experiment: &ExperimentConfig) -> String {
    format!(
        "batch_size={}&n={}&exclude={}&take={}",
        experiment.batch_size,
        experiment.batch_size as i64 * experiment.batch_limit,
        exclude_info(experiment),
        experiment.take
    )
}

/// Name of a categorization run
pub fn categorize_name(experiment: &ExperimentConfig) -> String {
    format!(
        "eval_batch_size={}&n={}&exclude={}",
        experiment.batch_size,
        experiment.batch_size as i64 * experiment.batch_limit,
        exclude_info(experiment)
    )
}

/// Message asking the judge to categorize every wrong answer of a case
pub fn judge_prompt(case: &Case) -> String {
    let mut prompt = format!(
        "\nCASE: {}\nQUESTION: {}\nTRUE: {}\n\nLLM outputs:\n",
        case.key, case.question, case.truth
    );
    for output in &case.model_outputs {
        prompt.push_str(&format!("\nLLM [{}]: {}", output.model_name, output.content));
    }
    prompt.push_str("\n\n");
    prompt.push_str(JUDGE_INSTRUCTIONS);
    prompt
}

/// Runs bounded concurrent batches against the inference service and appends
/// every finished case to the run's log
pub struct Runner {
    experiment: ExperimentConfig,
    service: Arc<dyn InferenceService>,
    system_prompt: String,
}

impl Runner {
    pub fn new(
        experiment: ExperimentConfig,
        service: Arc<dyn InferenceService>,
        system_prompt: String,
    ) -> Self {
        Self {
            experiment,
            service,
            system_prompt,
        }
    }

    fn batch_allowed(&self, batch_id: usize) -> bool {
        self.experiment.batch_limit <= 0 || (batch_id as i64) < self.experiment.batch_limit
    }

    fn open_log(&self, name: &str, prefix: &str, resuming: bool) -> Result<LogWriter> {
        let path = self.experiment.output_dir.join(format!("{prefix}{name}.log"));
        let mut writer = LogWriter::append(&path)?;
        if !resuming {
            writer.write_banner(name, &chrono::Local::now().to_rfc3339())?;
        }
        Ok(writer)
    }

    /// Keep each batch at least `min_batch_millis` long
    async fn pad_batch(&self, started: Instant) {
        let floor = Duration::from_millis(self.experiment.min_batch_millis);
        let elapsed = started.elapsed();
        if elapsed < floor {
            sleep(floor - elapsed).await;
        }
    }

    /// SQL generation run over the dataset
    pub async fn run_experiment(
        &self,
        database: &Database,
        models: &[String],
        continue_from: Option<&str>,
        filter_case: Option<&str>,
    ) -> Result<RunSummary> {
        let name = experiment_name(&self.experiment);
        let cases = dataset::select(
            dataset::load(&self.experiment.dataset)?,
            &Selection {
                seed: self.experiment.seed,
                filter_case,
                continue_from,
            },
        )?;

        let mut writer = self.open_log(&name, "output_", continue_from.is_some())?;
        info!(experiment = %name, cases = cases.len(), models = models.len(), "starting experiment");

        let mut summary = RunSummary {
            name,
            log_path: writer.path().to_path_buf(),
            batches: 0,
            cases: 0,
        };

        for (batch_id, batch) in cases.chunks(self.experiment.batch_size.max(1)).enumerate() {
            if !self.batch_allowed(batch_id) {
                break;
            }

            let started = Instant::now();
            let records =
                try_join_all(batch.iter().map(|case| self.run_case(database, case, models))).await?;
            self.pad_batch(started).await;

            for record in &records {
                writer.write_case(record)?;
            }
            summary.batches += 1;
            summary.cases += records.len();
            info!(batch = batch_id, cases = summary.cases, "batch written");
        }

        Ok(summary)
    }

    async fn execute(&self, database: &Database, sql: &str) -> QueryOutcome {
        let database = database.clone();
        let sql = sql.to_string();
        let timeout = Duration::from_secs(self.experiment.query_timeout_secs);
        tokio::task::spawn_blocking(move || database.execute(&sql, timeout))
            .await
            .unwrap_or_else(|e| QueryOutcome::Failed(e.to_string()))
    }

    async fn run_case(&self, database: &Database, case: &DatasetCase, models: &[String]) -> Result<Case> {
        let message = format!("Please convert this question to SQL: {}", case.question_refine);
        let budget = self.experiment.max_tokens.max(2 * case.sql.len() as u32);

        let completions = try_join_all(models.iter().map(|model| {
            self.service
                .query(model, &self.system_prompt, &message, budget, QueryMode::Sql)
        }))
        .await
        .with_context(|| format!("Inference failed for case {}", case.key))?;

        let truth = self.execute(database, &case.sql).await;
        let results = join_all(
            completions
                .iter()
                .map(|completion| self.execute(database, &completion.content)),
        )
        .await;

        let mut record = Case::new(
            normalize(&case.key),
            normalize(&case.question_refine),
            normalize(&case.sql),
        );
        for ((model, completion), result) in models.iter().zip(completions).zip(results) {
            debug!(case = %case.key, model = %model, outcome = ?result, "executed model query");
            let mut output = ModelOutput::new(model.clone(), &completion.content);
            output.reported_model = Some(completion.reported_model.unwrap_or_else(|| model.clone()));
            output.usage = Some(UsageField::Reported(
                completion.usage.unwrap_or_else(Usage::unreported),
            ));
            output.answer = Some(Answer::parse(&render_answer(&result, &truth)));
            record.model_outputs.push(output);
        }

        Ok(record)
    }

    /// Ask the judge model to categorize every case of the false-answer log
    pub async fn run_categorize(&self, continue_from: Option<&str>) -> Result<RunSummary> {
        let name = categorize_name(&self.experiment);
        let source = self
            .experiment
            .output_dir
            .join("false_logs")
            .join("all_false_cases.log");
        let mut cases = read_log_file(&source)?.cases;

        if let Some(key) = continue_from {
            let start = cases
                .iter()
                .position(|case| case.key == key)
                .ok_or_else(|| HarnessError::ResumeKeyNotFound(key.to_string()))?;
            cases = cases.split_off(start);
        }

        let mut writer = self.open_log(&name, "cat_eval_", continue_from.is_some())?;
        info!(experiment = %name, cases = cases.len(), judge = %self.experiment.judge_model, "starting categorization");

        let mut summary = RunSummary {
            name,
            log_path: writer.path().to_path_buf(),
            batches: 0,
            cases: 0,
        };

        for (batch_id, batch) in cases.chunks(self.experiment.batch_size.max(1)).enumerate() {
            if !self.batch_allowed(batch_id) {
                break;
            }

            let started = Instant::now();
            let prompts: Vec<String> = batch.iter().map(judge_prompt).collect();
            let evaluations = try_join_all(prompts.iter().map(|prompt| {
                self.service.query(
                    &self.experiment.judge_model,
                    &self.system_prompt,
                    prompt,
                    JUDGE_MAX_TOKENS,
                    QueryMode::Text,
                )
            }))
            .await?;
            self.pad_batch(started).await;

            for (case, evaluation) in batch.iter().zip(evaluations) {
                let mut record = Case::new(&case.key, &case.question, &case.truth);
                record.evaluation = Some(evaluation.content);
                writer.write_case(&record)?;
            }
            summary.batches += 1;
            summary.cases += batch.len();
            info!(batch = batch_id, cases = summary.cases, "batch written");
        }

        Ok(summary)
    }
}
