use super::tokenizer::{BANNER, DELIMITER};
use crate::models::Case;
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Render one case as a block without the leading delimiter
pub fn render_case(case: &Case) -> String {
    let mut block = format!(
        "CASE: {}\nQUESTION: {}\n\nTRUE: {}\n\n",
        case.key, case.question, case.truth
    );

    for output in &case.model_outputs {
        block.push_str(&format!("LLM [{}]: {}\n", output.model_name, output.content));
        if let Some(model) = &output.reported_model {
            block.push_str(&format!("MODEL: {model}\n"));
        }
        if let Some(usage) = &output.usage {
            block.push_str(&format!("USAGE: {usage}\n"));
        }
        if let Some(answer) = &output.answer {
            block.push_str(&format!("ANSWER: {answer}\n"));
        }
        block.push('\n');
    }

    if let Some(evaluation) = &case.evaluation {
        block.push_str(&format!("EVALUATION:\n{evaluation}\n\n"));
    }

    block
}

/// Render a case preceded by the delimiter, as the append-only writer emits it
pub fn render_entry(case: &Case) -> String {
    format!("{DELIMITER}\n\n{}", render_case(case))
}

/// Render a complete log
pub fn render_log(cases: &[Case]) -> String {
    cases.iter().map(render_entry).collect()
}

/// Experiment header written once at the start of a fresh run
pub fn render_banner(experiment_name: &str, started_at: &str) -> String {
    format!("\n{BANNER}\n\nStarting experiment {experiment_name} at {started_at}...\n\n")
}

/// Append-only log file. Each line is flushed as soon as it is written so a
/// crash loses at most the case being written.
pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogWriter {
    /// Open `path` for appending, creating parent directories as needed
    pub fn append(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write text line by line, flushing after each one
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        for line in text.split_inclusive('\n') {
            self.writer
                .write_all(line.as_bytes())
                .and_then(|_| self.writer.flush())
                .with_context(|| format!("Failed to write to: {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn write_case(&mut self, case: &Case) -> Result<()> {
        self.write_text(&render_entry(case))
    }

    pub fn write_banner(&mut self, experiment_name: &str, started_at: &str) -> Result<()> {
        self.write_text(&render_banner(experiment_name, started_at))
    }
}
