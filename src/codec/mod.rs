//! Delimited text format shared by every tool in the harness.
//!
//! A log is a sequence of blocks separated by a line of 30 `*`. Each block is a
//! set of line-oriented `KEY: value` fields; `LLM [<name>]:` opens a model
//! output that owns the `MODEL:`, `USAGE:` and `ANSWER:` lines after it.
//!
//! There is no escaping. A model output cannot contain a line starting with a
//! field marker (for example `\nLLM [`) or the delimiter itself: the first
//! marker found wins. The writer normalizes content to a single line, so this
//! only affects hand-edited logs.

mod reader;
mod tokenizer;
mod writer;

pub use reader::{ParseReport, parse_log};
pub use tokenizer::{BANNER, DELIMITER, split_inline_llm_entries};
pub use writer::{LogWriter, render_log};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Read and leniently parse a log file
pub fn read_log_file(path: &Path) -> Result<ParseReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read log file: {}", path.display()))?;
    Ok(parse_log(&content))
}

/// `*.log` files directly inside `dir`, sorted by name
pub fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read log directory: {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to read log directory: {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "log") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_log_files_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.log", "a.log", "notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("false_logs")).unwrap();

        let files = list_log_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.log", "b.log"]);
        assert!(list_log_files(&dir.path().join("missing")).is_err());
    }
}
