use crate::error::HarnessError;
use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One benchmark question as stored in the dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCase {
    pub key: String,
    pub question_refine: String,
    /// Ground-truth SQL
    pub sql: String,
}

/// Read a JSON-lines dataset; blank lines are ignored
pub fn load(path: &Path) -> Result<Vec<DatasetCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset: {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("Invalid dataset record at {}:{}", path.display(), number + 1)
            })
        })
        .collect()
}

/// Selection of the cases to run
#[derive(Debug, Clone, Default)]
pub struct Selection<'a> {
    pub seed: u64,
    /// Keep only this key
    pub filter_case: Option<&'a str>,
    /// Start at this key, skipping the cases before it
    pub continue_from: Option<&'a str>,
}

/// Reverse the file order, shuffle deterministically and cut at the resume key
pub fn select(mut cases: Vec<DatasetCase>, selection: &Selection<'_>) -> Result<Vec<DatasetCase>, HarnessError> {
    if let Some(key) = selection.filter_case {
        cases.retain(|case| case.key == key);
    }

    cases.reverse();
    let mut rng = StdRng::seed_from_u64(selection.seed);
    cases.shuffle(&mut rng);

    match selection.continue_from {
        Some(key) => {
            let start = cases
                .iter()
                .position(|case| case.key == key)
                .ok_or_else(|| HarnessError::ResumeKeyNotFound(key.to_string()))?;
            Ok(cases.split_off(start))
        }
        None => Ok(cases),
    }
}
