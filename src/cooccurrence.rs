use crate::models::OTHER_CATEGORY;
use crate::normalizer::{ErrorSummary, parse_error_summary};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Short label of a taxonomy code
pub fn category_label(category: u8) -> &'static str {
    match category {
        1 => "Schema mismatch",
        2 => "Wrong aggregation",
        3 => "Join errors",
        4 => "Condition misinterpretation",
        5 => "String mismatch",
        6 => "Other",
        _ => "Unknown",
    }
}

/// Categories one model received for one case, "other" removed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErrorEntry {
    pub case_key: String,
    pub model: String,
    pub categories: BTreeSet<u8>,
}

/// Flatten summaries into entries, dropping category 6 and repeated
/// `(case, model, categories)` combinations
pub fn error_entries(summaries: &[ErrorSummary]) -> Vec<ErrorEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for summary in summaries {
        for model in &summary.models {
            let entry = ErrorEntry {
                case_key: summary.case_key.clone(),
                model: model.model_name.clone(),
                categories: model
                    .categories
                    .iter()
                    .copied()
                    .filter(|&c| c != OTHER_CATEGORY)
                    .collect(),
            };
            if seen.insert(entry.clone()) {
                entries.push(entry);
            }
        }
    }

    entries
}

/// Error counts of one model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDistribution {
    pub model: String,
    pub total: usize,
    pub counts: BTreeMap<u8, usize>,
    /// Share of the model's errors per category, 0 to 100
    pub percentages: BTreeMap<u8, f64>,
}

pub fn error_distribution(entries: &[ErrorEntry]) -> Vec<ModelDistribution> {
    let mut counts: BTreeMap<&str, BTreeMap<u8, usize>> = BTreeMap::new();
    for entry in entries {
        let model = counts.entry(entry.model.as_str()).or_default();
        for &category in &entry.categories {
            *model.entry(category).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .map(|(model, counts)| {
            let total: usize = counts.values().sum();
            let percentages = counts
                .iter()
                .map(|(&category, &count)| (category, count as f64 / total as f64 * 100.0))
                .collect();
            ModelDistribution {
                model: model.to_string(),
                total,
                counts,
                percentages,
            }
        })
        .collect()
}

pub fn category_totals(entries: &[ErrorEntry]) -> BTreeMap<u8, usize> {
    let mut totals = BTreeMap::new();
    for category in entries.iter().flat_map(|e| e.categories.iter()) {
        *totals.entry(*category).or_default() += 1;
    }
    totals
}

/// Category co-occurrence, rows and columns in presentation order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooccurrenceMatrix {
    pub categories: Vec<u8>,
    pub counts: Vec<Vec<u64>>,
    /// Off-diagonal containment score, 0 to 100; the diagonal is 0
    pub percent: Vec<Vec<f64>>,
}

/// Build the case x category count matrix, multiply it by itself and normalize
/// each off-diagonal cell by the smaller of the two category totals. Rows are
/// ordered by descending off-diagonal sum, ties by category code.
pub fn cooccurrence(entries: &[ErrorEntry]) -> CooccurrenceMatrix {
    let mut per_case: BTreeMap<&str, BTreeMap<u8, u64>> = BTreeMap::new();
    for entry in entries {
        let row = per_case.entry(entry.case_key.as_str()).or_default();
        for &category in &entry.categories {
            *row.entry(category).or_default() += 1;
        }
    }

    let categories: Vec<u8> = per_case
        .values()
        .flat_map(|row| row.keys().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let n = categories.len();

    let mut counts = vec![vec![0u64; n]; n];
    for row in per_case.values() {
        for (i, a) in categories.iter().enumerate() {
            let Some(&x) = row.get(a) else { continue };
            for (j, b) in categories.iter().enumerate() {
                if let Some(&y) = row.get(b) {
                    counts[i][j] += x * y;
                }
            }
        }
    }

    let totals: Vec<u64> = counts.iter().map(|row| row.iter().sum()).collect();
    let off_diagonal: Vec<u64> = (0..n).map(|i| totals[i] - counts[i][i]).collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        off_diagonal[b]
            .cmp(&off_diagonal[a])
            .then(categories[a].cmp(&categories[b]))
    });

    let percent_cell = |i: usize, j: usize| {
        let min_total = totals[i].min(totals[j]);
        if i == j || min_total == 0 {
            0.0
        } else {
            counts[i][j] as f64 / min_total as f64 * 100.0
        }
    };

    CooccurrenceMatrix {
        categories: order.iter().map(|&i| categories[i]).collect(),
        counts: order
            .iter()
            .map(|&i| order.iter().map(|&j| counts[i][j]).collect())
            .collect(),
        percent: order
            .iter()
            .map(|&i| order.iter().map(|&j| percent_cell(i, j)).collect())
            .collect(),
    }
}

/// Everything printed by the `cooccurrence` command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CooccurrenceReport {
    pub distribution: Vec<ModelDistribution>,
    pub totals: BTreeMap<u8, usize>,
    pub matrix: CooccurrenceMatrix,
}

pub fn analyze(summaries: &[ErrorSummary]) -> CooccurrenceReport {
    let entries = error_entries(summaries);
    CooccurrenceReport {
        distribution: error_distribution(&entries),
        totals: category_totals(&entries),
        matrix: cooccurrence(&entries),
    }
}

pub fn analyze_file(path: &Path) -> Result<CooccurrenceReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read error summary: {}", path.display()))?;
    Ok(analyze(&parse_error_summary(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::ModelErrors;

    fn summary(case_key: &str, models: &[(&str, &[u8])]) -> ErrorSummary {
        ErrorSummary {
            case_key: case_key.to_string(),
            models: models
                .iter()
                .map(|(name, categories)| ModelErrors {
                    model_name: name.to_string(),
                    categories: categories.iter().copied().collect(),
                    other_explanation: None,
                })
                .collect(),
        }
    }

    fn sample() -> Vec<ErrorSummary> {
        vec![
            summary("A", &[("gpt-4o", &[1, 2])]),
            summary("B", &[("gpt-4o", &[1, 6])]),
            summary("C", &[("deepseek-v3", &[2, 3])]),
        ]
    }

    #[test]
    fn test_entries_drop_other_and_duplicates() {
        let mut summaries = sample();
        summaries.push(summary("A", &[("gpt-4o", &[2, 1])]));
        let entries = error_entries(&summaries);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].categories, BTreeSet::from([1]));
    }

    #[test]
    fn test_cooccurrence_ordering_and_normalization() {
        let matrix = cooccurrence(&error_entries(&sample()));

        // off-diagonal sums: 1 -> 1, 2 -> 2, 3 -> 1
        assert_eq!(matrix.categories, vec![2, 1, 3]);
        assert_eq!(matrix.counts[0], vec![2, 1, 1]);

        // totals: 1 -> 3, 2 -> 4, 3 -> 2
        assert!((matrix.percent[0][1] - 100.0 / 3.0).abs() < 1e-9);
        assert!((matrix.percent[0][2] - 50.0).abs() < 1e-9);
        assert_eq!(matrix.percent[1][2], 0.0);
        assert_eq!(matrix.percent[0][0], 0.0);
    }

    #[test]
    fn test_normalized_cells_are_bounded() {
        let summaries = vec![
            summary("A", &[("m1", &[1, 2, 3]), ("m2", &[1, 2])]),
            summary("B", &[("m1", &[2]), ("m2", &[4, 5])]),
            summary("C", &[("m1", &[1, 5]), ("m3", &[1])]),
        ];
        let matrix = cooccurrence(&error_entries(&summaries));

        for (i, row) in matrix.percent.iter().enumerate() {
            for (j, &cell) in row.iter().enumerate() {
                assert!((0.0..=100.0).contains(&cell), "cell {i},{j} = {cell}");
                if i == j {
                    assert_eq!(cell, 0.0);
                }
            }
        }
    }

    #[test]
    fn test_error_distribution() {
        let distribution = error_distribution(&error_entries(&sample()));

        assert_eq!(distribution[0].model, "deepseek-v3");
        assert_eq!(distribution[1].model, "gpt-4o");
        assert_eq!(distribution[1].total, 3);
        assert_eq!(distribution[1].counts[&1], 2);
        assert!((distribution[1].percentages[&1] - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_category_totals() {
        let totals = category_totals(&error_entries(&sample()));
        assert_eq!(totals, BTreeMap::from([(1, 2), (2, 2), (3, 1)]));
    }

    #[test]
    fn test_empty_input() {
        let report = analyze(&[]);
        assert!(report.matrix.categories.is_empty());
        assert!(report.distribution.is_empty());
    }

    #[test]
    fn test_analyze_file_reads_summary_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.log");
        std::fs::write(
            &path,
            "CASE: A\nLLM [gpt-4o]: [1, 2]\n\n******************************\n\n\
             CASE: B\nLLM [gpt-4o]: [3, 6]\n[6] other issue\n\n******************************\n\n",
        )
        .unwrap();

        let report = analyze_file(&path).unwrap();
        assert_eq!(report.totals, BTreeMap::from([(1, 1), (2, 1), (3, 1)]));
        assert_eq!(report.matrix.categories, vec![1, 2, 3]);
    }
}
