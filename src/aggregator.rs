use crate::codec::{read_log_file, render_log};
use crate::models::{Case, CaseIdentity};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Cases merged across logs, in first-seen identity order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub cases: Vec<Case>,
    pub skipped_segments: usize,
}

/// Result of isolating the wrong answers
#[derive(Debug, Clone, PartialEq)]
pub struct FalseCases {
    pub cases: Vec<Case>,
    pub emitted: usize,
    pub total: usize,
}

/// Merge cases sharing `(key, question, truth)`. Only outputs of included
/// models are kept, one per model per identity; the first one seen wins.
pub fn aggregate<I>(sources: I, included: &[String]) -> Vec<Case>
where
    I: IntoIterator<Item = Vec<Case>>,
{
    let mut index: HashMap<CaseIdentity, usize> = HashMap::new();
    let mut merged: Vec<Case> = Vec::new();

    for source in sources {
        for case in source {
            let slot = *index.entry(case.identity()).or_insert_with(|| {
                merged.push(Case::new(&case.key, &case.question, &case.truth));
                merged.len() - 1
            });
            let target = &mut merged[slot];

            for output in case.model_outputs {
                if !included.contains(&output.model_name) {
                    continue;
                }
                if target.output_for(&output.model_name).is_none() {
                    target.model_outputs.push(output);
                }
            }
        }
    }

    merged
}

/// Parse the logs in the given order and merge them
pub fn aggregate_files(files: &[PathBuf], included: &[String]) -> Result<Aggregation> {
    let mut sources = Vec::with_capacity(files.len());
    let mut skipped_segments = 0;

    for path in files {
        let report = read_log_file(path)?;
        if report.skipped_count() > 0 {
            warn!(
                file = %path.display(),
                skipped = report.skipped_count(),
                "skipped malformed segments"
            );
        }
        skipped_segments += report.skipped_count();
        sources.push(report.cases);
    }

    Ok(Aggregation {
        cases: aggregate(sources, included),
        skipped_segments,
    })
}

/// Keep the identities with at least one wrong answer, reduced to the wrong
/// answers only
pub fn filter_false(cases: &[Case]) -> FalseCases {
    let selected: Vec<Case> = cases
        .iter()
        .filter_map(|case| {
            let wrong: Vec<_> = case
                .model_outputs
                .iter()
                .filter(|output| !output.is_correct())
                .cloned()
                .collect();
            if wrong.is_empty() {
                return None;
            }
            let mut reduced = Case::new(&case.key, &case.question, &case.truth);
            reduced.model_outputs = wrong;
            Some(reduced)
        })
        .collect();

    FalseCases {
        emitted: selected.len(),
        total: cases.len(),
        cases: selected,
    }
}

fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

/// File names for bundles, in case order. A key reused by another identity
/// gets a numeric suffix instead of overwriting the earlier bundle.
pub fn bundle_file_names(cases: &[Case]) -> Vec<String> {
    let mut used = HashSet::new();
    cases
        .iter()
        .map(|case| {
            let base = format!("case_{}", sanitize_key(&case.key));
            let mut name = format!("{base}.log");
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{base}_{n}.log");
                n += 1;
            }
            name
        })
        .collect()
}

/// Write one log per identity into `dir`
pub fn write_bundles(cases: &[Case], dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut written = Vec::with_capacity(cases.len());
    for (case, name) in cases.iter().zip(bundle_file_names(cases)) {
        let path = dir.join(name);
        std::fs::write(&path, render_log(std::slice::from_ref(case)))
            .with_context(|| format!("Failed to write bundle: {}", path.display()))?;
        written.push(path);
    }

    info!(dir = %dir.display(), bundles = written.len(), "bundled cases");
    Ok(written)
}

/// Write the wrong answers into a single log
pub fn write_false_cases(false_cases: &FalseCases, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, render_log(&false_cases.cases))
        .with_context(|| format!("Failed to write false cases: {}", path.display()))?;

    info!(
        file = %path.display(),
        emitted = false_cases.emitted,
        total = false_cases.total,
        "wrote false cases"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_log;
    use crate::models::{Answer, ModelOutput};
    use tempfile::tempdir;

    fn output(model: &str, content: &str, answer: &str) -> ModelOutput {
        let mut output = ModelOutput::new(model, content);
        output.answer = Some(Answer::parse(answer));
        output
    }

    fn case(key: &str, outputs: Vec<ModelOutput>) -> Case {
        let mut case = Case::new(key, "How many?", "SELECT count(*) FROM t");
        case.model_outputs = outputs;
        case
    }

    fn included() -> Vec<String> {
        vec!["gpt-4o".to_string(), "deepseek-v3".to_string()]
    }

    fn scenario() -> (Vec<Case>, Vec<Case>) {
        let file1 = vec![case("A", vec![output("gpt-4o", "SELECT 5", "[5][5]")])];
        let file2 = vec![case(
            "A",
            vec![
                output("gpt-4o", "SELECT 6", "[5][6]"),
                output("deepseek-v3", "SELECT 3", "[3][3]"),
            ],
        )];
        (file1, file2)
    }

    #[test]
    fn test_bundle_keeps_first_seen_output() {
        let (file1, file2) = scenario();
        let merged = aggregate([file1, file2], &included());

        assert_eq!(merged.len(), 1);
        let outputs = &merged[0].model_outputs;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].model_name, "gpt-4o");
        assert_eq!(outputs[0].content, "SELECT 5");
        assert!(outputs[0].is_correct());
        assert_eq!(outputs[1].model_name, "deepseek-v3");
        assert!(outputs[1].is_correct());
    }

    #[test]
    fn test_filter_false_drops_all_correct_identity() {
        let (file1, file2) = scenario();
        let merged = aggregate([file1, file2], &included());
        let false_cases = filter_false(&merged);

        assert!(false_cases.cases.is_empty());
        assert_eq!(false_cases.emitted, 0);
        assert_eq!(false_cases.total, 1);
    }

    #[test]
    fn test_filter_false_keeps_only_wrong_outputs() {
        let merged = aggregate(
            [vec![case(
                "B",
                vec![
                    output("gpt-4o", "SELECT 1", "[1][2]"),
                    output("deepseek-v3", "SELECT 2", "[2][2]"),
                ],
            )]],
            &included(),
        );
        let false_cases = filter_false(&merged);

        assert_eq!(false_cases.emitted, 1);
        assert_eq!(false_cases.cases[0].model_outputs.len(), 1);
        assert_eq!(false_cases.cases[0].model_outputs[0].model_name, "gpt-4o");
    }

    #[test]
    fn test_excluded_models_are_dropped() {
        let merged = aggregate(
            [vec![case(
                "C",
                vec![
                    output("llama3.3-70b", "SELECT 1", "[1][2]"),
                    output("gpt-4o", "SELECT 2", "[2][2]"),
                ],
            )]],
            &included(),
        );
        let names: Vec<_> = merged[0].model_outputs.iter().map(|o| o.model_name.as_str()).collect();
        assert_eq!(names, vec!["gpt-4o"]);
        assert!(filter_false(&merged).cases.is_empty());
    }

    #[test]
    fn test_same_key_different_truth_stays_separate() {
        let first = case("A", vec![output("gpt-4o", "x", "[1][1]")]);
        let mut second = case("A", vec![output("gpt-4o", "y", "[1][1]")]);
        second.truth = "SELECT 2".to_string();

        let merged = aggregate([vec![first], vec![second]], &included());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].model_outputs[0].content, "x");
        assert_eq!(merged[1].model_outputs[0].content, "y");
    }

    #[test]
    fn test_at_most_one_output_per_identity_and_model() {
        let repeated = || case("A", vec![output("gpt-4o", "x", "[1][1]"), output("gpt-4o", "y", "[1][1]")]);
        let merged = aggregate([vec![repeated()], vec![repeated()], vec![repeated()]], &included());

        for case in &merged {
            let mut names: Vec<_> = case.model_outputs.iter().map(|o| &o.model_name).collect();
            let before = names.len();
            names.sort();
            names.dedup();
            assert_eq!(before, names.len());
        }
    }

    #[test]
    fn test_bundle_file_names_disambiguate_keys() {
        let first = case("a/b", vec![]);
        let mut second = case("a/b", vec![]);
        second.question = "Other question".to_string();
        assert_eq!(
            bundle_file_names(&[first, second, case("c", vec![])]),
            vec!["case_a_b.log", "case_a_b_2.log", "case_c.log"]
        );
    }

    #[test]
    fn test_write_bundles_and_false_cases() {
        let dir = tempdir().unwrap();
        let merged = aggregate(
            [vec![case("K1", vec![output("gpt-4o", "SELECT 1", "[1][2]")])]],
            &included(),
        );

        let written = write_bundles(&merged, &dir.path().join("bundled_logs")).unwrap();
        assert_eq!(written.len(), 1);
        let content = std::fs::read_to_string(&written[0]).unwrap();
        assert_eq!(parse_log(&content).cases, merged);

        let false_path = dir.path().join("false_logs").join("all_false_cases.log");
        write_false_cases(&filter_false(&merged), &false_path).unwrap();
        let content = std::fs::read_to_string(&false_path).unwrap();
        assert_eq!(parse_log(&content).cases.len(), 1);
    }

    #[test]
    fn test_aggregate_files_counts_skipped_segments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("take.log");
        std::fs::write(
            &path,
            "******************************\n\nCASE: a\nQUESTION: q\n\nLLM [gpt-4o]: x\n\
             ******************************\n\nCASE: b\nQUESTION: q\nTRUE: t\n\nLLM [gpt-4o]: y\n",
        )
        .unwrap();

        let aggregation = aggregate_files(&[path], &included()).unwrap();
        assert_eq!(aggregation.skipped_segments, 1);
        assert_eq!(aggregation.cases.len(), 1);
        assert_eq!(aggregation.cases[0].key, "b");
    }
}
