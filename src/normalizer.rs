use crate::codec::{DELIMITER, parse_log, render_log, split_inline_llm_entries};
use crate::error::HarnessError;
use crate::models::{Case, OTHER_CATEGORY, normalize};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

static NEXT_CATEGORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*-\s*\[").expect("Invalid category marker regex pattern"));

/// Error annotation a judge gave one model's output
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorAnnotation {
    pub model_name: String,
    /// Text after `Error categories:` as written by the judge
    pub categories_text: Option<String>,
    /// Parsed categories; `None` when the list was missing or malformed
    pub categories: Option<BTreeSet<u8>>,
    pub explanation: Option<String>,
    /// The `[6] ...` part of the explanation when category 6 is present
    pub other_explanation: Option<String>,
    /// Entry text exactly as found, used when the entry has no recognizable shape
    pub raw: String,
}

impl ErrorAnnotation {
    fn render(&self) -> String {
        match (&self.categories_text, &self.explanation) {
            (Some(categories_text), Some(explanation)) => {
                let list = match &self.categories {
                    Some(categories) => format_category_list(categories),
                    None => categories_text.clone(),
                };
                format!(
                    "LLM [{}]:\n- Error categories: {}\n- Explanation:\n{}\n",
                    self.model_name, list, explanation
                )
            }
            _ => format!("LLM [{}]: {}\n", self.model_name, self.raw),
        }
    }
}

/// Per-case entry of the error summary log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSummary {
    pub case_key: String,
    pub models: Vec<ModelErrors>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelErrors {
    pub model_name: String,
    pub categories: BTreeSet<u8>,
    pub other_explanation: Option<String>,
}

/// Canonical cases plus the error summary extracted from them
#[derive(Debug, Default)]
pub struct NormalizedLog {
    pub cases: Vec<Case>,
    pub summaries: Vec<ErrorSummary>,
    pub skipped: usize,
}

/// Strict parser for list literals such as `[1, 3, 6]`.
///
/// Only digits, commas, brackets and whitespace are accepted and every element
/// must fit in a `u8`. Ordering and duplicates carry no meaning.
pub fn parse_category_list(text: &str) -> Result<BTreeSet<u8>, HarnessError> {
    let invalid = || HarnessError::InvalidCategoryList(text.to_string());
    let trimmed = text.trim();

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || c == ',' || c == '[' || c == ']' || c.is_whitespace())
    {
        return Err(invalid());
    }

    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(invalid)?;

    if inner.contains(['[', ']']) {
        return Err(invalid());
    }
    if inner.trim().is_empty() {
        return Ok(BTreeSet::new());
    }

    inner
        .split(',')
        .map(|item| item.trim().parse::<u8>().map_err(|_| invalid()))
        .collect()
}

pub fn format_category_list(categories: &BTreeSet<u8>) -> String {
    let items: Vec<String> = categories.iter().map(u8::to_string).collect();
    format!("[{}]", items.join(", "))
}

/// Split a judge evaluation into per-model annotations
pub fn annotate_evaluation(evaluation: &str) -> Vec<ErrorAnnotation> {
    split_inline_llm_entries(evaluation)
        .into_iter()
        .map(|(model_name, body)| annotate_entry(model_name, body))
        .collect()
}

fn annotate_entry(model_name: &str, body: &str) -> ErrorAnnotation {
    let categories_text = categories_text(body);
    let explanation = body
        .find("Explanation:")
        .map(|start| body[start + "Explanation:".len()..].trim().to_string());

    let categories = categories_text.as_deref().and_then(|text| {
        parse_category_list(text)
            .inspect_err(|e| warn!(model = model_name, error = %e, "ignoring error categories"))
            .ok()
    });

    let other_explanation = match (&categories, &explanation) {
        (Some(categories), Some(explanation)) if categories.contains(&OTHER_CATEGORY) => {
            extract_other_explanation(explanation)
        }
        _ => None,
    };

    ErrorAnnotation {
        model_name: model_name.to_string(),
        categories_text,
        categories,
        explanation,
        other_explanation,
        raw: body.to_string(),
    }
}

/// Value after `Error categories:` up to ` - `, the end of the line, or the end of the entry
fn categories_text(body: &str) -> Option<String> {
    let start = body.find("Error categories:")? + "Error categories:".len();
    let rest = body[start..].trim_start_matches([' ', '\t']);
    let end = [rest.find(" - "), rest.find('\n')]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(rest.len());
    let value = rest[..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// The explanation of category 6: from the `[6]` marker up to the next
/// `- [n]` category marker or the end of the block, collapsed to one line
pub fn extract_other_explanation(explanation: &str) -> Option<String> {
    let start = explanation.find("[6]")?;
    let after_marker = start + "[6]".len();
    let end = NEXT_CATEGORY
        .find(&explanation[after_marker..])
        .map_or(explanation.len(), |m| after_marker + m.start());
    let text = normalize(&explanation[start..end]);
    (!text.is_empty()).then_some(text)
}

/// Normalize a raw log: canonical evaluation blocks, error annotations attached
/// to matching model outputs, and the per-case error summary.
pub fn normalize_log(text: &str) -> NormalizedLog {
    let report = parse_log(text);
    let mut normalized = NormalizedLog {
        skipped: report.skipped_count(),
        ..NormalizedLog::default()
    };

    for mut case in report.cases {
        let annotations = case
            .evaluation
            .as_deref()
            .map(annotate_evaluation)
            .unwrap_or_default();

        if !annotations.is_empty() {
            case.evaluation = Some(
                annotations
                    .iter()
                    .map(ErrorAnnotation::render)
                    .collect::<String>()
                    .trim_end()
                    .to_string(),
            );
            apply_annotations(&mut case, &annotations);
            normalized.summaries.push(summarize(&case.key, &annotations));
        }

        normalized.cases.push(case);
    }

    normalized
}

fn apply_annotations(case: &mut Case, annotations: &[ErrorAnnotation]) {
    for annotation in annotations {
        let Some(categories) = &annotation.categories else {
            continue;
        };
        for output in case
            .model_outputs
            .iter_mut()
            .filter(|output| output.model_name == annotation.model_name)
        {
            output.error_categories = Some(categories.clone());
            output.error_explanation = annotation.other_explanation.clone();
        }
    }
}

fn summarize(case_key: &str, annotations: &[ErrorAnnotation]) -> ErrorSummary {
    ErrorSummary {
        case_key: case_key.to_string(),
        models: annotations
            .iter()
            .filter_map(|annotation| {
                Some(ModelErrors {
                    model_name: annotation.model_name.clone(),
                    categories: annotation.categories.clone()?,
                    other_explanation: annotation.other_explanation.clone(),
                })
            })
            .collect(),
    }
}

pub fn render_error_summary(summaries: &[ErrorSummary]) -> String {
    let mut out = String::new();
    for summary in summaries {
        out.push_str(&format!("CASE: {}\n", summary.case_key));
        for model in &summary.models {
            out.push_str(&format!(
                "LLM [{}]: {}\n",
                model.model_name,
                format_category_list(&model.categories)
            ));
            // One line per explanation; the reader takes a single `[6]` line
            if let Some(explanation) = &model.other_explanation {
                out.push_str(&normalize(explanation));
                out.push('\n');
            }
        }
        out.push_str(&format!("\n{DELIMITER}\n\n"));
    }
    out
}

/// Parse an error summary log. Lines that do not fit the format are ignored.
pub fn parse_error_summary(text: &str) -> Vec<ErrorSummary> {
    let mut summaries: Vec<ErrorSummary> = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('*') {
            continue;
        }

        if let Some(value) = line.strip_prefix("CASE:") {
            summaries.push(ErrorSummary {
                case_key: value.split_whitespace().next().unwrap_or_default().to_string(),
                models: Vec::new(),
            });
            continue;
        }

        let Some(summary) = summaries.last_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("LLM [") {
            let Some((name, list)) = rest.split_once("]:") else {
                continue;
            };
            match parse_category_list(list) {
                Ok(categories) => summary.models.push(ModelErrors {
                    model_name: name.to_string(),
                    categories,
                    other_explanation: None,
                }),
                Err(e) => warn!(case = %summary.case_key, error = %e, "ignoring summary line"),
            }
        } else if line.starts_with("[6]") {
            if let Some(model) = summary.models.last_mut() {
                model.other_explanation = Some(line.to_string());
            }
        }
    }

    summaries
}

/// Replace the `.log` suffix with `_error_summary.log`
pub fn error_summary_path(output: &Path) -> PathBuf {
    let name = output.to_string_lossy();
    match name.strip_suffix(".log") {
        Some(stem) => PathBuf::from(format!("{stem}_error_summary.log")),
        None => PathBuf::from(format!("{name}_error_summary.log")),
    }
}

/// Outcome of a cleanup run
#[derive(Debug)]
pub struct CleanupReport {
    pub cases: usize,
    pub annotated_cases: usize,
    pub skipped: usize,
    pub summary_path: PathBuf,
}

/// Normalize `input` into `output` and write the error summary beside it
pub fn cleanup_file(input: &Path, output: &Path) -> Result<CleanupReport> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read log file: {}", input.display()))?;
    let normalized = normalize_log(&content);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(output, render_log(&normalized.cases))
        .with_context(|| format!("Failed to write cleaned log: {}", output.display()))?;

    let summary_path = error_summary_path(output);
    std::fs::write(&summary_path, render_error_summary(&normalized.summaries))
        .with_context(|| format!("Failed to write error summary: {}", summary_path.display()))?;

    if normalized.skipped > 0 {
        warn!(skipped = normalized.skipped, "dropped malformed segments");
    }
    info!(
        cases = normalized.cases.len(),
        output = %output.display(),
        summary = %summary_path.display(),
        "cleanup finished"
    );

    Ok(CleanupReport {
        cases: normalized.cases.len(),
        annotated_cases: normalized.summaries.len(),
        skipped: normalized.skipped,
        summary_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelOutput;
    use tempfile::tempdir;

    const RAW_EVAL: &str = "
******************************

CASE: c1
QUESTION: How many patients died?
TRUE: SELECT count(*) FROM patients WHERE dod IS NOT NULL

EVALUATION:
LLM [gpt-4o]: - Error categories: [4, 6] - Explanation: [4] Condition misinterpretation: filters on the wrong column. - [6] Other: counts admissions instead of patients. LLM [deepseek-v3]: - Error categories: [1] - Explanation: [1] Schema mismatch: table deaths does not exist.

******************************

CASE: c2
QUESTION: q2
TRUE: t2

EVALUATION:
LLM [gpt-4o]: The query looks fine to me.
";

    #[test]
    fn test_parse_category_list() {
        assert_eq!(
            parse_category_list("[1, 3, 6]").unwrap(),
            BTreeSet::from([1, 3, 6])
        );
        assert_eq!(parse_category_list(" [6,1,1] ").unwrap(), BTreeSet::from([1, 6]));
        assert_eq!(parse_category_list("[]").unwrap(), BTreeSet::new());
    }

    #[test]
    fn test_parse_category_list_rejects_expressions() {
        for bad in ["[1, 2+3]", "__import__('os')", "[1, [2]]", "1, 2", "[300]", "[1,,2]", "[-1]"] {
            assert!(
                matches!(parse_category_list(bad), Err(HarnessError::InvalidCategoryList(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_annotate_evaluation_extracts_other_explanation() {
        let text = "LLM [a]: - Error categories: [4, 6] - Explanation: [4] wrong filter. - [6] Other: counts admissions. LLM [b]: - Error categories: [1] - Explanation: [1] bad table.";
        let annotations = annotate_evaluation(text);
        assert_eq!(annotations.len(), 2);

        assert_eq!(annotations[0].categories, Some(BTreeSet::from([4, 6])));
        assert_eq!(
            annotations[0].other_explanation.as_deref(),
            Some("[6] Other: counts admissions.")
        );
        assert_eq!(annotations[1].categories, Some(BTreeSet::from([1])));
        assert_eq!(annotations[1].other_explanation, None);
    }

    #[test]
    fn test_other_explanation_stops_at_next_category() {
        let explanation = "- [6] Other: missing limit\n- [2] Wrong aggregation: sum vs avg";
        assert_eq!(
            extract_other_explanation(explanation).as_deref(),
            Some("[6] Other: missing limit")
        );
        assert_eq!(extract_other_explanation("[1] only"), None);
    }

    #[test]
    fn test_bad_category_list_is_soft_failure() {
        let annotations =
            annotate_evaluation("LLM [a]: - Error categories: one and two - Explanation: unclear");
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].categories, None);
        assert_eq!(annotations[0].explanation.as_deref(), Some("unclear"));
    }

    #[test]
    fn test_normalize_log_reformats_evaluations() {
        let normalized = normalize_log(RAW_EVAL);
        assert_eq!(normalized.cases.len(), 2);
        assert_eq!(normalized.skipped, 0);

        let evaluation = normalized.cases[0].evaluation.as_deref().unwrap();
        assert!(evaluation.starts_with(
            "LLM [gpt-4o]:\n- Error categories: [4, 6]\n- Explanation:\n[4] Condition misinterpretation"
        ));
        assert!(evaluation.contains("LLM [deepseek-v3]:\n- Error categories: [1]\n- Explanation:\n[1] Schema mismatch"));

        let fallback = normalized.cases[1].evaluation.as_deref().unwrap();
        assert_eq!(fallback, "LLM [gpt-4o]: The query looks fine to me.");
    }

    #[test]
    fn test_normalize_log_builds_error_summary() {
        let normalized = normalize_log(RAW_EVAL);
        assert_eq!(normalized.summaries.len(), 2);

        let first = &normalized.summaries[0];
        assert_eq!(first.case_key, "c1");
        assert_eq!(first.models.len(), 2);
        assert_eq!(first.models[0].categories, BTreeSet::from([4, 6]));
        assert_eq!(
            first.models[0].other_explanation.as_deref(),
            Some("[6] Other: counts admissions instead of patients.")
        );
        assert!(normalized.summaries[1].models.is_empty());
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once = normalize_log(RAW_EVAL);
        let twice = normalize_log(&render_log(&once.cases));
        assert_eq!(once.cases, twice.cases);
        assert_eq!(once.summaries, twice.summaries);
    }

    #[test]
    fn test_annotations_attach_to_matching_outputs() {
        let mut case = Case::new("k", "q", "t");
        case.model_outputs.push(ModelOutput::new("gpt-4o", "SELECT 1"));
        case.evaluation = Some(
            "LLM [gpt-4o]: - Error categories: [6] - Explanation: [6] Other: returns a constant"
                .to_string(),
        );
        let normalized = normalize_log(&render_log(&[case]));

        let output = &normalized.cases[0].model_outputs[0];
        assert_eq!(output.error_categories, Some(BTreeSet::from([6])));
        assert_eq!(
            output.error_explanation.as_deref(),
            Some("[6] Other: returns a constant")
        );
    }

    #[test]
    fn test_error_summary_round_trip() {
        let summaries = normalize_log(RAW_EVAL).summaries;
        let rendered = render_error_summary(&summaries);
        assert!(rendered.starts_with("CASE: c1\nLLM [gpt-4o]: [4, 6]\n[6] Other: "));
        assert_eq!(parse_error_summary(&rendered), summaries);
    }

    #[test]
    fn test_multiline_other_explanation_survives_summary() {
        let explanation = "- [6] Other: first line\n  continues on a second line\n- [2] Wrong aggregation";
        let extracted = extract_other_explanation(explanation);
        assert_eq!(
            extracted.as_deref(),
            Some("[6] Other: first line continues on a second line")
        );

        let summaries = vec![ErrorSummary {
            case_key: "c9".to_string(),
            models: vec![ModelErrors {
                model_name: "gpt-4o".to_string(),
                categories: BTreeSet::from([2, 6]),
                other_explanation: Some("[6] Other: first line\ncontinues on a second line".to_string()),
            }],
        }];
        let parsed = parse_error_summary(&render_error_summary(&summaries));
        assert_eq!(
            parsed[0].models[0].other_explanation.as_deref(),
            Some("[6] Other: first line continues on a second line")
        );
        assert_eq!(parsed[0].models[0].categories, BTreeSet::from([2, 6]));
    }

    #[test]
    fn test_error_summary_path() {
        assert_eq!(
            error_summary_path(Path::new("output/cleanup_cat_eval.log")),
            PathBuf::from("output/cleanup_cat_eval_error_summary.log")
        );
        assert_eq!(
            error_summary_path(Path::new("out/clean")),
            PathBuf::from("out/clean_error_summary.log")
        );
    }

    #[test]
    fn test_cleanup_file_writes_both_outputs() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("cat_eval.log");
        let output = dir.path().join("clean").join("cat_eval.log");
        std::fs::write(&input, RAW_EVAL).unwrap();

        let report = cleanup_file(&input, &output).unwrap();
        assert_eq!(report.cases, 2);
        assert_eq!(report.annotated_cases, 2);
        assert!(output.exists());

        let summary = std::fs::read_to_string(&report.summary_path).unwrap();
        assert_eq!(parse_error_summary(&summary).len(), 2);
    }
}
