use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

/// Content recorded when every inference attempt failed
pub const TIMEOUT_SENTINEL: &str = "--timeout--";

/// Token count meaning "not reported". Scoring also treats 0 as unreported.
pub const UNREPORTED_TOKENS: i64 = -1;

/// Error category reserved for free-text "other" explanations
pub const OTHER_CATEGORY: u8 = 6;

static EXECUTED_ANSWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\((.+?)\)\s*\((.+?)\)\s*\((.+?)\)\s*\((.+?)\)")
        .expect("Invalid executed answer regex pattern")
});

static PAIR_ANSWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(.+?)\]\s*\[(.+?)\]").expect("Invalid paired answer regex pattern")
});

/// One benchmark question with its ground truth and every model's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Case identifier, unique within one log file
    pub key: String,
    /// Natural-language question
    pub question: String,
    /// Ground-truth SQL or reference answer
    pub truth: String,
    /// Model answers in the order they appear in the log
    pub model_outputs: Vec<ModelOutput>,
    /// Free-text judge evaluation, present in categorization logs
    pub evaluation: Option<String>,
}

impl Case {
    pub fn new(key: impl Into<String>, question: impl Into<String>, truth: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            question: question.into(),
            truth: truth.into(),
            model_outputs: Vec::new(),
            evaluation: None,
        }
    }

    pub fn identity(&self) -> CaseIdentity {
        CaseIdentity {
            key: self.key.clone(),
            question: self.question.clone(),
            truth: self.truth.clone(),
        }
    }

    pub fn output_for(&self, model_name: &str) -> Option<&ModelOutput> {
        self.model_outputs.iter().find(|o| o.model_name == model_name)
    }
}

/// Three-part identity used to merge cases across log files
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaseIdentity {
    pub key: String,
    pub question: String,
    pub truth: String,
}

/// One model's response to a case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Label taken from `LLM [<name>]`
    pub model_name: String,
    /// Whitespace-normalized answer text
    pub content: String,
    /// Model identifier echoed back by the provider
    pub reported_model: Option<String>,
    pub usage: Option<UsageField>,
    pub answer: Option<Answer>,
    /// Error taxonomy codes assigned during normalization
    pub error_categories: Option<BTreeSet<u8>>,
    /// Explanation attached to the "other" category
    pub error_explanation: Option<String>,
}

impl ModelOutput {
    pub fn new(model_name: impl Into<String>, content: &str) -> Self {
        Self {
            model_name: model_name.into(),
            content: normalize(content),
            reported_model: None,
            usage: None,
            answer: None,
            error_categories: None,
            error_explanation: None,
        }
    }

    /// Correctness is derived from the recorded answer; a missing answer is a mismatch.
    pub fn is_correct(&self) -> bool {
        self.answer.as_ref().is_some_and(Answer::is_correct)
    }

    pub fn reported_usage(&self) -> Option<Usage> {
        match &self.usage {
            Some(UsageField::Reported(usage)) => Some(*usage),
            _ => None,
        }
    }
}

/// Token usage as logged on the `USAGE:` line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "in")]
    pub tokens_in: i64,
    #[serde(rename = "out")]
    pub tokens_out: i64,
}

impl Usage {
    pub fn unreported() -> Self {
        Self {
            tokens_in: UNREPORTED_TOKENS,
            tokens_out: UNREPORTED_TOKENS,
        }
    }
}

/// `USAGE:` value; kept verbatim when it is not valid JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UsageField {
    Reported(Usage),
    Raw(String),
}

impl UsageField {
    pub fn parse(value: &str) -> Self {
        match serde_json::from_str::<Usage>(value) {
            Ok(usage) => UsageField::Reported(usage),
            Err(_) => UsageField::Raw(value.to_string()),
        }
    }
}

impl fmt::Display for UsageField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageField::Reported(usage) => write!(
                f,
                r#"{{"in": {}, "out": {}}}"#,
                usage.tokens_in, usage.tokens_out
            ),
            UsageField::Raw(raw) => f.write_str(raw),
        }
    }
}

/// Execution result of a model query next to the ground-truth result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Answer {
    /// `(result) (rows) (truth) (truth rows)`
    Executed {
        result: String,
        rows: String,
        truth: String,
        truth_rows: String,
    },
    /// `[result] [truth]`
    Pair { result: String, truth: String },
    /// Anything else, e.g. a failed execution on either side
    Unmatched(String),
}

impl Answer {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if let Some(caps) = EXECUTED_ANSWER.captures(value) {
            return Answer::Executed {
                result: caps[1].to_string(),
                rows: caps[2].to_string(),
                truth: caps[3].to_string(),
                truth_rows: caps[4].to_string(),
            };
        }
        if let Some(caps) = PAIR_ANSWER.captures(value) {
            return Answer::Pair {
                result: caps[1].to_string(),
                truth: caps[2].to_string(),
            };
        }
        Answer::Unmatched(value.to_string())
    }

    /// Model side and truth side as compared by the scorer
    pub fn sides(&self) -> Option<(String, String)> {
        match self {
            Answer::Executed {
                result,
                rows,
                truth,
                truth_rows,
            } => Some((format!("{result}{rows}"), format!("{truth}{truth_rows}"))),
            Answer::Pair { result, truth } => Some((result.clone(), truth.clone())),
            Answer::Unmatched(_) => None,
        }
    }

    pub fn is_correct(&self) -> bool {
        match self.sides() {
            Some((predict, truth)) => same_characters(&predict, &truth),
            None => false,
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Executed {
                result,
                rows,
                truth,
                truth_rows,
            } => write!(f, "({result}) ({rows}) ({truth}) ({truth_rows})"),
            Answer::Pair { result, truth } => write!(f, "[{result}] [{truth}]"),
            Answer::Unmatched(raw) => f.write_str(raw),
        }
    }
}

/// Character-multiset equality. Order-insensitive per character, so `"12"`
/// and `"21"` compare equal.
pub fn same_characters(a: &str, b: &str) -> bool {
    let mut left: Vec<char> = a.chars().collect();
    let mut right: Vec<char> = b.chars().collect();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}

/// Collapse internal whitespace runs to one space and trim
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize("  SELECT *\n\tFROM  t  "), "SELECT * FROM t");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(" a \n\n b\t c ");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_same_characters_is_order_insensitive() {
        assert!(same_characters("12", "21"));
        assert!(same_characters("(5,)1 rows", "1 rows(5,)"));
        assert!(!same_characters("5", "6"));
        assert!(!same_characters("55", "5"));
    }

    #[test]
    fn test_correctness_is_symmetric() {
        let pairs = [("abc", "cba"), ("5", "6"), ("", "x"), ("1 rows", "1 rows")];
        for (a, b) in pairs {
            assert_eq!(same_characters(a, b), same_characters(b, a));
        }
    }

    #[test]
    fn test_parse_pair_answer() {
        let answer = Answer::parse("[5] [5]");
        assert_eq!(
            answer,
            Answer::Pair {
                result: "5".to_string(),
                truth: "5".to_string()
            }
        );
        assert!(answer.is_correct());
        assert!(!Answer::parse("[5][6]").is_correct());
    }

    #[test]
    fn test_parse_executed_answer_includes_row_counts() {
        let answer = Answer::parse("(42,) (3 rows) (42,) (3 rows)");
        assert!(answer.is_correct());

        let wrong_rows = Answer::parse("(42,) (3 rows) (42,) (4 rows)");
        assert!(!wrong_rows.is_correct());
    }

    #[test]
    fn test_failed_execution_is_never_correct() {
        assert_eq!(
            Answer::parse("None None"),
            Answer::Unmatched("None None".to_string())
        );
        assert!(!Answer::parse("None None").is_correct());
        assert!(!Answer::parse("[] []").is_correct());
    }

    #[test]
    fn test_answer_display_round_trips() {
        for raw in ["(1) (2 rows) (1) (2 rows)", "[a] [b]", "None (7) (1 rows)"] {
            assert_eq!(Answer::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_usage_field_fails_soft() {
        assert_eq!(
            UsageField::parse(r#"{"in": 100, "out": 50}"#),
            UsageField::Reported(Usage {
                tokens_in: 100,
                tokens_out: 50
            })
        );
        assert_eq!(
            UsageField::parse("not json"),
            UsageField::Raw("not json".to_string())
        );
    }

    #[test]
    fn test_missing_answer_is_incorrect() {
        let output = ModelOutput::new("gpt-4o", "SELECT 1");
        assert!(!output.is_correct());
    }
}
