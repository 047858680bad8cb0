use super::tokenizer::{DELIMITER, Token, tokenize_line};
use crate::error::HarnessError;
use crate::models::{Answer, Case, ModelOutput, UsageField};
use tracing::warn;

/// Result of a lenient parse: every well-formed case plus the segments that were dropped
#[derive(Debug, Default)]
pub struct ParseReport {
    pub cases: Vec<Case>,
    pub skipped: Vec<SkippedSegment>,
}

impl ParseReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// A segment the parser could not turn into a case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSegment {
    /// Position of the segment among the non-empty segments of the input
    pub index: usize,
    pub reason: HarnessError,
}

/// Parse a whole log. Malformed segments are skipped and reported, never fatal.
pub fn parse_log(text: &str) -> ParseReport {
    let mut report = ParseReport::default();

    for (index, segment) in text
        .split(DELIMITER)
        .filter(|segment| !segment.trim().is_empty())
        .enumerate()
    {
        match parse_segment(segment) {
            Ok(Some(case)) => report.cases.push(case),
            Ok(None) => {}
            Err(reason) => {
                warn!(segment = index, %reason, "skipping malformed segment");
                report.skipped.push(SkippedSegment { index, reason });
            }
        }
    }

    report
}

/// Parse one delimited segment. Returns `Ok(None)` for an experiment header.
pub fn parse_segment(segment: &str) -> Result<Option<Case>, HarnessError> {
    let mut builder = SegmentBuilder::default();
    let mut evaluation: Option<Vec<&str>> = None;

    for line in segment.lines() {
        let token = tokenize_line(line);

        // A banner after case content opens the next run's header
        if token == Token::Banner {
            if builder.saw_marker {
                break;
            }
            builder.saw_banner = true;
            continue;
        }

        if let Some(lines) = evaluation.as_mut() {
            lines.push(line);
            continue;
        }

        match token {
            Token::Case(value) => builder.set_field("CASE", value)?,
            Token::Question(value) => builder.set_field("QUESTION", value)?,
            Token::Truth(value) => builder.set_field("TRUE", value)?,
            Token::Llm { name, content } => builder.start_output(name, content),
            Token::Model(value) => builder.attach(|pending| {
                pending
                    .output
                    .reported_model
                    .get_or_insert_with(|| value.to_string());
            }),
            Token::Usage(value) => builder.attach(|pending| {
                pending
                    .output
                    .usage
                    .get_or_insert_with(|| UsageField::parse(value));
            }),
            Token::Answer(value) => builder.attach(|pending| {
                pending
                    .output
                    .answer
                    .get_or_insert_with(|| Answer::parse(value));
            }),
            Token::Evaluation(value) => {
                builder.finish_output();
                builder.saw_marker = true;
                evaluation = Some(vec![value]);
            }
            Token::Banner => {}
            Token::Text(text) => builder.continue_content(text),
        }
    }

    builder.finish_output();

    if builder.saw_banner && !builder.saw_marker {
        return Ok(None);
    }

    let key = builder.key.ok_or(HarnessError::MissingField("CASE"))?;
    let question = builder.question.ok_or(HarnessError::MissingField("QUESTION"))?;
    let truth = builder.truth.ok_or(HarnessError::MissingField("TRUE"))?;

    let mut case = Case::new(key, question, truth);
    case.model_outputs = builder.outputs;
    case.evaluation = evaluation.map(|lines| lines.join("\n").trim().to_string());
    Ok(Some(case))
}

struct PendingOutput {
    output: ModelOutput,
    content: Vec<String>,
    /// Set once MODEL/USAGE/ANSWER follow; later free text no longer extends the content
    sealed: bool,
}

#[derive(Default)]
struct SegmentBuilder {
    key: Option<String>,
    question: Option<String>,
    truth: Option<String>,
    outputs: Vec<ModelOutput>,
    pending: Option<PendingOutput>,
    saw_marker: bool,
    saw_banner: bool,
}

impl SegmentBuilder {
    fn set_field(&mut self, field: &'static str, value: &str) -> Result<(), HarnessError> {
        self.finish_output();
        self.saw_marker = true;

        let slot = match field {
            "CASE" => &mut self.key,
            "QUESTION" => &mut self.question,
            _ => &mut self.truth,
        };

        if let Some(first) = slot.as_deref() {
            if first != value {
                return Err(HarnessError::ConflictingField {
                    field,
                    first: first.to_string(),
                    second: value.to_string(),
                });
            }
            return Ok(());
        }

        *slot = Some(value.to_string());
        Ok(())
    }

    fn start_output(&mut self, name: &str, content: &str) {
        self.finish_output();
        self.saw_marker = true;
        self.pending = Some(PendingOutput {
            output: ModelOutput::new(name, ""),
            content: vec![content.to_string()],
            sealed: false,
        });
    }

    fn attach(&mut self, apply: impl FnOnce(&mut PendingOutput)) {
        self.saw_marker = true;
        if let Some(pending) = self.pending.as_mut() {
            pending.sealed = true;
            apply(pending);
        }
    }

    fn continue_content(&mut self, text: &str) {
        if let Some(pending) = self.pending.as_mut() {
            if !pending.sealed {
                pending.content.push(text.to_string());
            }
        }
    }

    fn finish_output(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.output.content = crate::models::normalize(&pending.content.join("\n"));
            self.outputs.push(pending.output);
        }
    }
}
