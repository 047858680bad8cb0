use thiserror::Error;

/// Failures callers need to tell apart; everything else travels as `anyhow::Error`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    #[error("unknown LLM name: {0}")]
    UnknownModel(String),

    #[error("field {field} set twice with different values ({first:?} vs {second:?})")]
    ConflictingField {
        field: &'static str,
        first: String,
        second: String,
    },

    #[error("segment is missing required field {0}")]
    MissingField(&'static str),

    #[error("invalid error category list: {0}")]
    InvalidCategoryList(String),

    #[error("case {0} not found, cannot resume")]
    ResumeKeyNotFound(String),
}
