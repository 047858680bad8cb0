/// Line of 30 `*` separating case blocks
pub const DELIMITER: &str = "******************************";

/// Line of 30 `=` opening an experiment header
pub const BANNER: &str = "==============================";

/// One classified log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Case(&'a str),
    Question(&'a str),
    Truth(&'a str),
    Llm { name: &'a str, content: &'a str },
    Model(&'a str),
    Usage(&'a str),
    Answer(&'a str),
    Evaluation(&'a str),
    Banner,
    Text(&'a str),
}

#[derive(Clone, Copy)]
enum Field {
    Case,
    Question,
    Truth,
    Model,
    Usage,
    Answer,
    Evaluation,
}

const FIELDS: [(&str, Field); 7] = [
    ("CASE:", Field::Case),
    ("QUESTION:", Field::Question),
    ("TRUE:", Field::Truth),
    ("MODEL:", Field::Model),
    ("USAGE:", Field::Usage),
    ("ANSWER:", Field::Answer),
    ("EVALUATION:", Field::Evaluation),
];

impl Field {
    fn token(self, value: &str) -> Token<'_> {
        match self {
            Field::Case => Token::Case(value),
            Field::Question => Token::Question(value),
            Field::Truth => Token::Truth(value),
            Field::Model => Token::Model(value),
            Field::Usage => Token::Usage(value),
            Field::Answer => Token::Answer(value),
            Field::Evaluation => Token::Evaluation(value),
        }
    }
}

/// Classify a single line. Markers must start at column zero.
pub fn tokenize_line(line: &str) -> Token<'_> {
    let line = line.trim_end();

    if line == BANNER {
        return Token::Banner;
    }

    if let Some(token) = tokenize_llm(line) {
        return token;
    }

    for (marker, field) in FIELDS {
        if let Some(value) = line.strip_prefix(marker) {
            return field.token(value.trim());
        }
    }

    Token::Text(line)
}

/// `LLM [<name>]: <content>`; a malformed label is plain text
fn tokenize_llm(line: &str) -> Option<Token<'_>> {
    let rest = line.strip_prefix("LLM [")?;
    let close = rest.find("]:")?;
    let name = &rest[..close];
    if name.is_empty() {
        return None;
    }
    Some(Token::Llm {
        name,
        content: rest[close + 2..].trim(),
    })
}

/// Every `LLM [<name>]:` marker inside free text, with the text that follows it
/// up to the next marker. Used for judge evaluations where markers appear inline.
pub fn split_inline_llm_entries(text: &str) -> Vec<(&str, &str)> {
    let mut starts = Vec::new();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find("LLM [") {
        let start = search_from + offset;
        let label = &text[start + 5..];
        match label.find("]:") {
            Some(close) if close > 0 && !label[..close].contains('\n') => {
                starts.push((start, &label[..close], start + 5 + close + 2));
                search_from = start + 5 + close + 2;
            }
            _ => search_from = start + 5,
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &(_, name, body_start))| {
            let body_end = starts.get(i + 1).map_or(text.len(), |next| next.0);
            (name, text[body_start..body_end].trim())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiters_are_thirty_characters() {
        assert_eq!(DELIMITER.len(), 30);
        assert_eq!(BANNER.len(), 30);
    }

    #[test]
    fn test_tokenize_fields() {
        assert_eq!(tokenize_line("CASE: abc"), Token::Case("abc"));
        assert_eq!(tokenize_line("QUESTION: how many?"), Token::Question("how many?"));
        assert_eq!(tokenize_line("TRUE: SELECT 1\r"), Token::Truth("SELECT 1"));
        assert_eq!(tokenize_line("MODEL: gpt-4o-2024"), Token::Model("gpt-4o-2024"));
        assert_eq!(tokenize_line("EVALUATION:"), Token::Evaluation(""));
        assert_eq!(tokenize_line(BANNER), Token::Banner);
    }

    #[test]
    fn test_tokenize_llm_line() {
        assert_eq!(
            tokenize_line("LLM [gpt-4o]: SELECT count(*) FROM t"),
            Token::Llm {
                name: "gpt-4o",
                content: "SELECT count(*) FROM t"
            }
        );
    }

    #[test]
    fn test_malformed_llm_label_is_text() {
        assert_eq!(tokenize_line("LLM []: x"), Token::Text("LLM []: x"));
        assert_eq!(tokenize_line("LLM [open"), Token::Text("LLM [open"));
    }

    #[test]
    fn test_markers_must_start_the_line() {
        assert_eq!(tokenize_line("  CASE: x"), Token::Text("  CASE: x"));
        assert_eq!(tokenize_line("free text"), Token::Text("free text"));
    }

    #[test]
    fn test_split_inline_llm_entries() {
        let text = "LLM [a]: - Error categories: [1] LLM [b]: - Error categories: [2, 3]";
        let entries = split_inline_llm_entries(text);
        assert_eq!(
            entries,
            vec![
                ("a", "- Error categories: [1]"),
                ("b", "- Error categories: [2, 3]")
            ]
        );
    }

    #[test]
    fn test_split_inline_llm_entries_across_lines() {
        let text = "LLM [a]:\n- Explanation:\nfirst\nLLM [b]:\nsecond";
        let entries = split_inline_llm_entries(text);
        assert_eq!(entries, vec![("a", "- Explanation:\nfirst"), ("b", "second")]);
    }
}
