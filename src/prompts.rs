use anyhow::{Context, Result, bail};
use std::path::Path;

/// One `[name]` block of the prompt file, header line included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSection {
    pub name: String,
    pub content: String,
}

/// Parse `[section]` blocks. Lines are trimmed; blank lines before the first
/// header are ignored, any other text there is an error.
pub fn parse_sections(text: &str) -> Result<Vec<PromptSection>> {
    let mut sections: Vec<PromptSection> = Vec::new();

    for (number, line) in text.lines().map(str::trim).enumerate() {
        if line.starts_with('[') && line.ends_with(']') && line.len() >= 2 {
            sections.push(PromptSection {
                name: line[1..line.len() - 1].to_string(),
                content: format!("{line}\n"),
            });
            continue;
        }

        match sections.last_mut() {
            Some(section) => {
                section.content.push_str(line);
                section.content.push('\n');
            }
            None if line.is_empty() => {}
            None => bail!("Prompt text before the first [section] header on line {}", number + 1),
        }
    }

    for section in &mut sections {
        section.content = section.content.trim().to_string();
    }
    Ok(sections)
}

/// System prompt made of every section not excluded, in file order
pub fn system_prompt(sections: &[PromptSection], exclude: &[String]) -> String {
    sections
        .iter()
        .filter(|s| !exclude.contains(&s.name))
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn load_system_prompt(path: &Path, exclude: &[String]) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompts file: {}", path.display()))?;
    let sections = parse_sections(&text)
        .with_context(|| format!("Invalid prompts file: {}", path.display()))?;
    Ok(system_prompt(&sections, exclude))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPTS: &str = "
[schema]
Table admissions(id, kind)

[example]
Q: how many?
  A: SELECT count(*) FROM admissions

[categories]
1 - Schema mismatch
";

    #[test]
    fn test_parse_sections() {
        let sections = parse_sections(PROMPTS).unwrap();
        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["schema", "example", "categories"]);
        assert_eq!(sections[0].content, "[schema]\nTable admissions(id, kind)");
        assert_eq!(
            sections[1].content,
            "[example]\nQ: how many?\nA: SELECT count(*) FROM admissions"
        );
    }

    #[test]
    fn test_system_prompt_excludes_sections() {
        let sections = parse_sections(PROMPTS).unwrap();
        let prompt = system_prompt(&sections, &["example".to_string()]);
        assert!(prompt.starts_with("[schema]"));
        assert!(prompt.contains("[categories]\n1 - Schema mismatch"));
        assert!(!prompt.contains("[example]"));
    }

    #[test]
    fn test_text_before_header_is_error() {
        let result = parse_sections("stray line\n[schema]\nx\n");
        assert!(result.unwrap_err().to_string().contains("line 1"));
    }

    #[test]
    fn test_load_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.md");
        std::fs::write(&path, PROMPTS).unwrap();
        let prompt = load_system_prompt(&path, &[]).unwrap();
        assert!(prompt.contains("[example]"));
        assert!(load_system_prompt(&dir.path().join("missing.md"), &[]).is_err());
    }
}
