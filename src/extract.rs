//! Pull fenced code out of free-form model replies.

use regex::Regex;
use std::sync::LazyLock;

/// ```` ```label ... ``` ````, lazily matched so adjacent blocks stay separate.
/// Both fences must open their line; backticks inside prose or code don't count.
static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[ \t]*([A-Za-z0-9_+\-.]*)[^\n]*\n(.*?)^[ \t]*```")
        .expect("fence regex is valid")
});

/// Recognizes fenced blocks whose label names an executable language.
#[derive(Debug, Clone)]
pub struct CodeBlockExtractor {
    languages: Vec<String>,
}

impl CodeBlockExtractor {
    pub fn new<S: AsRef<str>>(languages: &[S]) -> Self {
        Self {
            languages: languages
                .iter()
                .map(|l| l.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    fn accepts(&self, label: &str) -> bool {
        let label = label.to_ascii_lowercase();
        self.languages.iter().any(|l| *l == label)
    }

    /// Code segments in order of appearance. Empty means "no code present".
    pub fn extract(&self, text: &str) -> Vec<String> {
        let text = text.replace("\r\n", "\n");
        FENCE
            .captures_iter(&text)
            .filter(|caps| self.accepts(&caps[1]))
            .map(|caps| caps[2].trim_end().to_string())
            .filter(|code| !code.trim().is_empty())
            .collect()
    }

    /// Extract and merge into the single unit one attempt executes.
    pub fn extract_unit(&self, text: &str) -> Option<String> {
        merge_segments(&self.extract(text))
    }
}

/// Join segments with blank lines, preserving their order. Later segments
/// may use names defined by earlier ones, so they always run as one unit.
pub fn merge_segments(segments: &[String]) -> Option<String> {
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python() -> CodeBlockExtractor {
        CodeBlockExtractor::new(&["python", "py"])
    }

    #[test]
    fn test_single_block() {
        let text = "Here you go:\n```python\nprint(df.shape)\n```\nDone.";
        assert_eq!(python().extract(text), vec!["print(df.shape)"]);
    }

    #[test]
    fn test_no_code_is_empty() {
        let text = "The file has 3 columns and no missing values.";
        assert!(python().extract(text).is_empty());
        assert!(python().extract_unit(text).is_none());
    }

    #[test]
    fn test_multiple_blocks_merge_in_order() {
        let text = "First load:\n```python\ndf = pd.read_csv(FILE_PATH)\n```\nthen summarize:\n```py\nprint(df.describe())\n```";
        let unit = python().extract_unit(text).unwrap();
        assert_eq!(unit, "df = pd.read_csv(FILE_PATH)\n\nprint(df.describe())");
    }

    #[test]
    fn test_other_languages_and_unlabeled_are_narrative() {
        let text = "```bash\nrm -rf /\n```\n```\nplain\n```\n```json\n{}\n```";
        assert!(python().extract(text).is_empty());
    }

    #[test]
    fn test_label_is_case_insensitive() {
        let text = "```Python\nx = 1\n```";
        assert_eq!(python().extract(text), vec!["x = 1"]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let text = "```python\r\nprint(1)\r\nprint(2)\r\n```\r\n";
        assert_eq!(python().extract(text), vec!["print(1)\nprint(2)"]);
    }

    #[test]
    fn test_blank_block_is_ignored() {
        let text = "```python\n\n   \n```\n```python\nprint(3)\n```";
        assert_eq!(python().extract(text), vec!["print(3)"]);
    }

    #[test]
    fn test_label_with_trailing_info() {
        let text = "```python title=analysis.py\nprint(4)\n```";
        assert_eq!(python().extract(text), vec!["print(4)"]);
    }

    #[test]
    fn test_inline_backticks_in_prose_do_not_open_a_fence() {
        let text = "Wrap code in ``` fences like this:\n```python\nprint(5)\n```\nand ``` again.\n```python\nprint(6)\n```";
        assert_eq!(python().extract(text), vec!["print(5)", "print(6)"]);
    }

    #[test]
    fn test_backticks_inside_code_do_not_close_the_block() {
        let text = "```python\nprint('use ``` to fence')\n```";
        assert_eq!(python().extract(text), vec!["print('use ``` to fence')"]);
    }

    #[test]
    fn test_merge_empty() {
        assert!(merge_segments(&[]).is_none());
    }
}
