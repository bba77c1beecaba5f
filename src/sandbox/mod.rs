pub mod env;
pub mod python;

pub use env::{AllowList, CapabilityEnvironment};
pub use python::PythonSandbox;

use std::fmt;

const MAX_CAPTURE_CHARS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The code raised during the main execution step.
    Raised,
    /// The code asked for a module outside the import allow-list.
    ImportNotPermitted,
    /// The per-attempt deadline expired and the interpreter was killed.
    TimedOut,
    /// The interpreter could not be started or produced no usable result.
    Interpreter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFault {
    pub kind: FaultKind,
    pub message: String,
    pub trace: String,
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl RuntimeFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: String::new(),
        }
    }
}

/// What one execution of a merged code unit produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        /// Textual form of the trailing expression, when there was one.
        result: Option<String>,
    },
    Failure(RuntimeFault),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Runs one merged code unit inside a capability environment.
///
/// Implementations must never let the unit's output reach the caller's
/// streams and must turn every fault of the main step into
/// `ExecutionOutcome::Failure`.
pub trait Executor {
    fn execute(&self, code: &str, env: &CapabilityEnvironment) -> ExecutionOutcome;
}

const STATEMENT_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "async", "return", "if", "elif", "else", "for", "while",
    "with", "try", "except", "finally", "raise", "pass", "break", "continue", "del", "assert",
    "global", "nonlocal", "lambda", "yield", "await", "print",
];

/// The last non-blank line, if it can be evaluated on its own as an
/// expression. Assignments, imports, definitions, other statements and
/// indented block bodies are skipped.
pub fn trailing_expression(code: &str) -> Option<String> {
    let line = code.lines().rev().find(|l| !l.trim().is_empty())?;
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    let line = line.trim_end();
    if line.starts_with('#') || line.starts_with('@') || line.ends_with(':') {
        return None;
    }
    let first_word: String = line
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if STATEMENT_KEYWORDS.contains(&first_word.as_str()) {
        return None;
    }
    if has_top_level_assignment(line) || line.ends_with('\\') || line.contains(';') {
        return None;
    }
    Some(line.to_string())
}

/// `=` outside brackets and strings that is not part of a comparison.
/// Catches `x = 1`, `x += 1`, `x: int = 1` and `a, b = t`; keyword
/// arguments like `f(a=1)` sit inside brackets and don't count.
fn has_top_level_assignment(line: &str) -> bool {
    let bytes = line.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = if i > 0 { bytes[i - 1] } else { b' ' };
                let next = bytes.get(i + 1).copied().unwrap_or(b' ');
                let comparison = next == b'='
                    || prev == b'='
                    || prev == b'!'
                    || ((prev == b'<' || prev == b'>')
                        && !(i >= 2 && bytes[i - 2] == prev));
                if !comparison {
                    return true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Cap captured text the way a chat transcript can carry it.
pub(crate) fn truncate_capture(text: String) -> String {
    let Some((end, _)) = text.char_indices().nth(MAX_CAPTURE_CHARS) else {
        return text;
    };
    let mut truncated = String::with_capacity(end + 40);
    truncated.push_str(&text[..end]);
    truncated.push_str("\n...[output truncated to 50000 characters]");
    truncated
}
