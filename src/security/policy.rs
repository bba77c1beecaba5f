//! Pre-execution deny-list for generated Python.
//!
//! This is a lexical first line of defense, not a security boundary. It
//! looks at each line and a few characters around a match; aliasing
//! (`e = eval`), `getattr` indirection or string-built names all get past
//! it. The capability environment and the child process are what actually
//! constrain executed code.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Modules that reach the OS, processes, or the import machinery.
const DENIED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "shutil",
    "socket",
    "ctypes",
    "multiprocessing",
    "pty",
    "signal",
    "importlib",
    "builtins",
    "pathlib",
    "io",
];

const DYNAMIC_EVALUATION: &[&str] = &["eval", "exec", "compile", "__import__"];
const INTERACTIVE_INPUT: &[&str] = &["input", "breakpoint"];
const FILE_OPEN: &[&str] = &["open"];

static IMPORT_STMT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+(.+)$").expect("import regex is valid"));
static FROM_IMPORT_STMT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").expect("from-import regex is valid")
});
const COMPOUND_HEADERS: &[&str] = &[
    "if", "elif", "else", "while", "for", "with", "try", "except", "finally", "def", "class",
    "async",
];

static CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_]\w*)\s*\(").expect("call regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationCategory {
    ProcessImport,
    DynamicEvaluation,
    InteractiveInput,
    FileOpen,
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationCategory::ProcessImport => write!(f, "import of a process/OS-level module"),
            ViolationCategory::DynamicEvaluation => write!(f, "dynamic code evaluation"),
            ViolationCategory::InteractiveInput => write!(f, "interactive input"),
            ViolationCategory::FileOpen => write!(f, "raw file open"),
        }
    }
}

/// A denied construct. The attempt that produced it never executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub category: ViolationCategory,
    pub snippet: String,
    pub line: usize,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PolicyViolation: {} is not allowed (line {}: `{}`)",
            self.category, self.line, self.snippet
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticPolicyGuard;

impl StaticPolicyGuard {
    pub fn new() -> Self {
        Self
    }

    /// First violation in source order, if any.
    pub fn check(&self, code: &str) -> Result<(), PolicyViolation> {
        for (idx, raw) in code.lines().enumerate() {
            let line = code_text(raw);
            if line.trim().is_empty() {
                continue;
            }
            let violation = |category| PolicyViolation {
                category,
                snippet: raw.trim().to_string(),
                line: idx + 1,
            };

            for statement in line.split(';') {
                if imports_denied_module(strip_headers(statement)) {
                    return Err(violation(ViolationCategory::ProcessImport));
                }
            }

            for caps in CALL.captures_iter(&line) {
                let name = caps.get(1).map(|m| (m.as_str(), m.start()));
                let Some((name, start)) = name else { continue };
                let Some(category) = call_category(name) else {
                    continue;
                };
                if is_qualified(&line, start) || is_definition(&line, start) {
                    continue;
                }
                return Err(violation(category));
            }
        }
        Ok(())
    }
}

fn imports_denied_module(statement: &str) -> bool {
    if let Some(caps) = IMPORT_STMT.captures(statement) {
        let denied = caps[1]
            .split(',')
            .filter_map(|part| part.split_whitespace().next())
            .any(is_denied_module);
        if denied {
            return true;
        }
    }
    FROM_IMPORT_STMT
        .captures(statement)
        .is_some_and(|caps| is_denied_module(&caps[1]))
}

fn call_category(name: &str) -> Option<ViolationCategory> {
    if DYNAMIC_EVALUATION.contains(&name) {
        Some(ViolationCategory::DynamicEvaluation)
    } else if INTERACTIVE_INPUT.contains(&name) {
        Some(ViolationCategory::InteractiveInput)
    } else if FILE_OPEN.contains(&name) {
        Some(ViolationCategory::FileOpen)
    } else {
        None
    }
}

/// `os`, `os.path` and `subprocess` are denied; `osmnx` is not.
pub(crate) fn is_denied_module(module: &str) -> bool {
    let root = module.split('.').next().unwrap_or(module);
    DENIED_MODULES.contains(&root)
}

/// A call reached through an attribute (`df.eval(`, `re.compile(`) belongs
/// to a library object, not the builtin. Only the few characters before
/// the name are inspected.
fn is_qualified(line: &str, name_start: usize) -> bool {
    line[..name_start]
        .chars()
        .rev()
        .find(|c| !c.is_whitespace())
        .is_some_and(|c| c == '.')
}

/// `def open(self):` declares a method, it doesn't call the builtin.
fn is_definition(line: &str, name_start: usize) -> bool {
    let before = line[..name_start].trim_end();
    before.ends_with("def") && (before.len() == 3 || !is_ident_char(before, before.len() - 4))
}

fn is_ident_char(s: &str, idx: usize) -> bool {
    s.as_bytes()
        .get(idx)
        .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
}

/// The code part of a line: a trailing `#` comment is dropped and the
/// contents of string literals are blanked out, so neither can be mistaken
/// for a call, an import or a statement separator. Byte offsets are kept.
fn code_text(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in line.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                    out.push(c);
                    continue;
                }
                out.extend(std::iter::repeat(' ').take(c.len_utf8()));
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    out.push(c);
                }
                '#' => break,
                _ => out.push(c),
            },
        }
    }
    out
}

/// One-line compound statements (`try: import x`, `if ok: from y import z`)
/// put the body after the header's colon.
fn strip_headers(statement: &str) -> &str {
    let mut rest = statement.trim_start();
    loop {
        let keyword: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if !COMPOUND_HEADERS.contains(&keyword.as_str()) {
            return rest;
        }
        match header_colon(rest) {
            Some(idx) => rest = rest[idx + 1..].trim_start(),
            None => return rest,
        }
    }
}

/// First `:` outside brackets.
fn header_colon(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, b) in text.bytes().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b':' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}
