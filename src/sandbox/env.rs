//! The names generated code may use.
//!
//! An [`AllowList`] is a plain value built per session and handed to
//! [`CapabilityEnvironment`]; nothing here is process-wide or mutable
//! after construction.

use crate::security::path::{confine_to_root, PathError};
use crate::security::policy::is_denied_module;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Name under which the confined upload path is bound.
pub const FILE_VARIABLE: &str = "FILE_PATH";

/// Builtins that are never exposed, whatever the allow-list says.
pub const FORBIDDEN_BUILTINS: &[&str] = &[
    "open",
    "eval",
    "exec",
    "compile",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "exit",
    "quit",
    "help",
    "memoryview",
    "__import__",
    "__loader__",
    "__spec__",
];

const SAFE_BUILTINS: &[&str] = &[
    // sizes, predicates, conversions
    "len", "isinstance", "issubclass", "callable", "hasattr", "type", "id", "hash", "repr",
    "str", "int", "float", "bool", "complex", "bytes", "bytearray", "chr", "ord", "bin", "hex",
    "oct", "ascii", "format",
    // arithmetic and aggregates
    "abs", "round", "pow", "divmod", "sum", "min", "max", "all", "any",
    // sequences and iteration
    "list", "tuple", "dict", "set", "frozenset", "range", "enumerate", "zip", "map", "filter",
    "sorted", "reversed", "iter", "next", "slice",
    // classes
    "object", "super", "property", "staticmethod", "classmethod", "__build_class__", "dir",
    "print",
    // exceptions code may raise or catch
    "BaseException", "Exception", "ArithmeticError", "AssertionError", "AttributeError",
    "IndexError", "KeyError", "LookupError", "NameError", "NotImplementedError",
    "OverflowError", "RuntimeError", "StopIteration", "TypeError", "ValueError",
    "ZeroDivisionError", "ImportError", "ModuleNotFoundError", "Warning", "UserWarning",
    "NotImplemented", "Ellipsis",
];

const SAFE_MODULES: &[&str] = &[
    // tabular, numeric, plotting
    "pandas", "numpy", "scipy", "matplotlib", "seaborn",
    // serialization and documents
    "json", "csv", "pypdf", "PyPDF2",
    // date and time
    "datetime", "time", "calendar",
    // math
    "math", "statistics", "decimal", "fractions", "random",
    // collections and utilities
    "collections", "itertools", "functools", "operator", "copy", "re", "string", "textwrap",
    "pprint",
];

/// Pre-bound handles: (variable, module).
const DEFAULT_BINDINGS: &[(&str, &str)] = &[
    ("pd", "pandas"),
    ("np", "numpy"),
    ("plt", "matplotlib.pyplot"),
    ("sns", "seaborn"),
    ("json", "json"),
    ("pypdf", "pypdf"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub module: String,
}

/// Builtins, importable module roots and pre-bound handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    builtins: BTreeSet<String>,
    modules: BTreeSet<String>,
    bindings: Vec<Binding>,
}

impl Default for AllowList {
    fn default() -> Self {
        let mut allow = Self::empty();
        for name in SAFE_BUILTINS {
            allow.allow_builtin(name);
        }
        for module in SAFE_MODULES {
            allow.allow_module(module);
        }
        for (name, module) in DEFAULT_BINDINGS {
            allow.bind(name, module);
        }
        allow
    }
}

impl AllowList {
    /// Deny everything.
    pub fn empty() -> Self {
        Self {
            builtins: BTreeSet::new(),
            modules: BTreeSet::new(),
            bindings: Vec::new(),
        }
    }

    /// Returns false for names on the forbidden list.
    pub fn allow_builtin(&mut self, name: &str) -> bool {
        if FORBIDDEN_BUILTINS.contains(&name) {
            return false;
        }
        self.builtins.insert(name.to_string());
        true
    }

    /// Returns false for modules the policy guard rejects.
    pub fn allow_module(&mut self, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module).trim();
        if root.is_empty() || is_denied_module(root) {
            return false;
        }
        self.modules.insert(root.to_string());
        true
    }

    /// Bind `name` to `module`; the module's root must already be importable.
    pub fn bind(&mut self, name: &str, module: &str) -> bool {
        let root = module.split('.').next().unwrap_or(module);
        if !self.modules.contains(root) || FORBIDDEN_BUILTINS.contains(&name) {
            return false;
        }
        self.bindings.retain(|b| b.name != name);
        self.bindings.push(Binding {
            name: name.to_string(),
            module: module.to_string(),
        });
        true
    }

    pub fn with_extra_modules<S: AsRef<str>>(mut self, modules: &[S]) -> Self {
        for module in modules {
            if !self.allow_module(module.as_ref()) {
                tracing::warn!(module = module.as_ref(), "refusing to allow denied module");
            }
        }
        self
    }

    pub fn builtins(&self) -> impl Iterator<Item = &str> {
        self.builtins.iter().map(String::as_str)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

/// The name space one attempt executes in. Local variables are not part
/// of it: every execution starts from a fresh scope.
#[derive(Debug, Clone)]
pub struct CapabilityEnvironment {
    allow: AllowList,
    file: Option<PathBuf>,
}

impl CapabilityEnvironment {
    pub fn new(allow: AllowList) -> Self {
        Self { allow, file: None }
    }

    /// Expose `reference` as [`FILE_VARIABLE`] if it resolves to a file
    /// inside `upload_root`.
    pub fn bind_file(&mut self, upload_root: &Path, reference: &str) -> Result<&Path, PathError> {
        let path = confine_to_root(upload_root, reference)?;
        Ok(self.file.insert(path).as_path())
    }

    /// Like [`bind_file`](Self::bind_file), but a refused reference only
    /// leaves the environment without file access.
    pub fn with_file(mut self, upload_root: &Path, reference: &str) -> Self {
        if let Err(e) = self.bind_file(upload_root, reference) {
            tracing::warn!(reference, error = %e, "file reference not bound");
        }
        self
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}
