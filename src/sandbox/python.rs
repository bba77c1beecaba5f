use super::env::FILE_VARIABLE;
use super::{
    trailing_expression, truncate_capture, CapabilityEnvironment, ExecutionOutcome, Executor,
    FaultKind, RuntimeFault,
};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

const HARNESS: &str = include_str!("harness.py");
const ENVELOPE_MARKER: &str = "<<<fixloop:envelope>>>";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Runs each attempt in a fresh Python interpreter driven by the embedded
/// harness. Nothing the code prints reaches this process's stdout; the
/// harness redirects `sys.stdout` and the child's pipes are read here.
pub struct PythonSandbox {
    interpreter: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct HarnessRequest<'a> {
    code: &'a str,
    trailing: Option<String>,
    builtins: Vec<&'a str>,
    modules: Vec<&'a str>,
    bindings: Vec<HarnessBinding<'a>>,
    file_variable: &'a str,
    file_path: Option<String>,
}

#[derive(Serialize)]
struct HarnessBinding<'a> {
    name: &'a str,
    module: &'a str,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope {
    Ok {
        stdout: String,
        result: Option<String>,
        restored: bool,
    },
    Error {
        kind: String,
        message: String,
        trace: String,
        restored: bool,
    },
}

impl PythonSandbox {
    pub fn new(interpreter: &str) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            working_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory the interpreter starts in, normally the upload root.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    fn build_request<'a>(code: &'a str, env: &'a CapabilityEnvironment) -> HarnessRequest<'a> {
        let allow = env.allow_list();
        HarnessRequest {
            code,
            trailing: trailing_expression(code),
            builtins: allow.builtins().collect(),
            modules: allow.modules().collect(),
            bindings: allow
                .bindings()
                .iter()
                .map(|b| HarnessBinding {
                    name: &b.name,
                    module: &b.module,
                })
                .collect(),
            file_variable: FILE_VARIABLE,
            file_path: env.file_path().map(|p| p.display().to_string()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-I", "-c", HARNESS]);
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("MPLBACKEND", "Agg")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1");
        if let Some(dir) = self.working_dir.as_ref().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, request: &HarnessRequest<'_>) -> Result<(String, String), RuntimeFault> {
        let payload = serde_json::to_vec(request).map_err(|e| {
            RuntimeFault::new(FaultKind::Interpreter, format!("cannot encode request: {}", e))
        })?;

        let mut child = self.command().spawn().map_err(|e| {
            RuntimeFault::new(
                FaultKind::Interpreter,
                format!("failed to start interpreter '{}': {}", self.interpreter, e),
            )
        })?;

        // Drain both pipes on their own threads so a chatty child can't
        // block on a full pipe while we wait on it.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload) {
                tracing::debug!(error = %e, "interpreter closed stdin early");
            }
        }

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeFault::new(
                    FaultKind::TimedOut,
                    format!(
                        "TimeoutError: execution exceeded the {} second limit",
                        self.timeout.as_secs()
                    ),
                ));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeFault::new(
                    FaultKind::Interpreter,
                    format!("failed to wait for interpreter: {}", e),
                ));
            }
        };

        let stdout = stdout_reader.map(join_reader).unwrap_or_default();
        let stderr = stderr_reader.map(join_reader).unwrap_or_default();
        tracing::debug!(code = status.code(), "interpreter exited");
        Ok((stdout, stderr))
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Turn the child's raw output into an outcome. The envelope is the JSON
/// line after the last marker.
fn parse_envelope(stdout: &str, stderr: &str) -> ExecutionOutcome {
    let envelope = stdout
        .rfind(ENVELOPE_MARKER)
        .map(|idx| stdout[idx + ENVELOPE_MARKER.len()..].trim())
        .and_then(|json| serde_json::from_str::<Envelope>(json).ok());

    match envelope {
        Some(Envelope::Ok {
            stdout,
            result,
            restored: true,
        }) => ExecutionOutcome::Success {
            stdout: truncate_capture(stdout),
            result: result.map(truncate_capture),
        },
        Some(Envelope::Error {
            kind,
            message,
            trace,
            restored: true,
        }) => ExecutionOutcome::Failure(RuntimeFault {
            kind: if kind == "import_not_permitted" {
                FaultKind::ImportNotPermitted
            } else {
                FaultKind::Raised
            },
            message,
            trace: truncate_capture(trace),
        }),
        Some(_) => ExecutionOutcome::Failure(RuntimeFault::new(
            FaultKind::Interpreter,
            "harness could not restore its output stream",
        )),
        None => {
            let detail = stderr.trim();
            ExecutionOutcome::Failure(RuntimeFault {
                kind: FaultKind::Interpreter,
                message: "interpreter exited without a result".to_string(),
                trace: truncate_capture(if detail.is_empty() {
                    stdout.trim().to_string()
                } else {
                    detail.to_string()
                }),
            })
        }
    }
}

impl Executor for PythonSandbox {
    fn execute(&self, code: &str, env: &CapabilityEnvironment) -> ExecutionOutcome {
        let request = Self::build_request(code, env);
        match self.run(&request) {
            Ok((stdout, stderr)) => parse_envelope(&stdout, &stderr),
            Err(fault) => ExecutionOutcome::Failure(fault),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::AllowList;
    use std::fs;

    fn python() -> Option<PythonSandbox> {
        let found = Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        found.then(|| PythonSandbox::new("python3").with_timeout(Duration::from_secs(20)))
    }

    fn env() -> CapabilityEnvironment {
        CapabilityEnvironment::new(AllowList::default())
    }

    // --- envelope parsing ---

    #[test]
    fn test_parse_success_envelope() {
        let out = format!(
            "\n{}\n{}\n",
            ENVELOPE_MARKER,
            r#"{"status":"ok","stdout":"3 rows\n","result":"42","restored":true}"#
        );
        assert_eq!(
            parse_envelope(&out, ""),
            ExecutionOutcome::Success {
                stdout: "3 rows\n".into(),
                result: Some("42".into())
            }
        );
    }

    #[test]
    fn test_parse_error_envelope_keeps_trace() {
        let out = format!(
            "{}\n{}",
            ENVELOPE_MARKER,
            r#"{"status":"error","kind":"raised","message":"KeyError: 'x'","trace":"Traceback ...\nKeyError: 'x'\n","restored":true}"#
        );
        match parse_envelope(&out, "") {
            ExecutionOutcome::Failure(f) => {
                assert_eq!(f.kind, FaultKind::Raised);
                assert_eq!(f.message, "KeyError: 'x'");
                assert!(f.trace.starts_with("Traceback"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_import_not_permitted() {
        let out = format!(
            "{}\n{}",
            ENVELOPE_MARKER,
            r#"{"status":"error","kind":"import_not_permitted","message":"ImportNotPermitted: import not permitted: requests","trace":"","restored":true}"#
        );
        match parse_envelope(&out, "") {
            ExecutionOutcome::Failure(f) => assert_eq!(f.kind, FaultKind::ImportNotPermitted),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unrestored_stream_is_a_fault() {
        let out = format!(
            "{}\n{}",
            ENVELOPE_MARKER,
            r#"{"status":"ok","stdout":"","result":null,"restored":false}"#
        );
        assert!(!parse_envelope(&out, "").is_success());
    }

    #[test]
    fn test_parse_missing_envelope_uses_stderr() {
        match parse_envelope("", "SyntaxError in harness") {
            ExecutionOutcome::Failure(f) => {
                assert_eq!(f.kind, FaultKind::Interpreter);
                assert_eq!(f.trace, "SyntaxError in harness");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_request_carries_environment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "x\n").unwrap();
        let env = env().with_file(dir.path(), "a.csv");
        let request = PythonSandbox::build_request("x = 1\nx + 1", &env);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["trailing"], "x + 1");
        assert_eq!(json["file_variable"], "FILE_PATH");
        assert!(json["file_path"].as_str().unwrap().ends_with("a.csv"));
        assert!(json["modules"].as_array().unwrap().contains(&"pandas".into()));
        assert!(!json["builtins"].as_array().unwrap().contains(&"open".into()));
    }

    #[test]
    fn test_missing_interpreter_is_a_failure() {
        let sandbox = PythonSandbox::new("/nonexistent/python-interpreter");
        match sandbox.execute("print(1)", &env()) {
            ExecutionOutcome::Failure(f) => assert_eq!(f.kind, FaultKind::Interpreter),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    // --- live interpreter ---

    #[test]
    fn test_live_captures_stdout_and_result() {
        let Some(sandbox) = python() else { return };
        let outcome = sandbox.execute("x = 6\nprint('hello')\nx * 7", &env());
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                stdout: "hello\n".into(),
                result: Some("42".into())
            }
        );
    }

    #[test]
    fn test_live_fault_preserves_trace() {
        let Some(sandbox) = python() else { return };
        match sandbox.execute("print('before')\n{}['missing']", &env()) {
            ExecutionOutcome::Failure(f) => {
                assert_eq!(f.kind, FaultKind::Raised);
                assert!(f.message.starts_with("KeyError"));
                assert!(f.trace.contains("Traceback"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_live_import_outside_allow_list() {
        let Some(sandbox) = python() else { return };
        match sandbox.execute("import urllib.request", &env()) {
            ExecutionOutcome::Failure(f) => {
                assert_eq!(f.kind, FaultKind::ImportNotPermitted);
                assert!(f.message.contains("import not permitted: urllib.request"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_live_allowed_import_and_missing_builtin() {
        let Some(sandbox) = python() else { return };
        let outcome = sandbox.execute("import math\nprint(math.floor(2.5))", &env());
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                stdout: "2\n".into(),
                result: None
            }
        );
        // `open` is simply absent from the name space.
        match sandbox.execute("f = open", &env()) {
            ExecutionOutcome::Failure(f) => assert!(f.message.starts_with("NameError")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_live_trailing_error_is_swallowed() {
        let Some(sandbox) = python() else { return };
        // The last line runs once in the main step and once more as the
        // trailing expression; only the second run fails.
        let code = "items = [1]\nprint('ok')\nitems.pop()";
        assert_eq!(
            sandbox.execute(code, &env()),
            ExecutionOutcome::Success {
                stdout: "ok\n".into(),
                result: None
            }
        );
    }

    #[test]
    fn test_live_scope_does_not_persist() {
        let Some(sandbox) = python() else { return };
        assert!(sandbox.execute("leftover = 1", &env()).is_success());
        match sandbox.execute("print(leftover)", &env()) {
            ExecutionOutcome::Failure(f) => assert!(f.message.starts_with("NameError")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_live_reads_bound_file() {
        let Some(sandbox) = python() else { return };
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("n.txt"), "x").unwrap();
        let env = env().with_file(dir.path(), "n.txt");
        let outcome = sandbox.execute("FILE_PATH.endswith('n.txt')", &env);
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                stdout: String::new(),
                result: Some("True".into())
            }
        );
    }

    #[test]
    fn test_live_deadline_kills_runaway_code() {
        let Some(sandbox) = python() else { return };
        let sandbox = sandbox.with_timeout(Duration::from_secs(1));
        match sandbox.execute("while True:\n    pass", &env()) {
            ExecutionOutcome::Failure(f) => assert_eq!(f.kind, FaultKind::TimedOut),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
