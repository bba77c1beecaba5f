use fixloop::config::Config;
use fixloop::llm::ollama::OllamaClient;
use fixloop::llm::{CompletionProvider, CompletionRequest, LlmError, Message};
use fixloop::repair::transcript::{sections, Section};
use fixloop::sandbox::{CapabilityEnvironment, ExecutionOutcome, Executor, FaultKind, RuntimeFault};
use fixloop::{stage_upload, Analyst, AnalystError, LoopState, Termination};
use std::cell::RefCell;
use std::time::Duration;

#[test]
#[ignore] // Requires Ollama to be running
fn test_ollama_chat_simple() {
    let client = OllamaClient::new("http://localhost:11434");
    let messages = vec![Message::user("Say hello in one word.")];
    let request = CompletionRequest {
        model: "qwen2.5:7b",
        messages: &messages,
        timeout: Duration::from_secs(60),
    };
    let reply = client.complete(&request).unwrap();
    assert!(!reply.trim().is_empty());
}

#[test]
fn test_ollama_connection_error() {
    let client = OllamaClient::new("http://localhost:99999");
    let messages = vec![Message::user("Hello")];
    let request = CompletionRequest {
        model: "qwen2.5:7b",
        messages: &messages,
        timeout: Duration::from_secs(5),
    };
    assert!(client.complete(&request).is_err());
}

/// Replays canned replies in order.
struct Script(RefCell<Vec<String>>);

impl Script {
    fn new(replies: &[&str]) -> Self {
        Self(RefCell::new(
            replies.iter().rev().map(|s| s.to_string()).collect(),
        ))
    }
}

impl CompletionProvider for Script {
    fn complete(&self, _request: &CompletionRequest<'_>) -> Result<String, LlmError> {
        self.0
            .borrow_mut()
            .pop()
            .ok_or_else(|| LlmError::Malformed("script exhausted".into()))
    }
}

/// Fails until the code stops referencing the misspelled column.
struct ColumnCheck;

impl Executor for ColumnCheck {
    fn execute(&self, code: &str, _env: &CapabilityEnvironment) -> ExecutionOutcome {
        if code.contains("'Revenue'") {
            ExecutionOutcome::Failure(RuntimeFault {
                kind: FaultKind::Raised,
                message: "KeyError: 'Revenue'".into(),
                trace: "Traceback (most recent call last):\nKeyError: 'Revenue'".into(),
            })
        } else {
            ExecutionOutcome::Success {
                stdout: "1234.5\n".into(),
                result: None,
            }
        }
    }
}

fn uploads_with_csv() -> (tempfile::TempDir, Config) {
    let src = tempfile::tempdir().unwrap();
    let csv = src.path().join("sales.csv");
    std::fs::write(&csv, "region,revenue\nnorth,1000\nsouth,234.5\n").unwrap();

    let root = src.path().join("uploads");
    let staged = stage_upload(&root, &csv).unwrap();
    assert_eq!(staged.filename, "sales.csv");

    let mut config = Config::default();
    config.sandbox.upload_dir = root.display().to_string();
    (src, config)
}

#[test]
fn test_analyst_repairs_and_reports() {
    let (_dir, config) = uploads_with_csv();
    let provider = Script::new(&[
        "```python\ndf = pd.read_csv(FILE_PATH)\nprint(df['Revenue'].sum())\n```",
        "The column is lowercase.\n```python\ndf = pd.read_csv(FILE_PATH)\nprint(df['revenue'].sum())\n```\nTotal revenue is 1234.5.",
    ]);
    let analyst = Analyst::new(Box::new(provider), Box::new(ColumnCheck), config);

    let report = analyst
        .respond(&[Message::user("What is the total revenue?")], Some("sales.csv"))
        .unwrap();

    assert_eq!(report.state, LoopState::Succeeded);
    assert_eq!(report.termination, Termination::Succeeded);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.provider_calls, 1);

    let parsed = sections(&report.transcript);
    assert!(matches!(&parsed[0], Section::Narrative(t) if t.starts_with("The column is lowercase.")));
    assert!(matches!(parsed.last(), Some(Section::Results(body)) if body.contains("1234.5")));
}

#[test]
fn test_analyst_gives_up_at_ceiling() {
    let (_dir, mut config) = uploads_with_csv();
    config.session.max_iterations = 2;
    let bad = "```python\nprint(pd.read_csv(FILE_PATH)['Revenue'])\n```";
    let analyst = Analyst::new(
        Box::new(Script::new(&[bad, bad, bad])),
        Box::new(ColumnCheck),
        config,
    );

    let report = analyst
        .respond(&[Message::user("Show revenue")], Some("sales.csv"))
        .unwrap();
    assert_eq!(report.state, LoopState::Exhausted);
    assert_eq!(report.termination, Termination::CeilingReached);
    assert_eq!(report.attempts.len(), 2);
    assert!(matches!(sections(&report.transcript).last(), Some(Section::Error(body)) if body.contains("KeyError")));
}

#[test]
fn test_analyst_answers_without_missing_file() {
    let (_dir, config) = uploads_with_csv();
    let analyst = Analyst::new(
        Box::new(Script::new(&["I can't see that file. Please upload it first."])),
        Box::new(ColumnCheck),
        config,
    );
    let report = analyst
        .respond(&[Message::user("q")], Some("other.csv"))
        .unwrap();
    assert_eq!(report.termination, Termination::NoCode);
    assert!(report.transcript.starts_with("I can't see"));
}

#[test]
fn test_initial_provider_failure_reaches_caller() {
    let (_dir, config) = uploads_with_csv();
    let analyst = Analyst::new(Box::new(Script::new(&[])), Box::new(ColumnCheck), config);
    let err = analyst.respond(&[Message::user("q")], None).unwrap_err();
    assert!(matches!(err, AnalystError::Provider(LlmError::Malformed(_))));
}
