//! The bounded execute, fail, revise loop.
//!
//! ```text
//! Drafting -> Guarding -> Executing -> Succeeded
//!                 |            |
//!                 +------------+-> AwaitingRevision -> Drafting ...
//!                                        |
//!                                        +-> Exhausted
//! ```
//!
//! The loop never returns an error: every failure ends up in the transcript.

pub mod prompt;
pub mod transcript;

use crate::extract::CodeBlockExtractor;
use crate::llm::{CompletionProvider, CompletionRequest, Message};
use crate::sandbox::{CapabilityEnvironment, ExecutionOutcome, Executor, RuntimeFault};
use crate::security::policy::{PolicyViolation, StaticPolicyGuard};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CEILING: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Drafting,
    Guarding,
    Executing,
    AwaitingRevision,
    Succeeded,
    Exhausted,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Drafting => "drafting",
            LoopState::Guarding => "guarding",
            LoopState::Executing => "executing",
            LoopState::AwaitingRevision => "awaiting-revision",
            LoopState::Succeeded => "succeeded",
            LoopState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The reply contained no code; it is returned unchanged.
    NoCode,
    Succeeded,
    CeilingReached,
    /// A correction round trip failed; no further calls were made.
    ProviderFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Rejected by the policy guard; the sandbox never ran.
    Denied(PolicyViolation),
    Executed(ExecutionOutcome),
}

impl AttemptOutcome {
    /// Text fed back to the model and shown in the transcript. `None` on success.
    pub fn failure_detail(&self) -> Option<String> {
        match self {
            AttemptOutcome::Denied(v) => Some(denial_detail(v)),
            AttemptOutcome::Executed(ExecutionOutcome::Failure(fault)) => Some(fault_detail(fault)),
            AttemptOutcome::Executed(ExecutionOutcome::Success { .. }) => None,
        }
    }
}

fn denial_detail(violation: &PolicyViolation) -> String {
    format!("{}\nThe code was not executed.", violation)
}

fn fault_detail(fault: &RuntimeFault) -> String {
    if fault.trace.trim().is_empty() {
        fault.message.clone()
    } else {
        format!("{}\n\n{}", fault.message, fault.trace.trim_end())
    }
}

/// One pass of the loop. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub iteration: usize,
    pub code: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone)]
pub struct RepairReport {
    pub transcript: String,
    pub state: LoopState,
    pub termination: Termination,
    pub attempts: Vec<Attempt>,
    pub provider_calls: usize,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    /// Maximum number of executed attempts. Zero is treated as one.
    pub ceiling: usize,
    pub correction_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            model: "qwen2.5:7b".to_string(),
            ceiling: DEFAULT_CEILING,
            correction_timeout: Duration::from_secs(120),
        }
    }
}

/// Per-request state. The conversation is an owned copy of the caller's
/// history and is dropped with the session.
struct RepairSession {
    id: uuid::Uuid,
    file: Option<PathBuf>,
    conversation: Vec<Message>,
    iteration: usize,
    ceiling: usize,
    state: LoopState,
    attempts: Vec<Attempt>,
    provider_calls: usize,
}

impl RepairSession {
    fn new(history: &[Message], env: &CapabilityEnvironment, ceiling: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            file: env.file_path().map(PathBuf::from),
            conversation: history.to_vec(),
            iteration: 0,
            ceiling: ceiling.max(1),
            state: LoopState::Drafting,
            attempts: Vec::new(),
            provider_calls: 0,
        }
    }

    fn transition(&mut self, next: LoopState) {
        tracing::trace!(session = %self.id, from = %self.state, to = %next, "state change");
        self.state = next;
    }

    fn finish(mut self, transcript: String, termination: Termination) -> RepairReport {
        let terminal = match termination {
            Termination::NoCode | Termination::Succeeded => LoopState::Succeeded,
            Termination::CeilingReached | Termination::ProviderFailed(_) => LoopState::Exhausted,
        };
        self.transition(terminal);
        tracing::info!(
            session = %self.id,
            state = %self.state,
            attempts = self.attempts.len(),
            provider_calls = self.provider_calls,
            "repair session finished"
        );
        RepairReport {
            transcript,
            state: self.state,
            termination,
            attempts: self.attempts,
            provider_calls: self.provider_calls,
        }
    }
}

pub struct RepairLoop<'a> {
    provider: &'a dyn CompletionProvider,
    executor: &'a dyn Executor,
    extractor: CodeBlockExtractor,
    guard: StaticPolicyGuard,
    settings: LoopSettings,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        provider: &'a dyn CompletionProvider,
        executor: &'a dyn Executor,
        extractor: CodeBlockExtractor,
        settings: LoopSettings,
    ) -> Self {
        Self {
            provider,
            executor,
            extractor,
            guard: StaticPolicyGuard::new(),
            settings,
        }
    }

    /// Drive one session from the model's first `reply` to a final transcript.
    ///
    /// `history` is the conversation that produced `reply`; it is copied, and
    /// each failed attempt appends the assistant's reply followed by a
    /// user-role correction request before the provider is asked again.
    pub fn run(
        &self,
        history: &[Message],
        reply: &str,
        env: &CapabilityEnvironment,
    ) -> RepairReport {
        let mut session = RepairSession::new(history, env, self.settings.ceiling);
        let mut draft = reply.to_string();
        tracing::info!(
            session = %session.id,
            ceiling = session.ceiling,
            file = ?session.file,
            "repair session started"
        );

        loop {
            session.transition(LoopState::Drafting);
            let Some(code) = self.extractor.extract_unit(&draft) else {
                return session.finish(draft, Termination::NoCode);
            };
            session.iteration += 1;

            session.transition(LoopState::Guarding);
            let outcome = match self.guard.check(&code) {
                Err(violation) => {
                    tracing::warn!(
                        session = %session.id,
                        iteration = session.iteration,
                        category = %violation.category,
                        snippet = %violation.snippet,
                        "policy violation"
                    );
                    AttemptOutcome::Denied(violation)
                }
                Ok(()) => {
                    session.transition(LoopState::Executing);
                    AttemptOutcome::Executed(self.executor.execute(&code, env))
                }
            };

            session.attempts.push(Attempt {
                iteration: session.iteration,
                code: code.clone(),
                outcome: outcome.clone(),
            });

            let failure = match outcome {
                AttemptOutcome::Executed(ExecutionOutcome::Success { stdout, result }) => {
                    tracing::info!(
                        session = %session.id,
                        iteration = session.iteration,
                        success = true,
                        "attempt finished"
                    );
                    let text = transcript::with_results(&draft, &stdout, result.as_deref());
                    return session.finish(text, Termination::Succeeded);
                }
                AttemptOutcome::Executed(ExecutionOutcome::Failure(fault)) => fault_detail(&fault),
                AttemptOutcome::Denied(violation) => denial_detail(&violation),
            };
            tracing::info!(
                session = %session.id,
                iteration = session.iteration,
                success = false,
                "attempt finished"
            );

            if session.iteration >= session.ceiling {
                let note = format!(
                    "_Stopped after {} attempt(s) without a successful run._",
                    session.iteration
                );
                let text = transcript::with_error(&draft, &failure, Some(&note));
                return session.finish(text, Termination::CeilingReached);
            }

            session.transition(LoopState::AwaitingRevision);
            session.conversation.push(Message::assistant(&draft));
            session.conversation.push(Message::user(&prompt::correction_request(
                &code,
                &failure,
                session.iteration,
                session.ceiling,
            )));

            let request = CompletionRequest {
                model: &self.settings.model,
                messages: &session.conversation,
                timeout: self.settings.correction_timeout,
            };
            session.provider_calls += 1;
            match self.provider.complete(&request) {
                Ok(next) => draft = next,
                Err(e) => {
                    tracing::error!(session = %session.id, error = %e, "correction request failed");
                    let note = format!("_Could not request a corrected version: {}_", e);
                    let text = transcript::with_error(&draft, &failure, Some(&note));
                    return session.finish(text, Termination::ProviderFailed(e.to_string()));
                }
            }
        }
    }
}
