use crate::config::Config;
use crate::extract::CodeBlockExtractor;
use crate::llm::{create_provider, CompletionProvider, CompletionRequest, LlmError, Message, Role};
use crate::repair::{prompt, LoopSettings, RepairLoop, RepairReport};
use crate::sandbox::{AllowList, CapabilityEnvironment, Executor, PythonSandbox};
use crate::security::path::{upload_target, PathError};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalystError {
    #[error(transparent)]
    Provider(#[from] LlmError),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("'{0}' is not a regular file")]
    NotAFile(String),
}

/// A file copied into the upload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// One chat turn end to end: system prompt, file note, initial call, repair loop.
pub struct Analyst {
    provider: Box<dyn CompletionProvider>,
    executor: Box<dyn Executor>,
    config: Config,
}

impl Analyst {
    pub fn new(
        provider: Box<dyn CompletionProvider>,
        executor: Box<dyn Executor>,
        config: Config,
    ) -> Self {
        Self {
            provider,
            executor,
            config,
        }
    }

    pub fn from_config(config: Config) -> Self {
        let provider = create_provider(&config.llm);
        let sandbox = PythonSandbox::new(&config.sandbox.interpreter)
            .with_timeout(config.sandbox.timeout())
            .with_working_dir(config.sandbox.upload_root());
        Self::new(provider, Box::new(sandbox), config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A refused file reference is logged and dropped; the turn then runs
    /// without `FILE_PATH`.
    fn environment(&self, filename: Option<&str>) -> CapabilityEnvironment {
        let allow = AllowList::default().with_extra_modules(&self.config.sandbox.extra_modules);
        let env = CapabilityEnvironment::new(allow);
        match filename {
            Some(name) => env.with_file(&self.config.sandbox.upload_root(), name),
            None => env,
        }
    }

    /// Answer the last user turn in `history`. `history` itself is not
    /// modified; the returned transcript is what the caller should record as
    /// the assistant's reply.
    pub fn respond(
        &self,
        history: &[Message],
        filename: Option<&str>,
    ) -> Result<RepairReport, AnalystError> {
        let env = self.environment(filename);

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(&prompt::system_prompt(&env)));
        messages.extend(history.iter().filter(|m| m.role != Role::System).cloned());

        if let (Some(name), Some(path)) = (filename, env.file_path()) {
            let preview = text_preview(path, self.config.session.preview_chars);
            let note = prompt::file_note(display_name(name), preview.as_deref());
            match messages.iter_mut().rev().find(|m| m.role == Role::User) {
                Some(last) => last.content.push_str(&note),
                None => messages.push(Message::user(note.trim_start())),
            }
        }

        let request = CompletionRequest {
            model: &self.config.llm.model,
            messages: &messages,
            timeout: self.config.llm.initial_timeout(),
        };
        let reply = self.provider.complete(&request).map_err(|e| {
            tracing::error!(error = %e, "initial completion failed");
            e
        })?;

        let repair = RepairLoop::new(
            self.provider.as_ref(),
            self.executor.as_ref(),
            CodeBlockExtractor::new(&self.config.session.languages),
            LoopSettings {
                model: self.config.llm.model.clone(),
                ceiling: self.config.session.max_iterations,
                correction_timeout: self.config.llm.correction_timeout(),
            },
        );
        Ok(repair.run(&messages, &reply, &env))
    }
}

fn display_name(reference: &str) -> &str {
    Path::new(reference)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(reference)
}

/// The first `max_chars` characters of a text file. Binary files and read
/// failures give `None`.
fn text_preview(path: &Path, max_chars: usize) -> Option<String> {
    if max_chars == 0 {
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    let mut buf = Vec::new();
    // Four bytes per char is the UTF-8 worst case.
    file.take((max_chars as u64).saturating_mul(4))
        .read_to_end(&mut buf)
        .ok()?;
    if buf.contains(&0) {
        return None;
    }
    let text = match std::str::from_utf8(&buf) {
        Ok(s) => s,
        // A multi-byte character cut at the read boundary is fine.
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&buf[..e.valid_up_to()]).ok()?,
        Err(_) => return None,
    };
    let preview: String = text.chars().take(max_chars).collect();
    if preview.trim().is_empty() {
        None
    } else {
        Some(preview)
    }
}

/// Copy `source` into `root` under its bare file name, creating `root` if
/// needed. An existing file with the same name is replaced.
pub fn stage_upload(root: &Path, source: &Path) -> Result<StagedFile, StageError> {
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source| StageError::Io { path, source }
    };

    let meta = std::fs::metadata(source).map_err(io_err(source))?;
    if !meta.is_file() {
        return Err(StageError::NotAFile(source.display().to_string()));
    }
    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(PathError::Empty)?
        .to_string();

    std::fs::create_dir_all(root).map_err(io_err(root))?;
    let target = upload_target(root, &filename)?;
    let size = std::fs::copy(source, &target).map_err(io_err(&target))?;
    tracing::info!(file = %filename, size, target = %target.display(), "file staged");

    Ok(StagedFile {
        filename,
        path: target,
        size,
    })
}
