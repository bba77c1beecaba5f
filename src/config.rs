use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub session: SessionConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_initial_timeout")]
    pub initial_timeout_secs: u64,
    #[serde(default = "default_correction_timeout")]
    pub correction_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    pub max_iterations: usize,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SandboxConfig {
    pub interpreter: String,
    pub upload_dir: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub extra_modules: Vec<String>,
}

fn default_initial_timeout() -> u64 {
    60
}

fn default_correction_timeout() -> u64 {
    120
}

fn default_sandbox_timeout() -> u64 {
    60
}

fn default_preview_chars() -> usize {
    2_000
}

fn default_languages() -> Vec<String> {
    vec!["python".to_string(), "py".to_string(), "python3".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: "ollama".to_string(),
                model: "qwen2.5:7b".to_string(),
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                initial_timeout_secs: default_initial_timeout(),
                correction_timeout_secs: default_correction_timeout(),
            },
            session: SessionConfig {
                max_iterations: 5,
                languages: default_languages(),
                preview_chars: default_preview_chars(),
            },
            sandbox: SandboxConfig {
                interpreter: "python3".to_string(),
                upload_dir: "~/.fixloop/uploads".to_string(),
                timeout_secs: default_sandbox_timeout(),
                extra_modules: vec![],
            },
        }
    }
}

impl LlmConfig {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_secs)
    }

    pub fn correction_timeout(&self) -> Duration {
        Duration::from_secs(self.correction_timeout_secs)
    }

    /// A caller-supplied API base and key switch this invocation to the
    /// OpenAI-compatible binding.
    pub fn with_custom_api(mut self, api_base: Option<String>, api_key: Option<String>) -> Self {
        if let (Some(base), Some(key)) = (api_base, api_key) {
            self.provider = "openai_compat".to_string();
            self.base_url = base;
            self.api_key = Some(key);
        }
        self
    }
}

impl SandboxConfig {
    /// Upload directory with a leading `~` expanded.
    pub fn upload_root(&self) -> PathBuf {
        expand_home(&self.upload_dir)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// `OLLAMA_HOST` points the Ollama binding at another daemon.
    fn apply_env(mut self) -> Self {
        if self.llm.provider != "openai_compat" {
            if let Ok(host) = std::env::var("OLLAMA_HOST") {
                if !host.trim().is_empty() {
                    self.llm.base_url = host;
                }
            }
        }
        self
    }

    /// Load config from ~/.fixloop/config.toml, falling back to defaults.
    pub fn load() -> Self {
        let config_path = if let Some(home) = dirs::home_dir() {
            home.join(".fixloop").join("config.toml")
        } else {
            return Self::default().apply_env();
        };

        let config = if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!(path = %config_path.display(), error = %e, "failed to parse config, using defaults");
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %config_path.display(), error = %e, "failed to read config, using defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_env()
    }
}
