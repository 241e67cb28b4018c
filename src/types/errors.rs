use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LspError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{tool} is not installed. {hint}")]
    ToolNotInstalled { tool: String, hint: String },

    #[error("Installation of {package} failed: {reason}")]
    InstallationFailed { package: String, reason: String },

    #[error("Download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("LSP protocol error: {0}")]
    ProtocolError(String),

    #[error("LSP server crashed: {0}")]
    ServerCrashed(String),

    #[error("Request timeout after {0}s")]
    Timeout(u64),

    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("Unsupported package source: {0}")]
    UnsupportedSource(String),

    #[error("No language server running for {0}")]
    ServerNotRunning(String),

    #[error("A language server for {0} is already running")]
    ServerAlreadyRunning(String),

    #[error("An installation of {0} is already in progress")]
    InstallInProgress(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Command `{command}` failed: {status}")]
    CommandFailed { command: String, status: String },

    #[error("Invalid file path: {0}")]
    InvalidPath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LspError {
    pub fn tool_missing(tool: &str) -> Self {
        let hint = match tool {
            "npm" => "Install Node.js from https://nodejs.org to get npm.",
            "cargo" => "Install Rust via https://rustup.rs to get cargo.",
            "go" => "Install Go from https://go.dev/dl.",
            "python3" | "python" => "Install Python 3 with the venv module.",
            "gem" => "Install Ruby to get the gem command.",
            "git" => "Install git from https://git-scm.com.",
            _ => "Install it and make sure it is on PATH.",
        };
        Self::ToolNotInstalled {
            tool: tool.to_string(),
            hint: hint.to_string(),
        }
    }

    pub fn install_failed(package: &str, reason: impl Into<String>) -> Self {
        Self::InstallationFailed {
            package: package.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Download { .. } | Self::Timeout(_))
    }
}

/// Failures collected while stopping several servers.
#[derive(Error, Debug)]
#[error("{} language server(s) failed to stop", failures.len())]
pub struct ShutdownErrors {
    pub failures: Vec<(String, LspError)>,
}

pub type Result<T> = std::result::Result<T, LspError>;
