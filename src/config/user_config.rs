//! User configuration file parsing

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub settings: Settings,
    /// Statically configured servers, keyed by language
    #[serde(default)]
    pub servers: HashMap<String, ServerOverride>,
    /// Language -> registry package name
    #[serde(default)]
    pub language_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: Option<PathBuf>,
    pub request_timeout_secs: Option<u64>,
    pub start_policy: Option<StartPolicy>,
}

/// What to do when a server is started for a language that already has one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    #[default]
    Reject,
    Replace,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerOverride {
    pub enabled: Option<bool>,
    pub command: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub initialization_options: Option<serde_json::Value>,
    /// Answers for `workspace/configuration`
    pub settings: Option<serde_json::Value>,
}
