//! Launch descriptor for a language server executable

use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageServerBinary {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl LanguageServerBinary {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf().clean(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_is_normalized() {
        let binary = LanguageServerBinary::new("/opt/servers/./pyright/../pyright/bin/pyright")
            .with_args(["--stdio"]);
        assert_eq!(binary.path, PathBuf::from("/opt/servers/pyright/bin/pyright"));
        assert_eq!(binary.args, vec!["--stdio".to_string()]);
    }
}
