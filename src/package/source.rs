//! Structured package identifiers and install strategies

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Characters that would end a version, subpath or option value early.
const COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'=')
    .add(b'?');

/// Package ecosystem named by the identifier scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Cargo,
    Pypi,
    Gem,
    Golang,
    Github,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 6] = [
        Ecosystem::Npm,
        Ecosystem::Cargo,
        Ecosystem::Pypi,
        Ecosystem::Gem,
        Ecosystem::Golang,
        Ecosystem::Github,
    ];

    pub fn scheme(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Cargo => "cargo",
            Self::Pypi => "pypi",
            Self::Gem => "gem",
            Self::Golang => "golang",
            Self::Github => "github",
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.scheme() == scheme)
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Git pin for a repository-backed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum GitReference {
    Tag(String),
    Revision(String),
}

impl GitReference {
    /// Pick the reference kind for a version string: full commit hashes are
    /// revisions, everything else is a tag.
    pub fn infer(version: &str) -> Self {
        if is_commit_hash(version) {
            Self::Revision(version.to_string())
        } else {
            Self::Tag(version.to_string())
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Tag(v) | Self::Revision(v) => v,
        }
    }
}

pub(crate) fn is_commit_hash(version: &str) -> bool {
    version.len() == 40 && version.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decomposed registry identifier. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSource {
    pub source_id: String,
    pub ecosystem: Ecosystem,
    pub name: String,
    pub version: String,
    pub repository_url: Option<String>,
    pub git_reference: Option<GitReference>,
    pub options: BTreeMap<String, String>,
}

impl PackageSource {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn is_latest(&self) -> bool {
        self.version == super::parser::LATEST
    }

    /// Comma separated option values, e.g. `features=a,b`.
    pub fn option_list(&self, key: &str) -> Vec<String> {
        self.option(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Renders the canonical identifier form.
impl fmt::Display for PackageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pkg:{}/{}@{}",
            self.ecosystem,
            self.name,
            utf8_percent_encode(&self.version, COMPONENT)
        )?;

        let subpath = match self.ecosystem {
            Ecosystem::Golang => self.option("subpath"),
            _ => None,
        };
        if let Some(subpath) = subpath {
            write!(f, "#{}", utf8_percent_encode(subpath, COMPONENT))?;
        }

        let mut params: Vec<(String, String)> = self
            .options
            .iter()
            .filter(|(k, _)| subpath.is_none() || k.as_str() != "subpath")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if self.ecosystem != Ecosystem::Github {
            if let Some(url) = &self.repository_url {
                params.push(("repository_url".to_string(), url.clone()));
            }
            match &self.git_reference {
                Some(GitReference::Revision(_)) => params.push(("rev".into(), "true".into())),
                Some(GitReference::Tag(_)) => params.push(("tag".into(), "true".into())),
                None => {}
            }
        }
        params.sort();

        for (i, (key, value)) in params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, key, utf8_percent_encode(value, COMPONENT))?;
        }
        Ok(())
    }
}

/// Install strategy selected for one install attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationMethod {
    StandardPackage(PackageSource),
    SourceBuild {
        source: PackageSource,
        build_command: String,
    },
    BinaryDownload {
        source: PackageSource,
        url: String,
    },
    Unknown,
}

impl InstallationMethod {
    pub fn source(&self) -> Option<&PackageSource> {
        match self {
            Self::StandardPackage(source)
            | Self::SourceBuild { source, .. }
            | Self::BinaryDownload { source, .. } => Some(source),
            Self::Unknown => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::StandardPackage(_) => "package",
            Self::SourceBuild { .. } => "source-build",
            Self::BinaryDownload { .. } => "binary-download",
            Self::Unknown => "unknown",
        }
    }
}
