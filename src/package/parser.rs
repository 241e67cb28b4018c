//! Package identifier parsing
//!
//! Identifiers look like `pkg:<scheme>/<name>@<version>[#subpath][?key=value&...]`.
//! Anything that does not fit the grammar is rejected rather than guessed at.

use super::platform::Platform;
use super::source::{Ecosystem, GitReference, InstallationMethod, PackageSource};
use crate::config::RegistrySource;
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const LATEST: &str = "latest";

const SCHEME_PREFIX: &str = "pkg:";

/// Parse an identifier into a [`PackageSource`].
pub fn parse_package_id(id: &str) -> Option<PackageSource> {
    let rest = id.trim().strip_prefix(SCHEME_PREFIX)?;
    let (scheme, path) = rest.split_once('/')?;
    let ecosystem = Ecosystem::from_scheme(scheme)?;

    // Go identifiers carry the build subpath as a fragment
    let (path, fragment) = match ecosystem {
        Ecosystem::Golang => split_fragment(path),
        _ => (path.to_string(), None),
    };

    let (body, query) = match path.split_once('?') {
        Some((body, query)) => (body, query),
        None => (path.as_str(), ""),
    };

    let (raw_name, raw_version) = split_name_version(body);
    let name = decode(raw_name)?;
    let version = decode(&raw_version)?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    if ecosystem == Ecosystem::Github && !is_owner_repo(&name) {
        return None;
    }

    let mut options = BTreeMap::new();
    let mut repository_url = None;
    let mut explicit_ref = None;

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = decode(value)?;
        match (key, value.as_str()) {
            ("repository_url", _) => repository_url = Some(value),
            ("rev", "true") | ("tag", "true") => {
                if explicit_ref.is_some() {
                    // rev and tag together cannot describe a single pin
                    return None;
                }
                explicit_ref = Some(if key == "rev" {
                    GitReference::Revision(version.clone())
                } else {
                    GitReference::Tag(version.clone())
                });
            }
            _ => {
                options.insert(key.to_string(), value);
            }
        }
    }

    if let Some(subpath) = fragment {
        options.insert("subpath".to_string(), decode(&subpath)?);
    }

    if ecosystem == Ecosystem::Github && repository_url.is_none() {
        repository_url = Some(format!("https://github.com/{}", name));
    }

    let git_reference = match (explicit_ref, &repository_url) {
        (Some(reference), _) => Some(reference),
        (None, Some(_)) => Some(GitReference::infer(&version)),
        (None, None) => None,
    };

    Some(PackageSource {
        source_id: id.to_string(),
        ecosystem,
        name,
        version,
        repository_url,
        git_reference,
        options,
    })
}

/// Select the install strategy for a registry entry's source descriptor.
pub fn resolve_method(source: &RegistrySource, platform: &Platform) -> InstallationMethod {
    let Some(package) = parse_package_id(&source.id) else {
        warn!("Unrecognized package identifier: {}", source.id);
        return InstallationMethod::Unknown;
    };

    if package.ecosystem != Ecosystem::Github {
        return InstallationMethod::StandardPackage(package);
    }

    match (&source.asset, &source.build) {
        (Some(asset), _) => {
            let filename = match platform.expand(&asset.file, &package.version) {
                Ok(filename) => filename,
                Err(e) => {
                    warn!("Cannot expand asset template {}: {}", asset.file, e);
                    return InstallationMethod::Unknown;
                }
            };
            let Some(repository) = package.repository_url.as_deref() else {
                return InstallationMethod::Unknown;
            };
            let url = release_asset_url(repository, &package.version, &filename);
            debug!("Resolved {} to release asset {}", package.name, url);
            InstallationMethod::BinaryDownload {
                source: package,
                url,
            }
        }
        (None, Some(build)) => InstallationMethod::SourceBuild {
            build_command: build.command.clone(),
            source: package,
        },
        (None, None) => {
            warn!("GitHub source {} has neither an asset nor a build", source.id);
            InstallationMethod::Unknown
        }
    }
}

fn release_asset_url(repository: &str, tag: &str, filename: &str) -> String {
    let repository = repository.trim_end_matches('/');
    if tag == LATEST {
        format!("{}/releases/latest/download/{}", repository, filename)
    } else {
        format!("{}/releases/download/{}/{}", repository, tag, filename)
    }
}

/// Remove a `#fragment`, keeping any query that follows it.
fn split_fragment(path: &str) -> (String, Option<String>) {
    let Some((head, tail)) = path.split_once('#') else {
        return (path.to_string(), None);
    };
    let (fragment, trailing_query) = match tail.split_once('?') {
        Some((fragment, query)) => (fragment, Some(query)),
        None => (tail, None),
    };
    let rebuilt = match trailing_query {
        Some(query) if head.contains('?') => format!("{}&{}", head, query),
        Some(query) => format!("{}?{}", head, query),
        None => head.to_string(),
    };
    let fragment = (!fragment.is_empty()).then(|| fragment.to_string());
    (rebuilt, fragment)
}

/// Split on the version separator. A leading `@` belongs to a scoped name.
fn split_name_version(body: &str) -> (&str, String) {
    let search_from = usize::from(body.starts_with('@'));
    match body[search_from..].find('@') {
        Some(i) => {
            let at = search_from + i;
            let version = &body[at + 1..];
            let version = if version.is_empty() { LATEST } else { version };
            (&body[..at], version.to_string())
        }
        None => (body, LATEST.to_string()),
    }
}

fn is_owner_repo(name: &str) -> bool {
    matches!(name.split_once('/'), Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/'))
}

fn decode(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}
