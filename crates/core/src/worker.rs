//! Worker endpoint descriptors and parsing of the worker list.
//!
//! The worker list is configured as a single delimited string and parsed
//! once at startup. Malformed entries are rejected here rather than at
//! dispatch time.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Separator between entries in the worker list.
const ENTRY_SEPARATOR: char = ',';

/// Separator between kind and URL inside one entry.
const KIND_SEPARATOR: char = '=';

/// Where a worker backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Backend on the scheduler's own host.
    Local,
    /// Backend on another host. Preferred over local.
    Remote,
}

impl WorkerKind {
    /// Selection priority; lower values are picked first.
    pub fn priority(self) -> u8 {
        match self {
            WorkerKind::Remote => 0,
            WorkerKind::Local => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Local => "local",
            WorkerKind::Remote => "remote",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(WorkerKind::Local),
            "remote" => Ok(WorkerKind::Remote),
            other => Err(CoreError::Validation(format!(
                "Unknown worker kind \"{other}\" (expected \"local\" or \"remote\")"
            ))),
        }
    }
}

/// A validated worker endpoint from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Stable identifier: the normalized endpoint URL. It survives
    /// reordering of the worker list across restarts.
    pub id: String,
    pub kind: WorkerKind,
    /// Base HTTP URL without a trailing slash.
    pub url: String,
}

impl WorkerDescriptor {
    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }
}

/// Parse a worker list such as
/// `"local=http://127.0.0.1:8188,remote=http://gpu-1:8188"`.
///
/// Rules:
/// - At least one entry.
/// - Each entry is `kind=url`, kind is `local` or `remote`.
/// - URLs must be `http://` or `https://` with a non-empty host.
/// - The same URL may not be listed twice.
pub fn parse_worker_endpoints(raw: &str) -> Result<Vec<WorkerDescriptor>, CoreError> {
    let mut workers = Vec::new();
    let mut seen_urls = HashSet::new();

    for entry in raw
        .split(ENTRY_SEPARATOR)
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        let (kind, url) = entry.split_once(KIND_SEPARATOR).ok_or_else(|| {
            CoreError::Validation(format!(
                "Worker entry \"{entry}\" must have the form kind=url"
            ))
        })?;

        let kind: WorkerKind = kind.parse()?;
        let url = validate_endpoint_url(url)?;

        if !seen_urls.insert(url.clone()) {
            return Err(CoreError::Validation(format!(
                "Duplicate worker endpoint: \"{url}\""
            )));
        }

        workers.push(WorkerDescriptor {
            id: url.clone(),
            kind,
            url,
        });
    }

    if workers.is_empty() {
        return Err(CoreError::Validation(
            "At least one worker endpoint must be configured".to_string(),
        ));
    }

    Ok(workers)
}

/// Validate an endpoint URL and normalise it: trailing slashes removed,
/// scheme and authority lowercased.
fn validate_endpoint_url(url: &str) -> Result<String, CoreError> {
    let url = url.trim().trim_end_matches('/');
    let (scheme, rest) = url
        .split_once("://")
        .map(|(scheme, rest)| (scheme.to_ascii_lowercase(), rest))
        .filter(|(scheme, _)| scheme == "http" || scheme == "https")
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Worker URL \"{url}\" must start with http:// or https://"
            ))
        })?;

    let host = rest.split(['/', ':']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(CoreError::Validation(format!(
            "Worker URL \"{url}\" has no host"
        )));
    }
    if rest.contains(char::is_whitespace) {
        return Err(CoreError::Validation(format!(
            "Worker URL \"{url}\" must not contain whitespace"
        )));
    }

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, Some(path)),
        None => (rest, None),
    };
    let mut normalized = format!("{scheme}://{}", authority.to_ascii_lowercase());
    if let Some(path) = path {
        normalized.push('/');
        normalized.push_str(path);
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
