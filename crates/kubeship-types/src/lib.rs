//! Shared types for kubeship
//!
//! This crate contains data structures used across multiple kubeship crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Log Files
// ============================================================================

/// Pod identity encoded in a container log file name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
}

impl PodIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Parse `<pod>_<namespace>_<container>.log`
    ///
    /// Names with fewer than three `_`-separated segments, or with an empty
    /// pod or namespace segment, carry no identity.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let mut segments = file_name.split('_');
        let name = segments.next()?;
        let namespace = segments.next()?;
        segments.next()?;

        if name.is_empty() || namespace.is_empty() {
            return None;
        }

        Some(Self::new(name, namespace))
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A file under the monitored container log directory
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogFilePath(PathBuf);

impl LogFilePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Final path component, if it is valid UTF-8
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    /// Pod that produced this file, derived from the file name only
    pub fn identity(&self) -> Option<PodIdentity> {
        self.file_name().and_then(PodIdentity::from_file_name)
    }

    pub fn has_log_suffix(&self) -> bool {
        self.0.extension().is_some_and(|ext| ext == "log")
    }
}

impl From<PathBuf> for LogFilePath {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl AsRef<Path> for LogFilePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for LogFilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

// ============================================================================
// Kubernetes Types
// ============================================================================

/// Pod metadata needed to decide whether and how to ship a pod's logs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl PodRecord {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Value of the opt-in marker, looked up in annotations or labels
    pub fn opt_in_value(&self, source: OptInSource, key: &str) -> Option<&str> {
        let map = match source {
            OptInSource::Annotation => &self.annotations,
            OptInSource::Label => &self.labels,
        };
        map.get(key).map(String::as_str)
    }

    /// GELF host field: the node the pod is scheduled on
    pub fn host(&self) -> &str {
        self.node_name.as_deref().unwrap_or_default()
    }
}

/// Where a pod declares its logging opt-in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptInSource {
    #[default]
    Annotation,
    Label,
}

impl OptInSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Annotation => "annotation",
            Self::Label => "label",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown opt-in source '{0}', expected 'annotation' or 'label'")]
pub struct UnknownOptInSource(String);

impl FromStr for OptInSource {
    type Err = UnknownOptInSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "annotation" | "annotations" => Ok(Self::Annotation),
            "label" | "labels" => Ok(Self::Label),
            _ => Err(UnknownOptInSource(s.to_string())),
        }
    }
}

impl fmt::Display for OptInSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule deciding whether a pod's logs are shipped
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptInPolicy {
    pub source: OptInSource,
    pub key: String,
    pub value: String,
}

impl Default for OptInPolicy {
    fn default() -> Self {
        Self {
            source: OptInSource::Annotation,
            key: "logging".to_string(),
            value: "enabled".to_string(),
        }
    }
}

impl OptInPolicy {
    /// Only an exact match on the enabled value opts a pod in
    pub fn allows(&self, pod: &PodRecord) -> bool {
        pod.opt_in_value(self.source, &self.key) == Some(self.value.as_str())
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// One line of a container runtime JSON log file
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ContainerLogLine {
    /// Raw text emitted by the container, trailing newline included
    pub log: String,

    /// When the runtime captured the line
    pub time: DateTime<Utc>,
}

/// GELF 1.1 message as accepted by Graylog
///
/// Fields are declared in lexical order so the serialized form is stable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GelfMessage {
    pub host: String,
    pub short_message: String,
    pub timestamp: String,
    pub version: &'static str,
}

impl GelfMessage {
    pub const VERSION: &'static str = "1.1";

    pub fn new(host: impl Into<String>, short_message: impl Into<String>, time: &DateTime<Utc>) -> Self {
        Self {
            host: host.into(),
            short_message: short_message.into(),
            timestamp: gelf_timestamp(time),
            version: Self::VERSION,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Seconds since the epoch, rounded half away from zero to four decimals
pub fn gelf_timestamp(time: &DateTime<Utc>) -> String {
    let nanos = i128::from(time.timestamp()) * 1_000_000_000
        + i128::from(time.timestamp_subsec_nanos());
    let ticks = (nanos.abs() + 50_000) / 100_000;
    let sign = if nanos < 0 && ticks != 0 { "-" } else { "" };
    format!("{}{}.{:04}", sign, ticks / 10_000, ticks % 10_000)
}

// ============================================================================
// Session Types
// ============================================================================

/// Lifecycle of a tail session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Starting,
    Resolving,
    Tailing,
    Failed,
    Restarting,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Resolving => "resolving",
            Self::Tailing => "tailing",
            Self::Failed => "failed",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
