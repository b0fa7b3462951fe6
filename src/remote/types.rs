use regex::Regex;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::environment::{Allocations, Limits, Mount};

/// The full configuration document returned by
/// `GET /api/remote/servers/{uuid}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfiguration {
    pub settings: ServerSettings,
    pub process_configuration: ProcessConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub uuid: Uuid,
    pub suspended: bool,
    pub invocation: String,
    pub build: Limits,
    pub container: ContainerDetails,
    pub allocations: Allocations,
    /// Environment variables as the Panel sends them; values are stringified
    /// before they reach the container.
    pub environment: HashMap<String, serde_json::Value>,
    pub mounts: Vec<Mount>,
    pub crash_detection_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            suspended: false,
            invocation: String::new(),
            build: Limits::default(),
            container: ContainerDetails::default(),
            allocations: Allocations::default(),
            environment: HashMap::new(),
            mounts: Vec::new(),
            crash_detection_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDetails {
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfiguration {
    pub startup: StartupConfiguration,
    pub stop: StopConfiguration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfiguration {
    /// Patterns that mark the server as fully started, checked in order.
    pub done: Vec<LineMatcher>,
    pub strip_ansi: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfiguration {
    #[serde(rename = "type")]
    pub kind: StopType,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    /// Deliver a termination signal to the process.
    #[default]
    Signal,
    /// Write a command to the process console.
    Command,
}

/// A console line matcher with a canonical string form. `regex:` prefixes
/// compile as regular expressions, strings containing `*` or `?` match as an
/// anchored glob, anything else is a literal prefix.
#[derive(Debug, Clone)]
pub enum LineMatcher {
    Prefix(String),
    Glob { raw: String, pattern: Regex },
    Regex { raw: String, pattern: Regex },
}

impl LineMatcher {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(expr) = raw.strip_prefix("regex:") {
            let pattern = Regex::new(expr).map_err(|e| format!("invalid regex pattern: {e}"))?;
            return Ok(LineMatcher::Regex {
                raw: raw.to_string(),
                pattern,
            });
        }

        if raw.contains('*') || raw.contains('?') {
            let pattern = Regex::new(&glob_to_regex(raw))
                .map_err(|e| format!("invalid glob pattern: {e}"))?;
            return Ok(LineMatcher::Glob {
                raw: raw.to_string(),
                pattern,
            });
        }

        Ok(LineMatcher::Prefix(raw.to_string()))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            LineMatcher::Prefix(p) => line.starts_with(p.as_str()),
            LineMatcher::Glob { pattern, .. } => pattern.is_match(line),
            LineMatcher::Regex { pattern, .. } => pattern.is_match(line),
        }
    }
}

impl fmt::Display for LineMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineMatcher::Prefix(raw) => write!(f, "{raw}"),
            LineMatcher::Glob { raw, .. } | LineMatcher::Regex { raw, .. } => write!(f, "{raw}"),
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

impl Serialize for LineMatcher {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LineMatcher {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        LineMatcher::parse(&raw).map_err(de::Error::custom)
    }
}
