use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Ping,
    Query,
}

impl CheckKind {
    /// Name of the registry set holding addresses checked with this kind.
    pub fn registry_set(self) -> &'static str {
        match self {
            CheckKind::Ping => "serverping",
            CheckKind::Query => "serverquery",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Ping => "ping",
            CheckKind::Query => "query",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Failure,
}

/// Latest known outcome of one check against one address.
///
/// The payload is whatever the dispatcher produced and is served verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub address: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fatal: bool,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn success(address: &str, kind: CheckKind, payload: serde_json::Value) -> Self {
        Self {
            address: address.to_string(),
            kind,
            status: CheckStatus::Success,
            payload,
            error: None,
            fatal: false,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(address: &str, kind: CheckKind, message: String, fatal: bool) -> Self {
        Self {
            address: address.to_string(),
            kind,
            status: CheckStatus::Failure,
            payload: serde_json::Value::Null,
            error: Some(message),
            fatal,
            timestamp: Utc::now(),
        }
    }
}

/// Number of checks a refresh cycle handed to the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub ping: usize,
    pub query: usize,
}

impl CycleReport {
    pub fn total(&self) -> usize {
        self.ping + self.query
    }
}
