//! Session rows and owner identity.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Cleaned,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Cleaned => "cleaned",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the requesting user's identity.
///
/// The email is the identity used for ownership checks and donor matching.
/// Any other profile fields are carried along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub profile: serde_json::Map<String, serde_json::Value>,
}

impl Owner {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            profile: serde_json::Map::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.profile.insert(key.into(), value);
        self
    }

    /// The identity, if present and non-blank.
    pub fn identity(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }

    /// Case-insensitive identity match. An owner without identity matches nothing.
    pub fn matches(&self, identity: &str) -> bool {
        let identity = identity.trim();
        match self.identity() {
            Some(own) if !identity.is_empty() => own.to_lowercase() == identity.to_lowercase(),
            _ => false,
        }
    }

    pub fn same_owner(&self, other: &Owner) -> bool {
        other.identity().is_some_and(|identity| self.matches(identity))
    }
}

/// One row of the session table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub container_id: String,
    #[serde(default)]
    pub container_ip: Option<String>,
    pub container_port: u16,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub owner: Owner,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds().max(0)
    }
}

/// Host directory layout for session data.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
}

impl SessionPaths {
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn input_dir(&self, session_id: &str) -> PathBuf {
        self.input_root.join(session_id)
    }

    pub fn output_dir(&self, session_id: &str) -> PathBuf {
        self.output_root.join(session_id)
    }
}
