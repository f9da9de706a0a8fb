//! Conversation message model
//!
//! A `Message` is one conversational turn. Messages are treated as values:
//! strategies never mutate one in place, they build a new list instead.

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

/// Free-form message metadata. Only the reserved keys below mean anything
/// to the engine; everything else is passed through untouched.
pub type Metadata = HashMap<String, Value>;

/// Metadata key holding the message kind (`"summary"` for summaries)
pub const META_TYPE: &str = "type";
/// Metadata value marking a summary message
pub const SUMMARY_TYPE: &str = "summary";
/// Metadata key holding the id of the last message folded into a summary
pub const META_SUMMARY_UPTO: &str = "summary_upto";
/// Metadata key holding how many messages a summary replaced
pub const META_ORIGINAL_COUNT: &str = "original_message_count";
/// Metadata key holding the timestamp of the last folded message
pub const META_TIMESTAMP_CREATED: &str = "timestamp_created";

/// Offset-less ISO-8601 layout, read as UTC
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Current time truncated to microseconds, the finest precision every
/// backend keeps.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Parse an ISO-8601 timestamp. RFC 3339 values keep their offset;
/// values without one (`2024-05-01T10:00:00.123456`) are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(timestamp) => Ok(timestamp.with_timezone(&Utc)),
        Err(rfc_err) => NaiveDateTime::parse_from_str(raw, NAIVE_TIMESTAMP_FORMAT)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| rfc_err),
    }
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}

/// Role of a message sender
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Application-defined role (tool, function, ...)
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(name) => name,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => Role::Other(other.to_string()),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::from(s.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a session's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default = "timestamp_now", deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Unique within a session; blank ids are regenerated on load
    #[serde(default)]
    pub message_id: String,
}

impl Message {
    /// Create a new message stamped with the current time and a fresh id
    pub fn new(role: impl Into<Role>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: timestamp_now(),
            metadata: Metadata::new(),
            session_id: None,
            message_id: generate_message_id(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Assign a fresh id if the current one is blank. Returns true when an
    /// id was generated.
    pub fn ensure_message_id(&mut self) -> bool {
        if self.message_id.trim().is_empty() {
            self.message_id = generate_message_id();
            true
        } else {
            false
        }
    }

    /// True for system messages tagged `type = "summary"`
    pub fn is_summary(&self) -> bool {
        self.role == Role::System && self.has_summary_type()
    }

    pub(crate) fn has_summary_type(&self) -> bool {
        self.metadata.get(META_TYPE).and_then(Value::as_str) == Some(SUMMARY_TYPE)
    }

    /// Id of the last original message folded into this summary
    pub fn summary_anchor(&self) -> Option<&str> {
        if !self.is_summary() {
            return None;
        }
        self.metadata
            .get(META_SUMMARY_UPTO)
            .and_then(Value::as_str)
            .filter(|anchor| !anchor.is_empty())
    }

    /// Project to the `{role, content}` shape handed to a language model
    pub fn to_context(&self) -> ContextMessage {
        ContextMessage {
            role: self.role.clone(),
            content: self.content.clone(),
        }
    }
}

pub(crate) fn generate_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Minimal message shape for model consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: impl Into<Role>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Read-only statistics over a session's current history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_messages: usize,
    pub role_distribution: BTreeMap<String, usize>,
    pub summary_count: usize,
    pub first_message_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
}

impl SessionStats {
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut role_distribution = BTreeMap::new();
        let mut summary_count = 0;

        for msg in messages {
            *role_distribution
                .entry(msg.role.as_str().to_string())
                .or_insert(0) += 1;
            if msg.has_summary_type() {
                summary_count += 1;
            }
        }

        Self {
            total_messages: messages.len(),
            role_distribution,
            summary_count,
            first_message_time: messages.first().map(|m| m.timestamp),
            last_message_time: messages.last().map(|m| m.timestamp),
        }
    }
}
