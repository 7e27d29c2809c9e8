use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const STORED_MESSAGE: &str = "Data stored successfully!";
pub const INTEGRITY_ERROR_MESSAGE: &str = "IntegrityError occurred while storing data";
pub const PING_REPLY_PREFIX: &str = "Pong! You sent: ";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One item of the upstream post listing. Fields other than `title` and `body`
/// are ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Post {
    pub title: String,
    pub body: String,
}

impl Post {
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { title: title.into(), body: body.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertSummary {
    #[must_use]
    pub fn total(self) -> usize {
        self.inserted + self.updated
    }
}

/// Result of one fetch-and-store run, resolved to exactly one variant so the
/// caller maps it to a response without inspecting errors.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Success(UpsertSummary),
    ConstraintViolation { detail: String },
    OtherError { detail: String },
}

impl UpsertOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<Result<UpsertSummary, SyncError>> for UpsertOutcome {
    fn from(result: Result<UpsertSummary, SyncError>) -> Self {
        match result {
            Ok(summary) => Self::Success(summary),
            Err(SyncError::ConstraintViolation(detail)) => Self::ConstraintViolation { detail },
            Err(err) => Self::OtherError { detail: err.to_string() },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Ping,
    Echo,
}

impl Channel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Echo => "echo",
        }
    }

    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Ping => "/ws/ping",
            Self::Echo => "/ws/echo",
        }
    }

    /// Build the single outbound frame for one inbound text frame.
    #[must_use]
    pub fn reply(self, inbound: &str) -> String {
        match self {
            Self::Ping => format!("{PING_REPLY_PREFIX}{inbound}"),
            Self::Echo => inbound.to_string(),
        }
    }
}

/// Decode the upstream listing body into posts.
///
/// # Errors
/// Returns [`SyncError::Decode`] when the body is not a JSON array of objects
/// carrying string `title` and `body` fields.
pub fn decode_posts(raw: &str) -> Result<Vec<Post>, SyncError> {
    serde_json::from_str(raw).map_err(|err| SyncError::Decode(err.to_string()))
}
