use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ActilogError;

/// Write-time event identifier. Strictly increasing, never reused; the
/// primary ordering key for every read path.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Largest id strictly below this one, saturating at zero.
    pub fn predecessor(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventId").field(&self.0).finish()
    }
}

impl FromStr for EventId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(EventId)
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Severity tags, totally ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Alert => "alert",
            Level::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ActilogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "notice" => Ok(Level::Notice),
            "warning" | "warn" => Ok(Level::Warning),
            "error" => Ok(Level::Error),
            "critical" => Ok(Level::Critical),
            "alert" => Ok(Level::Alert),
            "emergency" => Ok(Level::Emergency),
            other => Err(ActilogError::InvalidRequest(format!(
                "unknown level '{other}'"
            ))),
        }
    }
}

/// Who or what caused an event to be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initiator {
    User { name: String },
    Anonymous,
    System,
    Cli { name: String },
    Unknown,
}

impl Default for Initiator {
    fn default() -> Self {
        Initiator::Unknown
    }
}

/// Auxiliary attributes joined onto a returned event.
pub type ContextMap = BTreeMap<String, String>;

/// One logged occurrence. Immutable once written; the query engine only
/// ever reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub level: Level,
    pub message: String,
    pub initiator: Initiator,
    /// Grouping key: consecutive events sharing this value (descending by
    /// id, within the permission-filtered stream) collapse into one group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occasion_id: Option<String>,
}

impl Event {
    pub fn occasion(&self) -> Option<&str> {
        self.occasion_id.as_deref()
    }
}
