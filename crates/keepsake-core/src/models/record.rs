//! Record model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Domain payload of a record: an opaque JSON object.
pub type RecordFields = Map<String, Value>;

/// A unique identifier for a record, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// A synchronized record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique, immutable identifier
    pub id: RecordId,
    /// Domain payload
    pub fields: RecordFields,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last write timestamp, strictly increasing per record
    pub updated_at: DateTime<Utc>,
    /// Last confirmed remote acknowledgement
    pub synced_at: Option<DateTime<Utc>>,
    /// Tombstone timestamp; present when logically deleted
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Whether the record carries a tombstone
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the latest local write has been acknowledged by the remote
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some_and(|at| at >= self.updated_at)
    }

    /// Short human-readable preview, preferring a `name` or `title` field
    #[must_use]
    pub fn preview(&self, max_len: usize) -> String {
        let text = ["name", "title"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map_or_else(
                || Value::Object(self.fields.clone()).to_string(),
                str::to_string,
            );
        text.lines().next().unwrap_or("").chars().take(max_len).collect()
    }
}

/// A record version as reported by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RecordId,
    #[serde(default)]
    pub fields: RecordFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Validate that a JSON value is usable as a record payload.
pub fn fields_from_value(value: Value) -> Result<RecordFields> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!(
            "record payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Shallow-merge a partial payload into existing fields.
///
/// `null` values remove the key.
pub fn merge_fields(base: &mut RecordFields, partial: RecordFields) {
    for (key, value) in partial {
        if value.is_null() {
            base.remove(&key);
        } else {
            base.insert(key, value);
        }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
