//! Outbox entry model and the versioned mutation payload envelope.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordFields, RecordId};
use crate::error::{Error, Result};

/// Current version of [`MutationPayload`].
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Kind of local mutation waiting to be replayed remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOperation {
    Create,
    Update,
    Delete,
}

impl OutboxOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OutboxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!(
                "unknown outbox operation '{other}'"
            ))),
        }
    }
}

/// Snapshot of everything needed to replay one mutation remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationPayload {
    /// Envelope version
    pub schema: u32,
    /// Target record
    pub record_id: RecordId,
    /// Full field snapshot (create/update)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<RecordFields>,
    /// Record timestamp at the time of the mutation
    pub updated_at: DateTime<Utc>,
    /// Tombstone timestamp (delete)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MutationPayload {
    /// Build the payload for `operation` from the freshly written record row.
    #[must_use]
    pub fn for_record(operation: OutboxOperation, record: &Record) -> Self {
        let fields = match operation {
            OutboxOperation::Create | OutboxOperation::Update => Some(record.fields.clone()),
            OutboxOperation::Delete => None,
        };
        Self {
            schema: PAYLOAD_SCHEMA_VERSION,
            record_id: record.id,
            fields,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
        }
    }

    /// Check required/optional fields for the given operation.
    pub fn validate(&self, operation: OutboxOperation, record_id: &RecordId) -> Result<()> {
        if self.schema != PAYLOAD_SCHEMA_VERSION {
            return Err(Error::InvalidInput(format!(
                "unsupported mutation payload schema {} (expected {PAYLOAD_SCHEMA_VERSION})",
                self.schema
            )));
        }
        if &self.record_id != record_id {
            return Err(Error::InvalidInput(format!(
                "payload targets {} but entry targets {record_id}",
                self.record_id
            )));
        }
        match operation {
            OutboxOperation::Create | OutboxOperation::Update if self.fields.is_none() => {
                Err(Error::InvalidInput(format!(
                    "{operation} payload for {record_id} is missing fields"
                )))
            }
            OutboxOperation::Delete if self.deleted_at.is_none() => Err(Error::InvalidInput(
                format!("delete payload for {record_id} is missing deleted_at"),
            )),
            _ => Ok(()),
        }
    }
}

/// A pending mutation in the durable outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Queue-local id, increasing in creation order
    pub entry_id: i64,
    pub operation: OutboxOperation,
    pub record_id: RecordId,
    pub payload: MutationPayload,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Validate the payload envelope against this entry.
    pub fn validate(&self) -> Result<()> {
        self.payload.validate(self.operation, &self.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fields_from_value;
    use crate::util::from_millis;
    use serde_json::json;

    fn record() -> Record {
        Record {
            id: RecordId::new(),
            fields: fields_from_value(json!({"name": "Ada"})).unwrap(),
            created_at: from_millis(1),
            updated_at: from_millis(2),
            synced_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn operation_parses_round_trip() {
        for op in [
            OutboxOperation::Create,
            OutboxOperation::Update,
            OutboxOperation::Delete,
        ] {
            assert_eq!(op.as_str().parse::<OutboxOperation>().unwrap(), op);
        }
        assert!("upsert".parse::<OutboxOperation>().is_err());
    }

    #[test]
    fn payload_for_delete_omits_fields() {
        let mut rec = record();
        rec.deleted_at = Some(from_millis(3));
        let payload = MutationPayload::for_record(OutboxOperation::Delete, &rec);
        assert!(payload.fields.is_none());
        assert!(payload.validate(OutboxOperation::Delete, &rec.id).is_ok());

        let raw = serde_json::to_value(&payload).unwrap();
        assert!(raw.get("fields").is_none());
    }

    #[test]
    fn payload_validation_rejects_missing_fields() {
        let rec = record();
        let mut payload = MutationPayload::for_record(OutboxOperation::Update, &rec);
        payload.fields = None;
        assert!(payload.validate(OutboxOperation::Update, &rec.id).is_err());
    }

    #[test]
    fn payload_validation_rejects_foreign_schema_and_id() {
        let rec = record();
        let mut payload = MutationPayload::for_record(OutboxOperation::Create, &rec);
        assert!(payload
            .validate(OutboxOperation::Create, &RecordId::new())
            .is_err());

        payload.schema = 99;
        let error = payload.validate(OutboxOperation::Create, &rec.id).unwrap_err();
        assert!(error.to_string().contains("schema 99"));
    }
}
