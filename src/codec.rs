//! Conversion between [`Saga`] and the persisted [`SagaRecord`]
//!
//! Timestamps are stored as epoch milliseconds. Index buckets are derived from
//! the timestamp they partition, never from the time of the write.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::schema::{ATTR_COMMIT_STAMP, ATTR_TIMEOUT_AT, BUCKET_FLOOR_ID, RESERVED_ATTRIBUTES};
use crate::{
    BackendError, CommandId, NewCommand, Saga, SagaId, SagaIndex, SagaStoreError, SagaVersion,
    TimeBucket,
};

/// Latest instant with a six-digit bucket label (9999-12-31T23:59:59.999Z)
pub const MAX_TIMESTAMP_MILLIS: i64 = 253_402_300_799_999;

/// Persisted saga document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaRecord {
    /// Saga id, the table's partition key
    pub id: SagaId,
    /// Version written by the last save
    pub version: SagaVersion,
    /// Epoch millis of the last save
    pub commit_stamp: i64,
    /// Bucket of `commit_stamp`
    pub commit_stamp_bucket: TimeBucket,
    /// Epoch millis of the scheduled timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<i64>,
    /// Bucket of `timeout_at`, present exactly when it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at_bucket: Option<TimeBucket>,
    /// Commands queued for dispatch, in the order they were queued
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub commands: IndexMap<CommandId, Value>,
    /// Business state
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

impl SagaRecord {
    /// Partition and sort key of this record in `index`, `None` if it is not indexed there
    pub fn index_entry(&self, index: SagaIndex) -> Option<(TimeBucket, i64)> {
        match index {
            SagaIndex::CommitStamp => Some((self.commit_stamp_bucket, self.commit_stamp)),
            SagaIndex::TimeoutAt => Some((self.timeout_at_bucket?, self.timeout_at?)),
        }
    }

    /// Whether any command still waits for dispatch
    pub fn has_pending_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Render as a JSON document with the attribute names of the table schema
    pub fn to_document(&self) -> Result<Map<String, Value>, BackendError> {
        match serde_json::to_value(self).map_err(BackendError::codec)? {
            Value::Object(map) => Ok(map),
            other => Err(BackendError::codec(format!(
                "saga record serialized to {other} instead of an object"
            ))),
        }
    }

    /// Parse a document produced by [`to_document`](Self::to_document)
    pub fn from_document(document: Map<String, Value>) -> Result<Self, BackendError> {
        serde_json::from_value(Value::Object(document)).map_err(BackendError::codec)
    }
}

/// Check a saga and its new commands before any I/O is attempted
pub fn validate(saga: &Saga, commands: &[NewCommand]) -> Result<(), SagaStoreError> {
    validate_saga_id(&saga.id)?;
    if let Some(at) = saga.commit_stamp {
        to_millis(at, ATTR_COMMIT_STAMP)?;
    }
    if let Some(at) = saga.timeout_at {
        to_millis(at, ATTR_TIMEOUT_AT)?;
    }
    if let Some(key) = saga
        .state
        .keys()
        .find(|k| RESERVED_ATTRIBUTES.contains(&k.as_str()))
    {
        return Err(SagaStoreError::validation(format!(
            "saga {} uses reserved attribute {key:?} in its state",
            saga.id
        )));
    }

    let mut seen = HashSet::with_capacity(commands.len());
    for cmd in commands {
        validate_id(cmd.id.as_str(), "command id")?;
        if is_empty_payload(&cmd.payload) {
            return Err(SagaStoreError::validation(format!(
                "command {} has an empty payload",
                cmd.id
            )));
        }
        if !seen.insert(&cmd.id) {
            return Err(SagaStoreError::validation(format!(
                "command {} is queued twice in the same save",
                cmd.id
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_id(id: &str, what: &str) -> Result<(), SagaStoreError> {
    if id.is_empty() {
        return Err(SagaStoreError::validation(format!(
            "{what} must be a non-empty string"
        )));
    }
    Ok(())
}

pub(crate) fn validate_saga_id(id: &SagaId) -> Result<(), SagaStoreError> {
    validate_id(id.as_str(), "saga id")?;
    if id.as_str() == BUCKET_FLOOR_ID {
        return Err(SagaStoreError::validation(format!(
            "saga id {BUCKET_FLOOR_ID} is reserved"
        )));
    }
    Ok(())
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Build the record written for `saga`.
///
/// `pending` are the commands already waiting on the stored record; `commands`
/// are merged into them, replacing any payload queued under the same id.
pub fn encode(
    saga: &Saga,
    commit_stamp: DateTime<Utc>,
    version: SagaVersion,
    mut pending: IndexMap<CommandId, Value>,
    commands: Vec<NewCommand>,
) -> Result<SagaRecord, SagaStoreError> {
    let commit_stamp = to_millis(commit_stamp, ATTR_COMMIT_STAMP)?;
    let timeout_at = saga
        .timeout_at
        .map(|at| to_millis(at, ATTR_TIMEOUT_AT))
        .transpose()?;

    for cmd in commands {
        pending.insert(cmd.id, cmd.payload);
    }

    Ok(SagaRecord {
        id: saga.id.clone(),
        version,
        commit_stamp,
        commit_stamp_bucket: bucket_of(commit_stamp)?,
        timeout_at,
        timeout_at_bucket: timeout_at.map(bucket_of).transpose()?,
        commands: pending,
        state: saga.state.clone(),
    })
}

/// Turn a stored record back into a saga, dropping storage-internal attributes
pub fn decode(record: SagaRecord) -> Result<Saga, BackendError> {
    Ok(Saga {
        commit_stamp: Some(from_millis(record.commit_stamp, ATTR_COMMIT_STAMP)?),
        timeout_at: record
            .timeout_at
            .map(|m| from_millis(m, ATTR_TIMEOUT_AT))
            .transpose()?,
        id: record.id,
        version: Some(record.version),
        state: record.state,
    })
}

pub(crate) fn to_millis(at: DateTime<Utc>, attribute: &str) -> Result<i64, SagaStoreError> {
    let millis = at.timestamp_millis();
    if (0..=MAX_TIMESTAMP_MILLIS).contains(&millis) {
        Ok(millis)
    } else {
        Err(SagaStoreError::validation(format!(
            "{attribute} {at} is outside the storable range"
        )))
    }
}

pub(crate) fn from_millis(millis: i64, attribute: &str) -> Result<DateTime<Utc>, BackendError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| BackendError::codec(format!("{attribute} out of range: {millis}")))
}

fn bucket_of(millis: i64) -> Result<TimeBucket, SagaStoreError> {
    TimeBucket::containing_millis(millis)
        .ok_or_else(|| SagaStoreError::validation(format!("no time bucket for {millis}")))
}
