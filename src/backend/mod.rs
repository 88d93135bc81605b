//! Storage backend trait
//!
//! A backend is a document store bound to one saga table. It offers conditional
//! writes, a partial update for command acknowledgement and range scans over the
//! two time-bucketed indexes. Everything saga-specific lives in the store; a
//! backend only has to honour the conditions it is given.

use async_trait::async_trait;

use crate::{
    BackendError, CommandId, SagaId, SagaIndex, SagaRecord, SagaVersion, TableSpec, TableStatus,
    TimeBucket,
};

mod memory;
pub use memory::InMemoryBackend;

#[cfg(feature = "lmdb")]
mod lmdb;
#[cfg(feature = "lmdb")]
pub use lmdb::{LmdbBackend, LmdbConfig};

#[cfg(feature = "dynamodb")]
mod dynamodb;
#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoDbBackend, DynamoDbConfig};

/// Condition attached to a full-record write
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutCondition {
    /// Only succeed if no record with the same id exists
    NotExists,
    /// Only succeed if the stored record carries exactly this version
    VersionEquals(SagaVersion),
}

impl PutCondition {
    /// Evaluate against the currently stored record
    pub fn holds_for(&self, current: Option<&SagaRecord>) -> bool {
        match (self, current) {
            (Self::NotExists, None) => true,
            (Self::NotExists, Some(_)) => false,
            (Self::VersionEquals(expected), Some(record)) => record.version == *expected,
            (Self::VersionEquals(_), None) => false,
        }
    }
}

/// Document store holding the saga table
#[async_trait]
pub trait SagaBackend: Send + Sync + 'static {
    /// Name of the table this backend reads and writes
    fn table_name(&self) -> &str;

    /// Current table status, `None` if the table does not exist
    async fn describe_table(&self) -> Result<Option<TableStatus>, BackendError>;

    /// Create the table and its indexes, returning the initial status
    async fn create_table(&self, spec: &TableSpec) -> Result<TableStatus, BackendError>;

    /// Write a whole record. A failed condition is reported as
    /// [`BackendError::ConditionFailed`].
    async fn put(&self, record: SagaRecord, condition: PutCondition) -> Result<(), BackendError>;

    /// Point read by id
    async fn get(&self, id: &SagaId) -> Result<Option<SagaRecord>, BackendError>;

    /// Unconditional delete; deleting a missing record succeeds
    async fn delete(&self, id: &SagaId) -> Result<(), BackendError>;

    /// Remove one entry from a record's `commands` without touching its version.
    /// Reports [`BackendError::ConditionFailed`] if the saga or the command is gone.
    async fn remove_command(
        &self,
        saga_id: &SagaId,
        command_id: &CommandId,
    ) -> Result<(), BackendError>;

    /// Records in `bucket` of `index` whose sort key is `<= upper_bound_millis`
    async fn query_index(
        &self,
        index: SagaIndex,
        bucket: TimeBucket,
        upper_bound_millis: i64,
    ) -> Result<Vec<SagaRecord>, BackendError>;

    /// Oldest bucket of `index` that has ever held a record, `None` if none has.
    ///
    /// Scans stop here, so the answer may be older than the oldest live record
    /// but never newer.
    async fn earliest_bucket(&self, index: SagaIndex) -> Result<Option<TimeBucket>, BackendError>;

    /// Records with at least one pending command
    async fn scan_pending_commands(&self) -> Result<Vec<SagaRecord>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str) -> SagaRecord {
        SagaRecord {
            id: SagaId::new("A"),
            version: SagaVersion::new(version),
            commit_stamp: 0,
            commit_stamp_bucket: TimeBucket::new(1970, 1).unwrap(),
            timeout_at: None,
            timeout_at_bucket: None,
            commands: Default::default(),
            state: Default::default(),
        }
    }

    #[test]
    fn test_put_conditions() {
        let stored = record("v1");
        assert!(PutCondition::NotExists.holds_for(None));
        assert!(!PutCondition::NotExists.holds_for(Some(&stored)));
        assert!(PutCondition::VersionEquals(SagaVersion::new("v1")).holds_for(Some(&stored)));
        assert!(!PutCondition::VersionEquals(SagaVersion::new("v0")).holds_for(Some(&stored)));
        assert!(!PutCondition::VersionEquals(SagaVersion::new("v1")).holds_for(None));
    }
}
