//! Saga table schema
//!
//! ```text
//! Table: sagas (configurable)
//!
//! Primary Key:
//!   - id (String, Partition Key)
//!
//! Attributes:
//!   - version: String - optimistic concurrency token
//!   - commitStamp: Number - epoch millis of the last save
//!   - commitStampBucket: String - "YYYYMM" of commitStamp
//!   - timeoutAt: Number (optional) - epoch millis of the scheduled timeout
//!   - timeoutAtBucket: String (optional) - "YYYYMM" of timeoutAt
//!   - commands: Map (optional) - command id -> payload, pending dispatch
//!   - any other attribute: saga business state
//!
//! Indexes (projection ALL):
//!   - commitStamp_index: commitStampBucket (HASH), commitStamp (RANGE)
//!   - timeoutAt_index:   timeoutAtBucket (HASH),   timeoutAt (RANGE)
//!
//! Bucket floor item (backends that cannot list index partitions):
//!   - id: "__bucketFloor"
//!   - commitStampBucketFloor, timeoutAtBucketFloor: String - oldest bucket written
//! ```

use crate::config::{Throughput, ThroughputConfig};

/// Partition key
pub const ATTR_ID: &str = "id";
/// Optimistic concurrency token
pub const ATTR_VERSION: &str = "version";
/// Epoch millis of the last save
pub const ATTR_COMMIT_STAMP: &str = "commitStamp";
/// `YYYYMM` of the commit stamp
pub const ATTR_COMMIT_STAMP_BUCKET: &str = "commitStampBucket";
/// Epoch millis of the scheduled timeout
pub const ATTR_TIMEOUT_AT: &str = "timeoutAt";
/// `YYYYMM` of the timeout
pub const ATTR_TIMEOUT_AT_BUCKET: &str = "timeoutAtBucket";
/// Pending commands, keyed by command id
pub const ATTR_COMMANDS: &str = "commands";

/// Id of the item that records the oldest bucket written per index.
/// Sagas may not use it.
pub const BUCKET_FLOOR_ID: &str = "__bucketFloor";

/// Attribute names business state may not use
pub const RESERVED_ATTRIBUTES: [&str; 7] = [
    ATTR_ID,
    ATTR_VERSION,
    ATTR_COMMIT_STAMP,
    ATTR_COMMIT_STAMP_BUCKET,
    ATTR_TIMEOUT_AT,
    ATTR_TIMEOUT_AT_BUCKET,
    ATTR_COMMANDS,
];

/// The two time-bucketed secondary indexes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SagaIndex {
    /// Stale-saga scans
    CommitStamp,
    /// Timed-out-saga scans
    TimeoutAt,
}

impl SagaIndex {
    /// Both indexes
    pub const ALL: [SagaIndex; 2] = [SagaIndex::CommitStamp, SagaIndex::TimeoutAt];

    /// Index name in the table definition
    pub fn name(&self) -> &'static str {
        match self {
            Self::CommitStamp => "commitStamp_index",
            Self::TimeoutAt => "timeoutAt_index",
        }
    }

    /// Partition key attribute
    pub fn bucket_attribute(&self) -> &'static str {
        match self {
            Self::CommitStamp => ATTR_COMMIT_STAMP_BUCKET,
            Self::TimeoutAt => ATTR_TIMEOUT_AT_BUCKET,
        }
    }

    /// Sort key attribute
    pub fn sort_attribute(&self) -> &'static str {
        match self {
            Self::CommitStamp => ATTR_COMMIT_STAMP,
            Self::TimeoutAt => ATTR_TIMEOUT_AT,
        }
    }

    /// Attribute of the [`BUCKET_FLOOR_ID`] item holding this index's oldest bucket
    pub fn floor_attribute(&self) -> &'static str {
        match self {
            Self::CommitStamp => "commitStampBucketFloor",
            Self::TimeoutAt => "timeoutAtBucketFloor",
        }
    }
}

/// Definition of one secondary index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    /// Which index
    pub index: SagaIndex,
    /// Its provisioned throughput
    pub throughput: Throughput,
}

/// Everything a backend needs to create the saga table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name
    pub name: Box<str>,
    /// Base table throughput
    pub throughput: Throughput,
    /// Secondary indexes to create with the table
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Spec for `name` with both indexes
    pub fn new(name: impl Into<Box<str>>, throughput: &ThroughputConfig) -> Self {
        Self {
            name: name.into(),
            throughput: throughput.table,
            indexes: vec![
                IndexSpec {
                    index: SagaIndex::CommitStamp,
                    throughput: throughput.commit_stamp_index,
                },
                IndexSpec {
                    index: SagaIndex::TimeoutAt,
                    throughput: throughput.timeout_at_index,
                },
            ],
        }
    }
}

/// Table lifecycle status as reported by a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableStatus {
    /// Being created, not usable yet
    Creating,
    /// Ready for reads and writes
    Active,
    /// Usable while its settings change
    Updating,
    /// Being deleted
    Deleting,
    /// Any status the store does not know
    Other(Box<str>),
}

impl TableStatus {
    /// Whether the table accepts reads and writes
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for TableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "CREATING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Updating => write!(f, "UPDATING"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Other(status) => write!(f, "{}", status),
        }
    }
}
