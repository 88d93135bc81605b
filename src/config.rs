//! Store configuration

use serde::Deserialize;
use std::time::Duration;

use crate::SagaStoreError;

/// Default saga table name
pub const DEFAULT_TABLE_NAME: &str = "sagas";

/// Configuration for [`SagaStore`](crate::SagaStore)
#[derive(Clone, Debug, Deserialize)]
pub struct SagaStoreConfig {
    /// Sleep between table status polls during bootstrap (milliseconds)
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    /// Optional cap on the month buckets scanned by timeout and staleness
    /// queries, counting back from the bucket of the query bound. Unset scans
    /// down to the oldest populated bucket.
    #[serde(default)]
    pub bucket_lookback_months: Option<u32>,
    /// Provisioned throughput used when the table has to be created
    #[serde(default)]
    pub throughput: ThroughputConfig,
}

fn default_poll_interval_millis() -> u64 {
    1000
}

impl Default for SagaStoreConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            bucket_lookback_months: None,
            throughput: ThroughputConfig::default(),
        }
    }
}

impl SagaStoreConfig {
    /// [`poll_interval_millis`](Self::poll_interval_millis) as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<(), SagaStoreError> {
        if self.poll_interval_millis == 0 {
            return Err(SagaStoreError::validation(
                "poll_interval_millis must be greater than zero",
            ));
        }
        if self.bucket_lookback_months == Some(0) {
            return Err(SagaStoreError::validation(
                "bucket_lookback_months must be greater than zero",
            ));
        }
        self.throughput.validate()
    }
}

/// Read/write capacity units for a table or index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Throughput {
    /// Read capacity units, must be positive
    pub read_capacity_units: i64,
    /// Write capacity units, must be positive
    pub write_capacity_units: i64,
}

impl Default for Throughput {
    fn default() -> Self {
        Self {
            read_capacity_units: 5,
            write_capacity_units: 5,
        }
    }
}

/// Throughput for the saga table and each of its indexes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    /// Base table
    pub table: Throughput,
    /// Index on the commit stamp
    pub commit_stamp_index: Throughput,
    /// Index on the timeout
    pub timeout_at_index: Throughput,
}

impl ThroughputConfig {
    fn validate(&self) -> Result<(), SagaStoreError> {
        for (name, t) in [
            ("table", self.table),
            ("commit_stamp_index", self.commit_stamp_index),
            ("timeout_at_index", self.timeout_at_index),
        ] {
            if t.read_capacity_units <= 0 || t.write_capacity_units <= 0 {
                return Err(SagaStoreError::validation(format!(
                    "throughput.{name} capacity units must be positive"
                )));
            }
        }
        Ok(())
    }
}
