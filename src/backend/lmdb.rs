//! LMDB backend built on `heed`
//!
//! One environment holds three named databases: the records keyed by saga id,
//! and one per secondary index. Index keys are `"{bucket}/{millis:020}/{id}"`, so
//! a prefix scan over `"{bucket}/"` walks a bucket in timestamp order. A record
//! and its index entries are always written in the same write transaction.

use async_trait::async_trait;
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::RwLock;

use super::{PutCondition, SagaBackend};
use crate::config::DEFAULT_TABLE_NAME;
use crate::{
    BackendError, CommandId, SagaId, SagaIndex, SagaRecord, TableSpec, TableStatus, TimeBucket,
};

/// Width of the zero-padded millisecond segment of an index key
const MILLIS_WIDTH: usize = 20;
/// Length of the `"YYYYMM/"` prefix of an index key
const BUCKET_PREFIX_LEN: usize = 7;

/// Configuration for [`LmdbBackend`]
#[derive(Clone, Debug, Deserialize)]
pub struct LmdbConfig {
    /// Environment directory, created if missing
    pub path: PathBuf,
    /// Maximum size of the memory map
    #[serde(default = "default_map_size_bytes")]
    pub map_size_bytes: usize,
    /// Prefix of the named databases inside the environment
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

fn default_map_size_bytes() -> usize {
    1024 * 1024 * 1024
}

fn default_table_name() -> String {
    DEFAULT_TABLE_NAME.to_string()
}

impl LmdbConfig {
    /// Defaults for an environment at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map_size_bytes: default_map_size_bytes(),
            table_name: default_table_name(),
        }
    }
}

impl From<heed::Error> for BackendError {
    fn from(error: heed::Error) -> Self {
        BackendError::storage(error)
    }
}

#[derive(Clone, Copy)]
struct Tables {
    records: Database<Str, SerdeJson<SagaRecord>>,
    commit_stamp_index: Database<Str, Str>,
    timeout_at_index: Database<Str, Str>,
}

impl Tables {
    fn index_db(&self, index: SagaIndex) -> Database<Str, Str> {
        match index {
            SagaIndex::CommitStamp => self.commit_stamp_index,
            SagaIndex::TimeoutAt => self.timeout_at_index,
        }
    }

    fn index(&self, wtxn: &mut RwTxn<'_>, record: &SagaRecord) -> Result<(), BackendError> {
        for index in SagaIndex::ALL {
            if let Some((bucket, millis)) = record.index_entry(index) {
                self.index_db(index).put(
                    wtxn,
                    &index_key(bucket, millis, &record.id),
                    record.id.as_str(),
                )?;
            }
        }
        Ok(())
    }

    fn unindex(&self, wtxn: &mut RwTxn<'_>, record: &SagaRecord) -> Result<(), BackendError> {
        for index in SagaIndex::ALL {
            if let Some((bucket, millis)) = record.index_entry(index) {
                self.index_db(index)
                    .delete(wtxn, &index_key(bucket, millis, &record.id))?;
            }
        }
        Ok(())
    }
}

fn index_key(bucket: TimeBucket, millis: i64, id: &SagaId) -> String {
    format!("{bucket}/{millis:0width$}/{id}", width = MILLIS_WIDTH)
}

fn index_key_bucket(key: &str) -> Result<TimeBucket, BackendError> {
    key.get(..BUCKET_PREFIX_LEN - 1)
        .and_then(TimeBucket::parse)
        .ok_or_else(|| BackendError::codec(format!("malformed index key: {key}")))
}

fn index_key_millis(key: &str) -> Result<i64, BackendError> {
    key.get(BUCKET_PREFIX_LEN..BUCKET_PREFIX_LEN + MILLIS_WIDTH)
        .and_then(|m| m.parse().ok())
        .ok_or_else(|| BackendError::codec(format!("malformed index key: {key}")))
}

/// Saga table stored in an LMDB environment
pub struct LmdbBackend {
    env: Env,
    table_name: Box<str>,
    tables: RwLock<Option<Tables>>,
}

impl LmdbBackend {
    /// Open (or create) the environment directory. The saga databases are
    /// opened by table bootstrap, not here.
    pub fn open(config: &LmdbConfig) -> Result<Self, BackendError> {
        std::fs::create_dir_all(&config.path).map_err(BackendError::storage)?;
        // SAFETY: each environment directory is opened by exactly one backend per process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size_bytes)
                .max_dbs(3)
                .open(&config.path)
        }?;
        tracing::debug!(path = %config.path.display(), "Opened LMDB environment");

        Ok(Self {
            env,
            table_name: config.table_name.clone().into_boxed_str(),
            tables: RwLock::new(None),
        })
    }

    fn database_names(&self) -> [String; 3] {
        [
            self.table_name.to_string(),
            format!("{}.{}", self.table_name, SagaIndex::CommitStamp.name()),
            format!("{}.{}", self.table_name, SagaIndex::TimeoutAt.name()),
        ]
    }

    fn tables(&self) -> Result<Tables, BackendError> {
        self.tables
            .read()
            .map_err(BackendError::storage)?
            .ok_or_else(|| BackendError::TableNotFound(self.table_name.clone()))
    }

    fn remember(&self, tables: Tables) -> Result<(), BackendError> {
        *self.tables.write().map_err(BackendError::storage)? = Some(tables);
        Ok(())
    }

    /// Run a transaction body on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&Env, Tables) -> Result<T, BackendError> + Send + 'static,
    {
        let tables = self.tables()?;
        let env = self.env.clone();
        tokio::task::spawn_blocking(move || f(&env, tables))
            .await
            .map_err(BackendError::storage)?
    }
}

#[async_trait]
impl SagaBackend for LmdbBackend {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn describe_table(&self) -> Result<Option<TableStatus>, BackendError> {
        let env = self.env.clone();
        let [records, commit_index, timeout_index] = self.database_names();
        let opened = tokio::task::spawn_blocking(move || -> Result<Option<Tables>, BackendError> {
            let wtxn = env.write_txn()?;
            let tables = match (
                env.open_database(&wtxn, Some(records.as_str()))?,
                env.open_database(&wtxn, Some(commit_index.as_str()))?,
                env.open_database(&wtxn, Some(timeout_index.as_str()))?,
            ) {
                (Some(records), Some(commit_stamp_index), Some(timeout_at_index)) => Some(Tables {
                    records,
                    commit_stamp_index,
                    timeout_at_index,
                }),
                _ => None,
            };
            wtxn.commit()?;
            Ok(tables)
        })
        .await
        .map_err(BackendError::storage)??;

        match opened {
            Some(tables) => {
                self.remember(tables)?;
                Ok(Some(TableStatus::Active))
            }
            None => Ok(None),
        }
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<TableStatus, BackendError> {
        let env = self.env.clone();
        let [records, commit_index, timeout_index] = self.database_names();
        let tables = tokio::task::spawn_blocking(move || -> Result<Tables, BackendError> {
            let mut wtxn = env.write_txn()?;
            let tables = Tables {
                records: env.create_database(&mut wtxn, Some(records.as_str()))?,
                commit_stamp_index: env.create_database(&mut wtxn, Some(commit_index.as_str()))?,
                timeout_at_index: env.create_database(&mut wtxn, Some(timeout_index.as_str()))?,
            };
            wtxn.commit()?;
            Ok(tables)
        })
        .await
        .map_err(BackendError::storage)??;

        self.remember(tables)?;
        tracing::info!(table = %spec.name, "Created LMDB saga databases");
        Ok(TableStatus::Active)
    }

    async fn put(&self, record: SagaRecord, condition: PutCondition) -> Result<(), BackendError> {
        self.run(move |env, t| {
            let mut wtxn = env.write_txn()?;
            let current = t.records.get(&wtxn, record.id.as_str())?;
            if !condition.holds_for(current.as_ref()) {
                return Err(BackendError::ConditionFailed);
            }
            if let Some(old) = &current {
                t.unindex(&mut wtxn, old)?;
            }
            t.records.put(&mut wtxn, record.id.as_str(), &record)?;
            t.index(&mut wtxn, &record)?;
            wtxn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &SagaId) -> Result<Option<SagaRecord>, BackendError> {
        let id = id.clone();
        self.run(move |env, t| {
            let rtxn = env.read_txn()?;
            Ok(t.records.get(&rtxn, id.as_str())?)
        })
        .await
    }

    async fn delete(&self, id: &SagaId) -> Result<(), BackendError> {
        let id = id.clone();
        self.run(move |env, t| {
            let mut wtxn = env.write_txn()?;
            if let Some(old) = t.records.get(&wtxn, id.as_str())? {
                t.unindex(&mut wtxn, &old)?;
                t.records.delete(&mut wtxn, id.as_str())?;
            }
            wtxn.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_command(
        &self,
        saga_id: &SagaId,
        command_id: &CommandId,
    ) -> Result<(), BackendError> {
        let saga_id = saga_id.clone();
        let command_id = command_id.clone();
        self.run(move |env, t| {
            let mut wtxn = env.write_txn()?;
            let Some(mut record) = t.records.get(&wtxn, saga_id.as_str())? else {
                return Err(BackendError::ConditionFailed);
            };
            if record.commands.shift_remove(&command_id).is_none() {
                return Err(BackendError::ConditionFailed);
            }
            // Index keys do not depend on commands
            t.records.put(&mut wtxn, saga_id.as_str(), &record)?;
            wtxn.commit()?;
            Ok(())
        })
        .await
    }

    async fn query_index(
        &self,
        index: SagaIndex,
        bucket: TimeBucket,
        upper_bound_millis: i64,
    ) -> Result<Vec<SagaRecord>, BackendError> {
        self.run(move |env, t| {
            let rtxn = env.read_txn()?;
            let prefix = format!("{bucket}/");
            let mut found = Vec::new();
            for entry in t.index_db(index).prefix_iter(&rtxn, &prefix)? {
                let (key, id) = entry?;
                if index_key_millis(key)? > upper_bound_millis {
                    break;
                }
                if let Some(record) = t.records.get(&rtxn, id)? {
                    found.push(record);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn earliest_bucket(&self, index: SagaIndex) -> Result<Option<TimeBucket>, BackendError> {
        self.run(move |env, t| {
            let rtxn = env.read_txn()?;
            // Keys sort by bucket first
            match t.index_db(index).first(&rtxn)? {
                Some((key, _)) => Ok(Some(index_key_bucket(key)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn scan_pending_commands(&self) -> Result<Vec<SagaRecord>, BackendError> {
        self.run(|env, t| {
            let rtxn = env.read_txn()?;
            let mut found = Vec::new();
            for entry in t.records.iter(&rtxn)? {
                let (_, record) = entry?;
                if record.has_pending_commands() {
                    found.push(record);
                }
            }
            Ok(found)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewCommand, Saga, SagaStore, SagaStoreConfig};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn test_index_key_layout() {
        let bucket = TimeBucket::new(2026, 10).unwrap();
        let key = index_key(bucket, 1_792_000_000_000, &SagaId::new("a/b"));
        assert_eq!(key, "202610/00000001792000000000/a/b");
        assert_eq!(index_key_millis(&key).unwrap(), 1_792_000_000_000);
        assert!(index_key_millis("202610/garbage").is_err());
        assert_eq!(index_key_bucket(&key).unwrap(), bucket);
        assert!(index_key_bucket("20261/").is_err());
    }

    #[tokio::test]
    async fn test_old_records_found_far_past_their_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LmdbBackend::open(&LmdbConfig::new(dir.path())).unwrap());
        let store = SagaStore::connect(backend.clone(), SagaStoreConfig::default())
            .await
            .unwrap();

        let mut saga = Saga::new("ancient")
            .with_timeout(Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap());
        saga.commit_stamp = Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        store.save(&mut saga, vec![]).await.unwrap();
        assert_eq!(
            backend.earliest_bucket(SagaIndex::TimeoutAt).await.unwrap(),
            TimeBucket::new(2024, 1)
        );

        let much_later = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(store.find_older_than(much_later).await.unwrap().len(), 1);
        assert_eq!(store.find_timed_out(much_later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_over_lmdb() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LmdbBackend::open(&LmdbConfig::new(dir.path())).unwrap());
        let store = SagaStore::connect(backend.clone(), SagaStoreConfig::default())
            .await
            .unwrap();

        let timeout = Utc.with_ymd_and_hms(2026, 10, 10, 0, 0, 0).unwrap();
        let mut saga = Saga::new("A").with_field("step", 1).with_timeout(timeout);
        store
            .save(&mut saga, vec![NewCommand::new("c1", "x")])
            .await
            .unwrap();

        let mut stale = saga.clone();
        saga.set_field("step", 2);
        store
            .save(&mut saga, vec![NewCommand::new("c2", "y")])
            .await
            .unwrap();
        assert!(store.save(&mut stale, vec![]).await.unwrap_err().is_concurrency());

        let loaded = store.get(&saga.id).await.unwrap().unwrap();
        assert_eq!(loaded, saga);

        let queue = store.dispatch_queue();
        assert_eq!(queue.find_undispatched_commands().await.unwrap().len(), 2);
        queue
            .acknowledge_dispatch(&CommandId::new("c1"), &saga.id)
            .await
            .unwrap();
        let pending = queue.find_undispatched_commands().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_id, CommandId::new("c2"));

        let due = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        assert_eq!(store.find_timed_out(due).await.unwrap().len(), 1);
        assert!(store
            .find_timed_out(Utc.with_ymd_and_hms(2026, 10, 9, 0, 0, 0).unwrap())
            .await
            .unwrap()
            .is_empty());

        store.remove(&saga.id).await.unwrap();
        assert!(store.find_timed_out(due).await.unwrap().is_empty());
        assert_eq!(store.get(&saga.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_finds_existing_table() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = Arc::new(LmdbBackend::open(&LmdbConfig::new(dir.path())).unwrap());
            let store = SagaStore::connect(backend, SagaStoreConfig::default())
                .await
                .unwrap();
            let mut saga = Saga::new("kept");
            store.save(&mut saga, vec![]).await.unwrap();
            store.disconnect();
        }

        let backend = LmdbBackend::open(&LmdbConfig::new(dir.path())).unwrap();
        assert_eq!(backend.describe_table().await.unwrap(), Some(TableStatus::Active));
        assert!(backend.get(&SagaId::new("kept")).await.unwrap().is_some());
    }
}
