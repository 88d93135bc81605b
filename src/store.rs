//! Saga store: optimistic-concurrency writes, point reads and bucketed scans

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;

use crate::bootstrap::ensure_ready;
use crate::codec::{self, from_millis, to_millis, validate_saga_id};
use crate::schema::{ATTR_COMMIT_STAMP, ATTR_TIMEOUT_AT};
use crate::stats::StoreStats;
use crate::{
    BackendError, Clock, DispatchQueue, NewCommand, PutCondition, Saga, SagaBackend, SagaId,
    SagaIndex, SagaStoreConfig, SagaStoreError, SagaVersion, StoreStatsSnapshot, SystemClock,
    TableSpec, TimeBucket,
};

/// Saga persistence over an injected [`SagaBackend`].
///
/// A store only exists after [`connect`](Self::connect) has made sure the
/// table is ready. It keeps no state of its own besides counters; clone the
/// `Arc` around it or call [`dispatch_queue`](Self::dispatch_queue) to share it.
pub struct SagaStore {
    backend: Arc<dyn SagaBackend>,
    clock: Arc<dyn Clock>,
    config: SagaStoreConfig,
    stats: Arc<StoreStats>,
}

impl SagaStore {
    /// Bootstrap the table and return a ready store
    pub async fn connect(
        backend: Arc<dyn SagaBackend>,
        config: SagaStoreConfig,
    ) -> Result<Self, SagaStoreError> {
        Self::connect_with_clock(backend, config, Arc::new(SystemClock)).await
    }

    /// [`connect`](Self::connect) with an explicit time source for commit
    /// stamps and [`find_timed_out_now`](Self::find_timed_out_now)
    pub async fn connect_with_clock(
        backend: Arc<dyn SagaBackend>,
        config: SagaStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SagaStoreError> {
        config.validate()?;
        let spec = TableSpec::new(backend.table_name(), &config.throughput);
        ensure_ready(backend.as_ref(), &spec, config.poll_interval()).await?;
        tracing::info!(
            table = %spec.name,
            lookback_months = ?config.bucket_lookback_months,
            "Saga store connected"
        );

        Ok(Self {
            backend,
            clock,
            config,
            stats: Arc::new(StoreStats::new()),
        })
    }

    /// Release the store. Any outstanding [`DispatchQueue`] keeps the backend alive.
    pub fn disconnect(self) {
        tracing::info!(table = %self.backend.table_name(), "Saga store disconnected");
    }

    /// Handle for draining and acknowledging queued commands
    pub fn dispatch_queue(&self) -> DispatchQueue {
        DispatchQueue::new(self.backend.clone(), self.stats.clone())
    }

    /// The backend this store writes to
    pub fn backend(&self) -> &Arc<dyn SagaBackend> {
        &self.backend
    }

    /// Settings the store was connected with
    pub fn config(&self) -> &SagaStoreConfig {
        &self.config
    }

    /// Counters since connect, shared with every [`DispatchQueue`] handed out
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Persist `saga` and queue `commands` for dispatch.
    ///
    /// An unsaved saga (`version == None`) is inserted only if no record with its
    /// id exists. A saved saga is written only if the stored record still has the
    /// saga's version; commands already pending on that record are kept and the
    /// new ones are appended. Either way a lost race is reported as
    /// [`SagaStoreError::Concurrency`] and the caller should re-read and retry.
    ///
    /// On success `saga` carries the new version and the commit stamp that was
    /// written: the store clock's now, unless the caller set a stamp other than
    /// the one of the previous save.
    pub async fn save(
        &self,
        saga: &mut Saga,
        commands: Vec<NewCommand>,
    ) -> Result<(), SagaStoreError> {
        codec::validate(saga, &commands)?;

        let next_version = SagaVersion::generate();

        let (record, condition, queued) = match saga.version.clone() {
            None => {
                let commit_stamp = saga.commit_stamp.unwrap_or_else(|| self.clock.now());
                let queued = commands.len();
                (
                    codec::encode(saga, commit_stamp, next_version, IndexMap::new(), commands)?,
                    PutCondition::NotExists,
                    queued,
                )
            }
            Some(expected) => {
                let current = match self.backend.get(&saga.id).await? {
                    Some(current) if current.version == expected => current,
                    _ => return Err(self.conflict(&saga.id)),
                };
                // A stamp carried over from the last save is replaced
                let commit_stamp = match saga.commit_stamp {
                    Some(at) if at.timestamp_millis() != current.commit_stamp => at,
                    _ => self.clock.now(),
                };
                // Re-queueing a pending id replaces its payload
                let queued = commands
                    .iter()
                    .filter(|cmd| !current.commands.contains_key(&cmd.id))
                    .count();
                (
                    codec::encode(saga, commit_stamp, next_version, current.commands, commands)?,
                    PutCondition::VersionEquals(expected),
                    queued,
                )
            }
        };

        let is_insert = condition == PutCondition::NotExists;
        let version = record.version.clone();
        let written_commit_stamp = record.commit_stamp;
        let written_timeout_at = record.timeout_at;

        match self.backend.put(record, condition).await {
            Ok(()) => {}
            Err(BackendError::ConditionFailed) => return Err(self.conflict(&saga.id)),
            Err(e) => {
                tracing::error!(saga_id = %saga.id, error = %e, "Saga save failed");
                return Err(e.into());
            }
        }

        StoreStats::incr(if is_insert {
            &self.stats.inserts
        } else {
            &self.stats.updates
        });
        self.stats
            .commands_queued
            .fetch_add(queued as u64, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(
            saga_id = %saga.id,
            version = %version,
            commands = queued,
            insert = is_insert,
            "Saga saved"
        );

        saga.version = Some(version);
        saga.commit_stamp = Some(from_millis(written_commit_stamp, ATTR_COMMIT_STAMP)?);
        saga.timeout_at = written_timeout_at
            .map(|m| from_millis(m, ATTR_TIMEOUT_AT))
            .transpose()?;
        Ok(())
    }

    /// Point lookup, `None` if no saga with this id exists
    pub async fn get(&self, id: &SagaId) -> Result<Option<Saga>, SagaStoreError> {
        validate_saga_id(id)?;
        StoreStats::incr(&self.stats.gets);

        match self.backend.get(id).await? {
            Some(record) => Ok(Some(codec::decode(record)?)),
            None => Ok(None),
        }
    }

    /// Delete a saga unconditionally. Removing an unknown id succeeds.
    pub async fn remove(&self, id: &SagaId) -> Result<(), SagaStoreError> {
        validate_saga_id(id)?;
        self.backend.delete(id).await.map_err(|e| {
            tracing::error!(saga_id = %id, error = %e, "Saga removal failed");
            e
        })?;
        StoreStats::incr(&self.stats.removals);
        tracing::debug!(saga_id = %id, "Saga removed");
        Ok(())
    }

    /// Sagas whose timeout is at or before `as_of`.
    ///
    /// Scans the timeout index from `as_of`'s month back to the oldest month
    /// holding a timeout, or `bucket_lookback_months` months if that cap is
    /// set. Results are unordered.
    pub async fn find_timed_out(&self, as_of: DateTime<Utc>) -> Result<Vec<Saga>, SagaStoreError> {
        self.scan_index(SagaIndex::TimeoutAt, as_of).await
    }

    /// [`find_timed_out`](Self::find_timed_out) as of the store clock's now
    pub async fn find_timed_out_now(&self) -> Result<Vec<Saga>, SagaStoreError> {
        self.find_timed_out(self.clock.now()).await
    }

    /// Sagas last saved at or before `cutoff`, scanned like
    /// [`find_timed_out`](Self::find_timed_out)
    pub async fn find_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Saga>, SagaStoreError> {
        self.scan_index(SagaIndex::CommitStamp, cutoff).await
    }

    /// Not supported: wiping every saga is never done through the store
    pub async fn clear(&self) -> Result<(), SagaStoreError> {
        tracing::error!(table = %self.backend.table_name(), "clear is not supported by the saga store");
        Err(SagaStoreError::Unsupported("clear"))
    }

    async fn scan_index(
        &self,
        index: SagaIndex,
        upper: DateTime<Utc>,
    ) -> Result<Vec<Saga>, SagaStoreError> {
        let upper_millis = to_millis(upper, index.sort_attribute())?;
        StoreStats::incr(&self.stats.scans);

        let floor = self.backend.earliest_bucket(index).await.map_err(|e| {
            tracing::error!(index = index.name(), error = %e, "Reading oldest index bucket failed");
            e
        })?;
        let Some(floor) = floor else {
            tracing::debug!(index = index.name(), "Index holds no records");
            return Ok(Vec::new());
        };
        let months = self
            .config
            .bucket_lookback_months
            .map_or(usize::MAX, |m| m as usize);

        let mut sagas = Vec::new();
        for bucket in TimeBucket::containing(upper).down_to(floor).take(months) {
            let records = self
                .backend
                .query_index(index, bucket, upper_millis)
                .await
                .map_err(|e| {
                    tracing::error!(index = index.name(), bucket = %bucket, error = %e, "Index scan failed");
                    e
                })?;
            for record in records {
                sagas.push(codec::decode(record)?);
            }
        }

        tracing::debug!(index = index.name(), found = sagas.len(), "Index scan complete");
        Ok(sagas)
    }

    fn conflict(&self, saga_id: &SagaId) -> SagaStoreError {
        StoreStats::incr(&self.stats.conflicts);
        tracing::warn!(saga_id = %saga_id, "Saga version conflict");
        SagaStoreError::Concurrency {
            saga_id: saga_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBackend, ManualClock};
    use chrono::TimeZone;
    use serde_json::json;

    async fn store_at(now: DateTime<Utc>) -> (SagaStore, Arc<InMemoryBackend>, Arc<ManualClock>) {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(now));
        let store =
            SagaStore::connect_with_clock(backend.clone(), SagaStoreConfig::default(), clock.clone())
                .await
                .unwrap();
        (store, backend, clock)
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 8, 30, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_once() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        let mut first = Saga::new("A");
        let mut second = first.clone();

        store.save(&mut first, vec![]).await.unwrap();
        assert!(first.version.is_some());

        let err = store.save(&mut second, vec![]).await.unwrap_err();
        assert!(err.is_concurrency());
        assert!(second.version.is_none());
        assert_eq!(store.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("A");
        store.save(&mut saga, vec![]).await.unwrap();
        let stale = saga.clone();

        store.save(&mut saga, vec![]).await.unwrap();
        assert_ne!(saga.version, stale.version);

        let mut stale = stale;
        assert!(store.save(&mut stale, vec![]).await.unwrap_err().is_concurrency());
    }

    #[tokio::test]
    async fn test_versioned_save_of_missing_saga_conflicts() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("ghost");
        saga.version = Some(SagaVersion::new("v1"));
        assert!(store.save(&mut saga, vec![]).await.unwrap_err().is_concurrency());
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let (store, backend, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("A");
        let err = store
            .save(&mut saga, vec![NewCommand::new("c1", json!(null))])
            .await
            .unwrap_err();
        assert!(matches!(err, SagaStoreError::Validation(_)));
        assert!(backend.is_empty());

        assert!(matches!(
            store.get(&SagaId::new("")).await,
            Err(SagaStoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_stamp_defaults_to_clock() {
        let now = at(2026, 10, 16);
        let (store, backend, _) = store_at(now).await;
        let mut saga = Saga::new("A");
        store.save(&mut saga, vec![]).await.unwrap();
        assert_eq!(saga.commit_stamp, Some(now));

        let record = backend.record(&saga.id).unwrap();
        assert_eq!(record.commit_stamp, now.timestamp_millis());
        assert_eq!(record.commit_stamp_bucket.label(), "202610");
    }

    #[tokio::test]
    async fn test_update_restamps_unless_caller_moved_the_stamp() {
        let (store, _, clock) = store_at(at(2026, 9, 20)).await;
        let mut saga = Saga::new("A");
        store.save(&mut saga, vec![]).await.unwrap();

        clock.set(at(2026, 10, 16));
        store.save(&mut saga, vec![]).await.unwrap();
        assert_eq!(saga.commit_stamp, Some(at(2026, 10, 16)));
        assert!(store.find_older_than(at(2026, 10, 1)).await.unwrap().is_empty());

        saga.commit_stamp = Some(at(2026, 10, 2));
        store.save(&mut saga, vec![]).await.unwrap();
        assert_eq!(saga.commit_stamp, Some(at(2026, 10, 2)));
    }

    #[tokio::test]
    async fn test_get_roundtrip_strips_internal_fields() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("A")
            .with_field("customer", "c-9")
            .with_timeout(at(2026, 10, 20));
        store
            .save(&mut saga, vec![NewCommand::new("c1", "x")])
            .await
            .unwrap();

        let loaded = store.get(&saga.id).await.unwrap().unwrap();
        assert_eq!(loaded, saga);
        assert!(loaded.field("commands").is_none());
        assert!(loaded.field("timeoutAtBucket").is_none());

        assert_eq!(store.get(&SagaId::new("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_deletes() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("A");
        store.save(&mut saga, vec![]).await.unwrap();

        store.remove(&saga.id).await.unwrap();
        assert_eq!(store.get(&saga.id).await.unwrap(), None);
        // Removing again is fine
        store.remove(&saga.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_is_unsupported() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        assert!(matches!(
            store.clear().await,
            Err(SagaStoreError::Unsupported("clear"))
        ));
    }

    #[tokio::test]
    async fn test_find_timed_out() {
        let (store, _, clock) = store_at(at(2026, 10, 1)).await;
        for (id, timeout) in [
            ("due", at(2026, 10, 10)),
            ("last-month", at(2026, 9, 28)),
            ("later", at(2026, 10, 25)),
            ("next-month", at(2026, 11, 2)),
        ] {
            let mut saga = Saga::new(id).with_timeout(timeout);
            store.save(&mut saga, vec![]).await.unwrap();
        }
        let mut no_timeout = Saga::new("none");
        store.save(&mut no_timeout, vec![]).await.unwrap();

        let mut ids: Vec<String> = store
            .find_timed_out(at(2026, 10, 16))
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["due", "last-month"]);

        clock.set(at(2026, 11, 30));
        assert_eq!(store.find_timed_out_now().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_find_older_than_across_months() {
        let (store, _, clock) = store_at(at(2026, 8, 15)).await;
        let mut old = Saga::new("old");
        store.save(&mut old, vec![]).await.unwrap();

        clock.set(at(2026, 10, 15));
        let mut fresh = Saga::new("fresh");
        store.save(&mut fresh, vec![]).await.unwrap();

        let found = store.find_older_than(at(2026, 9, 1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, SagaId::new("old"));
    }

    #[tokio::test]
    async fn test_scans_reach_the_oldest_bucket() {
        let (store, _, _) = store_at(at(2024, 1, 10)).await;
        let mut saga = Saga::new("ancient").with_timeout(at(2024, 1, 20));
        store.save(&mut saga, vec![]).await.unwrap();

        let much_later = at(2026, 10, 1);
        let stale = store.find_older_than(much_later).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, SagaId::new("ancient"));
        let due = store.find_timed_out(much_later).await.unwrap();
        assert_eq!(due.len(), 1);

        // Bound before the oldest bucket
        assert!(store.find_older_than(at(2023, 12, 1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_of_empty_index_finds_nothing() {
        let (store, _, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("no-timeout");
        store.save(&mut saga, vec![]).await.unwrap();
        assert!(store.find_timed_out(at(2026, 12, 1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookback_cap_limits_scan() {
        let backend = Arc::new(InMemoryBackend::new());
        let clock = Arc::new(ManualClock::new(at(2026, 1, 15)));
        let config = SagaStoreConfig {
            bucket_lookback_months: Some(2),
            ..SagaStoreConfig::default()
        };
        let store = SagaStore::connect_with_clock(backend, config, clock)
            .await
            .unwrap();

        let mut saga = Saga::new("A").with_timeout(at(2025, 11, 20));
        store.save(&mut saga, vec![]).await.unwrap();

        // 202603 and 202602 only
        assert!(store.find_timed_out(at(2026, 3, 1)).await.unwrap().is_empty());
        // 202512 and 202511
        assert_eq!(store.find_timed_out(at(2025, 12, 1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeued_command_counts_once() {
        let (store, backend, _) = store_at(at(2026, 10, 16)).await;
        let mut saga = Saga::new("A");
        store
            .save(&mut saga, vec![NewCommand::new("c1", "first")])
            .await
            .unwrap();
        store
            .save(
                &mut saga,
                vec![NewCommand::new("c1", "again"), NewCommand::new("c2", "x")],
            )
            .await
            .unwrap();

        let pending = backend.record(&saga.id).unwrap().commands;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[&crate::CommandId::new("c1")], json!("again"));
        assert_eq!(store.stats().commands_queued, 2);
    }

    /// Commits a competing write between a save's read and its write
    struct InterleavedWriter {
        inner: InMemoryBackend,
    }

    #[async_trait::async_trait]
    impl SagaBackend for InterleavedWriter {
        fn table_name(&self) -> &str {
            self.inner.table_name()
        }

        async fn describe_table(&self) -> Result<Option<crate::TableStatus>, BackendError> {
            self.inner.describe_table().await
        }

        async fn create_table(&self, spec: &TableSpec) -> Result<crate::TableStatus, BackendError> {
            self.inner.create_table(spec).await
        }

        async fn put(
            &self,
            record: crate::SagaRecord,
            condition: PutCondition,
        ) -> Result<(), BackendError> {
            self.inner.put(record, condition).await
        }

        async fn get(&self, id: &SagaId) -> Result<Option<crate::SagaRecord>, BackendError> {
            let current = self.inner.get(id).await?;
            if let Some(record) = &current {
                let mut rival = record.clone();
                rival.version = SagaVersion::generate();
                self.inner
                    .put(rival, PutCondition::VersionEquals(record.version.clone()))
                    .await?;
            }
            Ok(current)
        }

        async fn delete(&self, id: &SagaId) -> Result<(), BackendError> {
            self.inner.delete(id).await
        }

        async fn remove_command(
            &self,
            saga_id: &SagaId,
            command_id: &crate::CommandId,
        ) -> Result<(), BackendError> {
            self.inner.remove_command(saga_id, command_id).await
        }

        async fn query_index(
            &self,
            index: SagaIndex,
            bucket: TimeBucket,
            upper_bound_millis: i64,
        ) -> Result<Vec<crate::SagaRecord>, BackendError> {
            self.inner.query_index(index, bucket, upper_bound_millis).await
        }

        async fn earliest_bucket(
            &self,
            index: SagaIndex,
        ) -> Result<Option<TimeBucket>, BackendError> {
            self.inner.earliest_bucket(index).await
        }

        async fn scan_pending_commands(&self) -> Result<Vec<crate::SagaRecord>, BackendError> {
            self.inner.scan_pending_commands().await
        }
    }

    #[tokio::test]
    async fn test_write_rejected_after_matching_read_is_a_conflict() {
        let backend = Arc::new(InterleavedWriter {
            inner: InMemoryBackend::new(),
        });
        let clock = Arc::new(ManualClock::new(at(2026, 10, 16)));
        let store =
            SagaStore::connect_with_clock(backend.clone(), SagaStoreConfig::default(), clock)
                .await
                .unwrap();

        // Inserts never read first
        let mut saga = Saga::new("A");
        store.save(&mut saga, vec![]).await.unwrap();
        let before = saga.version.clone();

        let err = store
            .save(&mut saga, vec![NewCommand::new("c1", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, SagaStoreError::Concurrency { ref saga_id } if *saga_id == saga.id));
        assert_eq!(saga.version, before);

        let stats = store.stats();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.updates, 0);
        assert_eq!(stats.commands_queued, 0);
        assert!(backend.inner.record(&saga.id).unwrap().commands.is_empty());
    }
}
