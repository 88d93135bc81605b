//! Dispatch queue view over the commands pending on sagas

use std::sync::Arc;

use crate::codec::{from_millis, validate_id, validate_saga_id};
use crate::schema::ATTR_COMMIT_STAMP;
use crate::stats::StoreStats;
use crate::{BackendError, CommandId, PendingCommand, SagaBackend, SagaId, SagaStoreError};

/// Extraction and acknowledgement of undispatched commands.
///
/// Delivery is at-least-once: a command is returned by every scan until it is
/// acknowledged, so consumers must tolerate duplicates.
#[derive(Clone)]
pub struct DispatchQueue {
    backend: Arc<dyn SagaBackend>,
    stats: Arc<StoreStats>,
}

impl DispatchQueue {
    pub(crate) fn new(backend: Arc<dyn SagaBackend>, stats: Arc<StoreStats>) -> Self {
        Self { backend, stats }
    }

    /// Every command pending on every saga, one entry per command.
    ///
    /// Order across sagas is unspecified. Within a saga commands come in the order
    /// they were queued when the backend preserves it; do not rely on it.
    pub async fn find_undispatched_commands(&self) -> Result<Vec<PendingCommand>, SagaStoreError> {
        StoreStats::incr(&self.stats.scans);
        let records = self.backend.scan_pending_commands().await.map_err(|e| {
            tracing::error!(error = %e, "Pending command scan failed");
            e
        })?;

        let mut pending = Vec::new();
        for record in records {
            let commit_stamp = from_millis(record.commit_stamp, ATTR_COMMIT_STAMP)?;
            for (command_id, payload) in record.commands {
                pending.push(PendingCommand {
                    saga_id: record.id.clone(),
                    command_id,
                    payload,
                    commit_stamp,
                });
            }
        }

        tracing::debug!(pending = pending.len(), "Pending command scan complete");
        Ok(pending)
    }

    /// Mark one command of one saga as delivered by removing it from the saga.
    ///
    /// The removal is a partial update that ignores the saga version, so it never
    /// conflicts with business-state saves. Acknowledging a command that is no
    /// longer pending (or a saga that no longer exists) succeeds without effect.
    ///
    /// A `save` that read the saga before this acknowledgement and writes after it
    /// carries the command forward again; it is then dispatched a second time.
    pub async fn acknowledge_dispatch(
        &self,
        command_id: &CommandId,
        saga_id: &SagaId,
    ) -> Result<(), SagaStoreError> {
        validate_id(command_id.as_str(), "command id")?;
        validate_saga_id(saga_id)?;

        match self.backend.remove_command(saga_id, command_id).await {
            Ok(()) => {
                StoreStats::incr(&self.stats.commands_acknowledged);
                tracing::debug!(saga_id = %saga_id, command_id = %command_id, "Command acknowledged");
                Ok(())
            }
            Err(BackendError::ConditionFailed) => {
                tracing::debug!(
                    saga_id = %saga_id,
                    command_id = %command_id,
                    "Command already acknowledged"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(saga_id = %saga_id, command_id = %command_id, error = %e, "Command acknowledgement failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBackend, NewCommand, Saga, SagaStore, SagaStoreConfig};
    use serde_json::json;

    async fn connected() -> (SagaStore, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = SagaStore::connect(backend.clone(), SagaStoreConfig::default())
            .await
            .unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn test_flattens_one_entry_per_command() {
        let (store, _) = connected().await;
        let mut a = Saga::new("A");
        store
            .save(
                &mut a,
                vec![NewCommand::new("c1", "x"), NewCommand::new("c2", json!({"n": 2}))],
            )
            .await
            .unwrap();
        let mut b = Saga::new("B");
        store
            .save(&mut b, vec![NewCommand::new("c1", "y")])
            .await
            .unwrap();
        let mut idle = Saga::new("idle");
        store.save(&mut idle, vec![]).await.unwrap();

        let mut found: Vec<(String, String)> = store
            .dispatch_queue()
            .find_undispatched_commands()
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.saga_id.to_string(), p.command_id.to_string()))
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("A".to_string(), "c1".to_string()),
                ("A".to_string(), "c2".to_string()),
                ("B".to_string(), "c1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_acknowledge_removes_only_that_command() {
        let (store, backend) = connected().await;
        let mut saga = Saga::new("A");
        store
            .save(
                &mut saga,
                vec![NewCommand::new("c1", "x"), NewCommand::new("c2", "y")],
            )
            .await
            .unwrap();
        let version_before = backend.record(&saga.id).unwrap().version;

        let queue = store.dispatch_queue();
        queue
            .acknowledge_dispatch(&CommandId::new("c1"), &saga.id)
            .await
            .unwrap();

        let pending = queue.find_undispatched_commands().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command_id, CommandId::new("c2"));
        assert_eq!(pending[0].payload, json!("y"));
        assert_eq!(Some(pending[0].commit_stamp), saga.commit_stamp);

        // Acknowledgement leaves the version alone
        assert_eq!(backend.record(&saga.id).unwrap().version, version_before);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let (store, _) = connected().await;
        let queue = store.dispatch_queue();
        queue
            .acknowledge_dispatch(&CommandId::new("c1"), &SagaId::new("nobody"))
            .await
            .unwrap();
        assert_eq!(store.stats().commands_acknowledged, 0);

        assert!(matches!(
            queue
                .acknowledge_dispatch(&CommandId::new(""), &SagaId::new("A"))
                .await,
            Err(SagaStoreError::Validation(_))
        ));
    }
}
