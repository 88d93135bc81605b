//! Saga table bootstrap

use std::time::Duration;

use crate::{BackendError, SagaBackend, TableSpec, TableStatus};

/// Make sure the saga table and its indexes exist and are active.
///
/// Returns immediately if the table is already active; otherwise creates it
/// when missing and polls its status every `poll_interval` until the backend
/// reports it active. Errors from creation or from any poll are returned as-is.
/// There is no deadline here: wrap the call in `tokio::time::timeout` when the
/// wait must be bounded.
pub async fn ensure_ready(
    backend: &dyn SagaBackend,
    spec: &TableSpec,
    poll_interval: Duration,
) -> Result<TableStatus, BackendError> {
    let mut status = match backend.describe_table().await? {
        Some(status) => status,
        None => {
            tracing::info!(table = %spec.name, indexes = spec.indexes.len(), "Creating saga table");
            backend.create_table(spec).await.map_err(|e| {
                tracing::error!(table = %spec.name, error = %e, "Saga table creation rejected");
                e
            })?
        }
    };

    while !status.is_active() {
        tracing::debug!(table = %spec.name, status = %status, "Waiting for saga table");
        tokio::time::sleep(poll_interval).await;
        status = backend
            .describe_table()
            .await?
            .ok_or_else(|| BackendError::TableNotFound(spec.name.clone()))?;
    }

    tracing::info!(table = %spec.name, "Saga table active");
    Ok(status)
}
