//! Helpers for tests of code built on the saga store

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing_subscriber::EnvFilter;

use crate::{InMemoryBackend, ManualClock, SagaStore, SagaStoreConfig, SagaStoreError};

/// Install a `fmt` subscriber honouring `RUST_LOG`; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A connected store over a fresh in-memory table, driven by a manual clock
pub async fn in_memory_store(
    now: DateTime<Utc>,
) -> Result<(SagaStore, Arc<InMemoryBackend>, Arc<ManualClock>), SagaStoreError> {
    let backend = Arc::new(InMemoryBackend::new());
    let clock = Arc::new(ManualClock::new(now));
    let store =
        SagaStore::connect_with_clock(backend.clone(), SagaStoreConfig::default(), clock.clone())
            .await?;
    Ok((store, backend, clock))
}
