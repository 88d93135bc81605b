//! Saga persistence for process orchestration
//!
//! Stores the mutable state of long-running business transactions ("sagas"),
//! the commands each saga still owes to downstream participants, and an optional
//! wake-up time for timeout-driven recovery.
//!
//! - Writes use optimistic concurrency: the first save of a saga is insert-once,
//!   later saves compare-and-swap on an opaque version token.
//! - Timed-out and stale sagas are found through two secondary indexes
//!   partitioned by calendar month, never through a full-table scan.
//! - Pending commands are extracted by the [`DispatchQueue`] and acknowledged one
//!   by one; delivery is at-least-once.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let backend = Arc::new(InMemoryBackend::new());
//! let store = SagaStore::connect(backend, SagaStoreConfig::default()).await?;
//!
//! let mut saga = Saga::new("order-17").with_field("step", "reserve");
//! store.save(&mut saga, vec![NewCommand::new("reserve-1", json!({"sku": "A"}))]).await?;
//!
//! let queue = store.dispatch_queue();
//! for cmd in queue.find_undispatched_commands().await? {
//!     deliver(&cmd)?;
//!     queue.acknowledge_dispatch(&cmd.command_id, &cmd.saga_id).await?;
//! }
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod bucket;
mod errors;
mod saga;

// === Persistence Format ===
pub mod codec;
pub mod schema;

// === Configuration ===
pub mod clock;
pub mod config;

// === Storage ===
pub mod backend;
mod bootstrap;
mod dispatch;
mod store;

// === Observability ===
mod stats;

#[cfg(feature = "test-support")]
pub mod testing;

// === Re-exports ===

// Types
pub use bucket::TimeBucket;
pub use saga::{CommandId, NewCommand, PendingCommand, Saga, SagaId, SagaVersion};

// Errors
pub use errors::{BackendError, SagaStoreError};

// Persistence format
pub use codec::SagaRecord;
pub use schema::{IndexSpec, SagaIndex, TableSpec, TableStatus};

// Configuration
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SagaStoreConfig, Throughput, ThroughputConfig};

// Storage
pub use backend::{InMemoryBackend, PutCondition, SagaBackend};
pub use bootstrap::ensure_ready;
pub use dispatch::DispatchQueue;
pub use store::SagaStore;

// Observability
pub use stats::{StoreStats, StoreStatsSnapshot};
