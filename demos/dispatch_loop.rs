//! Order workflow over the in-memory saga table
//!
//! A coordinator saves an order saga together with the commands it owes the
//! billing and shipping participants, a dispatcher drains and acknowledges them,
//! and a recovery sweep picks the saga up again once its timeout has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use saga_store::{
    InMemoryBackend, ManualClock, NewCommand, PendingCommand, Saga, SagaStore, SagaStoreConfig,
    SagaStoreError,
};
use serde_json::json;

fn deliver(cmd: &PendingCommand) {
    tracing::info!(
        saga_id = %cmd.saga_id,
        command_id = %cmd.command_id,
        payload = %cmd.payload,
        "Delivering command"
    );
}

async fn drain(store: &SagaStore) -> Result<usize, SagaStoreError> {
    let queue = store.dispatch_queue();
    let pending = queue.find_undispatched_commands().await?;
    for cmd in &pending {
        deliver(cmd);
        queue
            .acknowledge_dispatch(&cmd.command_id, &cmd.saga_id)
            .await?;
    }
    Ok(pending.len())
}

#[tokio::main]
async fn main() -> Result<(), SagaStoreError> {
    tracing_subscriber::fmt::init();

    let start = DateTime::<Utc>::from_timestamp(1_790_000_000, 0).unwrap_or_default();
    let clock = Arc::new(ManualClock::new(start));
    let backend = Arc::new(InMemoryBackend::new().with_activation_delay(1));
    let store = SagaStore::connect_with_clock(
        backend,
        SagaStoreConfig {
            poll_interval_millis: 50,
            ..SagaStoreConfig::default()
        },
        clock.clone(),
    )
    .await?;

    // Coordinator: open the order and ask billing to charge
    let mut order = Saga::new("order-17")
        .with_field("step", "charging")
        .with_field("amount", 120)
        .with_timeout(start + chrono::Duration::minutes(15));
    store
        .save(
            &mut order,
            vec![NewCommand::new(
                "charge-1",
                json!({"to": "billing", "amount": 120}),
            )],
        )
        .await?;
    tracing::info!(version = ?order.version, "Order saga opened");

    clock.advance(Duration::from_secs(30));
    let delivered = drain(&store).await?;
    tracing::info!(delivered, "First dispatch pass complete");

    // Billing answered: move on to shipping
    order.set_field("step", "shipping");
    store
        .save(
            &mut order,
            vec![NewCommand::new(
                "ship-1",
                json!({"to": "shipping", "address": "Main St 1"}),
            )],
        )
        .await?;

    // Nothing is overdue yet
    let overdue = store.find_timed_out_now().await?;
    tracing::info!(overdue = overdue.len(), "Timeout sweep before deadline");

    // Shipping never answers; the dispatcher is down until after the deadline
    clock.advance(Duration::from_secs(20 * 60));
    for saga in store.find_timed_out_now().await? {
        tracing::warn!(saga_id = %saga.id, step = ?saga.field("step"), "Saga timed out");
    }

    let delivered = drain(&store).await?;
    tracing::info!(delivered, "Second dispatch pass complete");

    store.remove(&order.id).await?;
    tracing::info!(stats = ?store.stats(), "Done");
    store.disconnect();
    Ok(())
}
