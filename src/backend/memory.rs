//! In-memory backend for tests and single-process use

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{PutCondition, SagaBackend};
use crate::config::DEFAULT_TABLE_NAME;
use crate::{
    BackendError, CommandId, SagaId, SagaIndex, SagaRecord, TableSpec, TableStatus, TimeBucket,
};

struct MemoryTable {
    spec: TableSpec,
    polls_until_active: u32,
    records: HashMap<SagaId, SagaRecord>,
}

/// Saga table held in a `RwLock<HashMap>`
pub struct InMemoryBackend {
    table_name: Box<str>,
    activation_polls: u32,
    table: RwLock<Option<MemoryTable>>,
}

impl InMemoryBackend {
    /// Backend for the default `sagas` table
    pub fn new() -> Self {
        Self::with_table_name(DEFAULT_TABLE_NAME)
    }

    /// Backend for a table with a custom name
    pub fn with_table_name(table_name: impl Into<Box<str>>) -> Self {
        Self {
            table_name: table_name.into(),
            activation_polls: 0,
            table: RwLock::new(None),
        }
    }

    /// Report a freshly created table as `CREATING` for this many status polls
    pub fn with_activation_delay(mut self, polls: u32) -> Self {
        self.activation_polls = polls;
        self
    }

    /// Raw stored record, including internal attributes
    pub fn record(&self, id: &SagaId) -> Option<SagaRecord> {
        self.table
            .read()
            .ok()?
            .as_ref()?
            .records
            .get(id)
            .cloned()
    }

    /// Definition the table was created with
    pub fn table_spec(&self) -> Option<TableSpec> {
        Some(self.table.read().ok()?.as_ref()?.spec.clone())
    }

    /// Number of stored sagas
    pub fn len(&self) -> usize {
        self.table
            .read()
            .ok()
            .and_then(|t| t.as_ref().map(|t| t.records.len()))
            .unwrap_or(0)
    }

    /// Whether no saga is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_records<T>(
        &self,
        f: impl FnOnce(&HashMap<SagaId, SagaRecord>) -> T,
    ) -> Result<T, BackendError> {
        let guard = self.table.read().map_err(BackendError::storage)?;
        let table = guard
            .as_ref()
            .ok_or_else(|| BackendError::TableNotFound(self.table_name.clone()))?;
        Ok(f(&table.records))
    }

    fn write_records<T>(
        &self,
        f: impl FnOnce(&mut HashMap<SagaId, SagaRecord>) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut guard = self.table.write().map_err(BackendError::storage)?;
        let table = guard
            .as_mut()
            .ok_or_else(|| BackendError::TableNotFound(self.table_name.clone()))?;
        f(&mut table.records)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SagaBackend for InMemoryBackend {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn describe_table(&self) -> Result<Option<TableStatus>, BackendError> {
        let mut guard = self.table.write().map_err(BackendError::storage)?;
        Ok(guard.as_mut().map(|table| {
            if table.polls_until_active == 0 {
                TableStatus::Active
            } else {
                table.polls_until_active -= 1;
                TableStatus::Creating
            }
        }))
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<TableStatus, BackendError> {
        let mut guard = self.table.write().map_err(BackendError::storage)?;
        if guard.is_some() {
            return Err(BackendError::storage(format!(
                "table {} already exists",
                spec.name
            )));
        }
        *guard = Some(MemoryTable {
            spec: spec.clone(),
            polls_until_active: self.activation_polls,
            records: HashMap::new(),
        });
        Ok(if self.activation_polls == 0 {
            TableStatus::Active
        } else {
            TableStatus::Creating
        })
    }

    async fn put(&self, record: SagaRecord, condition: PutCondition) -> Result<(), BackendError> {
        self.write_records(|records| {
            if !condition.holds_for(records.get(&record.id)) {
                return Err(BackendError::ConditionFailed);
            }
            records.insert(record.id.clone(), record);
            Ok(())
        })
    }

    async fn get(&self, id: &SagaId) -> Result<Option<SagaRecord>, BackendError> {
        self.read_records(|records| records.get(id).cloned())
    }

    async fn delete(&self, id: &SagaId) -> Result<(), BackendError> {
        self.write_records(|records| {
            records.remove(id);
            Ok(())
        })
    }

    async fn remove_command(
        &self,
        saga_id: &SagaId,
        command_id: &CommandId,
    ) -> Result<(), BackendError> {
        self.write_records(|records| {
            records
                .get_mut(saga_id)
                .and_then(|record| record.commands.shift_remove(command_id))
                .map(|_| ())
                .ok_or(BackendError::ConditionFailed)
        })
    }

    async fn query_index(
        &self,
        index: SagaIndex,
        bucket: TimeBucket,
        upper_bound_millis: i64,
    ) -> Result<Vec<SagaRecord>, BackendError> {
        self.read_records(|records| {
            records
                .values()
                .filter(|record| {
                    record
                        .index_entry(index)
                        .is_some_and(|(b, key)| b == bucket && key <= upper_bound_millis)
                })
                .cloned()
                .collect()
        })
    }

    async fn earliest_bucket(&self, index: SagaIndex) -> Result<Option<TimeBucket>, BackendError> {
        self.read_records(|records| {
            records
                .values()
                .filter_map(|record| record.index_entry(index).map(|(bucket, _)| bucket))
                .min()
        })
    }

    async fn scan_pending_commands(&self) -> Result<Vec<SagaRecord>, BackendError> {
        self.read_records(|records| {
            records
                .values()
                .filter(|record| record.has_pending_commands())
                .cloned()
                .collect()
        })
    }
}
