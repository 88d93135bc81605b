//! DynamoDB backend
//!
//! Records are stored as native DynamoDB maps so the secondary indexes can key on
//! `commitStampBucket`/`commitStamp` and `timeoutAtBucket`/`timeoutAt`. Reads are
//! strongly consistent; index queries are eventually consistent, as DynamoDB does
//! not offer anything else on a global secondary index.
//!
//! An index cannot list its partitions, so every put also lowers the per-index
//! floor held by the [`BUCKET_FLOOR_ID`] item. Bucket scans stop at that floor.
//! The floor item has neither index keys nor commands, so no scan returns it.

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::describe_table::DescribeTableError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, GlobalSecondaryIndex, KeySchemaElement, KeyType,
    Projection, ProjectionType, ProvisionedThroughput, ScalarAttributeType,
};
use aws_sdk_dynamodb::Client;
use aws_smithy_types::timeout::TimeoutConfig;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{PutCondition, SagaBackend};
use crate::config::{Throughput, DEFAULT_TABLE_NAME};
use crate::schema::{ATTR_COMMANDS, ATTR_ID, ATTR_VERSION, BUCKET_FLOOR_ID};
use crate::{
    BackendError, CommandId, SagaId, SagaIndex, SagaRecord, TableSpec, TableStatus, TimeBucket,
};

/// Environment variable overriding the service endpoint, e.g. for DynamoDB Local
pub const ENDPOINT_ENV: &str = "AWS_DYNAMODB_ENDPOINT";

type Item = HashMap<String, AttributeValue>;

/// DynamoDB connection settings
#[derive(Debug, Clone)]
pub struct DynamoDbConfig {
    /// Saga table name
    pub table_name: String,
    /// AWS region, SDK default if not set
    pub region: Option<String>,
    /// Endpoint override
    pub endpoint: Option<String>,
    /// Per-operation timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

impl Default for DynamoDbConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_TABLE_NAME.to_string(),
            region: None,
            endpoint: None,
            timeout_ms: None,
        }
    }
}

impl DynamoDbConfig {
    /// Settings for `table_name`, with the endpoint taken from [`ENDPOINT_ENV`] if set
    pub fn from_env(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            endpoint: std::env::var(ENDPOINT_ENV).ok().filter(|e| !e.is_empty()),
            ..Self::default()
        }
    }
}

/// Saga table stored in DynamoDB
#[derive(Clone)]
pub struct DynamoDbBackend {
    client: Client,
    table_name: Box<str>,
    /// Floors this process has already written, to skip redundant updates
    floors: Arc<Mutex<HashMap<SagaIndex, TimeBucket>>>,
}

impl std::fmt::Debug for DynamoDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbBackend")
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl DynamoDbBackend {
    /// Build a client from shared SDK settings plus the overrides in `config`
    pub fn new(sdk_config: &aws_config::SdkConfig, config: DynamoDbConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(region) = config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region));
        }
        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(timeout_ms) = config.timeout_ms {
            builder = builder.timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(Duration::from_millis(timeout_ms))
                    .build(),
            );
        }

        Self::from_client(Client::from_conf(builder.build()), config.table_name)
    }

    /// Load SDK settings from the environment and build a client
    pub async fn load(config: DynamoDbConfig) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(&sdk_config, config)
    }

    /// Wrap a pre-built client
    pub fn from_client(client: Client, table_name: impl Into<Box<str>>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            floors: Arc::default(),
        }
    }

    fn key(id: &str) -> Item {
        HashMap::from([(ATTR_ID.to_string(), AttributeValue::S(id.to_string()))])
    }

    fn known_floor(&self, index: SagaIndex) -> Result<Option<TimeBucket>, BackendError> {
        Ok(self
            .floors
            .lock()
            .map_err(BackendError::storage)?
            .get(&index)
            .copied())
    }

    /// Move the stored floor of `index` down to `bucket` if it is later
    async fn lower_floor(&self, index: SagaIndex, bucket: TimeBucket) -> Result<(), BackendError> {
        if self.known_floor(index)?.is_some_and(|floor| floor <= bucket) {
            return Ok(());
        }

        let result = self
            .client
            .update_item()
            .table_name(self.table_name.as_ref())
            .set_key(Some(Self::key(BUCKET_FLOOR_ID)))
            .update_expression("SET #floor = :bucket")
            .condition_expression("attribute_not_exists(#floor) OR #floor > :bucket")
            .expression_attribute_names("#floor", index.floor_attribute())
            .expression_attribute_values(":bucket", AttributeValue::S(bucket.label()))
            .send()
            .await;

        match result {
            // A failed condition means the stored floor is already at or below `bucket`
            Ok(_) => {}
            Err(e) if is_update_conditional_check_failed(&e) => {}
            Err(e) => {
                return Err(BackendError::storage(format!(
                    "DynamoDB UpdateItem of bucket floor failed: {e}"
                )))
            }
        }

        let mut floors = self.floors.lock().map_err(BackendError::storage)?;
        let floor = floors.entry(index).or_insert(bucket);
        *floor = (*floor).min(bucket);
        Ok(())
    }

    fn decode_item(item: &Item) -> Result<SagaRecord, BackendError> {
        SagaRecord::from_document(item_to_json(item)?)
    }

    fn decode_items(items: &[Item], into: &mut Vec<SagaRecord>) -> Result<(), BackendError> {
        for item in items {
            into.push(Self::decode_item(item)?);
        }
        Ok(())
    }
}

fn provisioned(throughput: Throughput) -> Result<ProvisionedThroughput, BackendError> {
    ProvisionedThroughput::builder()
        .read_capacity_units(throughput.read_capacity_units)
        .write_capacity_units(throughput.write_capacity_units)
        .build()
        .map_err(BackendError::storage)
}

fn key_element(attribute: &str, key_type: KeyType) -> Result<KeySchemaElement, BackendError> {
    KeySchemaElement::builder()
        .attribute_name(attribute)
        .key_type(key_type)
        .build()
        .map_err(BackendError::storage)
}

fn attribute(name: &str, kind: ScalarAttributeType) -> Result<AttributeDefinition, BackendError> {
    AttributeDefinition::builder()
        .attribute_name(name)
        .attribute_type(kind)
        .build()
        .map_err(BackendError::storage)
}

fn table_status(status: Option<&aws_sdk_dynamodb::types::TableStatus>) -> TableStatus {
    use aws_sdk_dynamodb::types::TableStatus as Remote;
    match status {
        Some(Remote::Active) => TableStatus::Active,
        Some(Remote::Creating) => TableStatus::Creating,
        Some(Remote::Updating) => TableStatus::Updating,
        Some(Remote::Deleting) => TableStatus::Deleting,
        Some(other) => TableStatus::Other(other.as_str().into()),
        None => TableStatus::Other("UNKNOWN".into()),
    }
}

fn is_resource_not_found(err: &SdkError<DescribeTableError>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => matches!(
            service_err.err(),
            DescribeTableError::ResourceNotFoundException(_)
        ),
        _ => false,
    }
}

fn is_put_conditional_check_failed(err: &SdkError<PutItemError>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => matches!(
            service_err.err(),
            PutItemError::ConditionalCheckFailedException(_)
        ),
        _ => false,
    }
}

fn is_update_conditional_check_failed(err: &SdkError<UpdateItemError>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => matches!(
            service_err.err(),
            UpdateItemError::ConditionalCheckFailedException(_)
        ),
        _ => false,
    }
}

#[async_trait]
impl SagaBackend for DynamoDbBackend {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn describe_table(&self) -> Result<Option<TableStatus>, BackendError> {
        match self
            .client
            .describe_table()
            .table_name(self.table_name.as_ref())
            .send()
            .await
        {
            Ok(response) => Ok(Some(table_status(
                response.table().and_then(|t| t.table_status()),
            ))),
            Err(e) if is_resource_not_found(&e) => Ok(None),
            Err(e) => Err(BackendError::storage(format!(
                "DynamoDB DescribeTable failed: {e}"
            ))),
        }
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<TableStatus, BackendError> {
        let mut request = self
            .client
            .create_table()
            .table_name(spec.name.as_ref())
            .key_schema(key_element(ATTR_ID, KeyType::Hash)?)
            .attribute_definitions(attribute(ATTR_ID, ScalarAttributeType::S)?)
            .provisioned_throughput(provisioned(spec.throughput)?);

        for index_spec in &spec.indexes {
            let index = index_spec.index;
            request = request
                .attribute_definitions(attribute(index.bucket_attribute(), ScalarAttributeType::S)?)
                .attribute_definitions(attribute(index.sort_attribute(), ScalarAttributeType::N)?)
                .global_secondary_indexes(
                    GlobalSecondaryIndex::builder()
                        .index_name(index.name())
                        .key_schema(key_element(index.bucket_attribute(), KeyType::Hash)?)
                        .key_schema(key_element(index.sort_attribute(), KeyType::Range)?)
                        .projection(
                            Projection::builder()
                                .projection_type(ProjectionType::All)
                                .build(),
                        )
                        .provisioned_throughput(provisioned(index_spec.throughput)?)
                        .build()
                        .map_err(BackendError::storage)?,
                );
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::storage(format!("DynamoDB CreateTable failed: {e}")))?;

        Ok(table_status(
            response.table_description().and_then(|t| t.table_status()),
        ))
    }

    async fn put(&self, record: SagaRecord, condition: PutCondition) -> Result<(), BackendError> {
        // Lowered before the write so a scan never sees a record below the floor
        for index in SagaIndex::ALL {
            if let Some((bucket, _)) = record.index_entry(index) {
                self.lower_floor(index, bucket).await?;
            }
        }

        let item = json_to_item(&record.to_document()?);
        let mut request = self
            .client
            .put_item()
            .table_name(self.table_name.as_ref())
            .set_item(Some(item));

        request = match condition {
            PutCondition::NotExists => request
                .condition_expression("attribute_not_exists(#id)")
                .expression_attribute_names("#id", ATTR_ID),
            PutCondition::VersionEquals(expected) => request
                .condition_expression("#version = :expected")
                .expression_attribute_names("#version", ATTR_VERSION)
                .expression_attribute_values(":expected", AttributeValue::S(expected.to_string())),
        };

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if is_put_conditional_check_failed(&e) => Err(BackendError::ConditionFailed),
            Err(e) => Err(BackendError::storage(format!("DynamoDB PutItem failed: {e}"))),
        }
    }

    async fn get(&self, id: &SagaId) -> Result<Option<SagaRecord>, BackendError> {
        let response = self
            .client
            .get_item()
            .table_name(self.table_name.as_ref())
            .set_key(Some(Self::key(id.as_str())))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| BackendError::storage(format!("DynamoDB GetItem failed: {e}")))?;

        response.item().map(Self::decode_item).transpose()
    }

    async fn delete(&self, id: &SagaId) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(self.table_name.as_ref())
            .set_key(Some(Self::key(id.as_str())))
            .send()
            .await
            .map_err(|e| BackendError::storage(format!("DynamoDB DeleteItem failed: {e}")))?;
        Ok(())
    }

    async fn remove_command(
        &self,
        saga_id: &SagaId,
        command_id: &CommandId,
    ) -> Result<(), BackendError> {
        let result = self
            .client
            .update_item()
            .table_name(self.table_name.as_ref())
            .set_key(Some(Self::key(saga_id.as_str())))
            .update_expression("REMOVE #commands.#cmd")
            .condition_expression("attribute_exists(#commands.#cmd)")
            .expression_attribute_names("#commands", ATTR_COMMANDS)
            .expression_attribute_names("#cmd", command_id.as_str())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_update_conditional_check_failed(&e) => Err(BackendError::ConditionFailed),
            Err(e) => Err(BackendError::storage(format!(
                "DynamoDB UpdateItem failed: {e}"
            ))),
        }
    }

    async fn query_index(
        &self,
        index: SagaIndex,
        bucket: TimeBucket,
        upper_bound_millis: i64,
    ) -> Result<Vec<SagaRecord>, BackendError> {
        let mut records = Vec::new();
        let mut last_evaluated_key = None;

        loop {
            let response = self
                .client
                .query()
                .table_name(self.table_name.as_ref())
                .index_name(index.name())
                .key_condition_expression("#bucket = :bucket AND #ts <= :upper")
                .expression_attribute_names("#bucket", index.bucket_attribute())
                .expression_attribute_names("#ts", index.sort_attribute())
                .expression_attribute_values(":bucket", AttributeValue::S(bucket.label()))
                .expression_attribute_values(
                    ":upper",
                    AttributeValue::N(upper_bound_millis.to_string()),
                )
                .set_exclusive_start_key(last_evaluated_key.take())
                .send()
                .await
                .map_err(|e| BackendError::storage(format!("DynamoDB Query failed: {e}")))?;

            Self::decode_items(response.items(), &mut records)?;

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => last_evaluated_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(records)
    }

    async fn earliest_bucket(&self, index: SagaIndex) -> Result<Option<TimeBucket>, BackendError> {
        let response = self
            .client
            .get_item()
            .table_name(self.table_name.as_ref())
            .set_key(Some(Self::key(BUCKET_FLOOR_ID)))
            .projection_expression("#floor")
            .expression_attribute_names("#floor", index.floor_attribute())
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| BackendError::storage(format!("DynamoDB GetItem failed: {e}")))?;

        response
            .item()
            .and_then(|item| item.get(index.floor_attribute()))
            .map(floor_bucket)
            .transpose()
    }

    async fn scan_pending_commands(&self) -> Result<Vec<SagaRecord>, BackendError> {
        let mut records = Vec::new();
        let mut last_evaluated_key = None;

        loop {
            let response = self
                .client
                .scan()
                .table_name(self.table_name.as_ref())
                .filter_expression("size(#commands) > :zero")
                .expression_attribute_names("#commands", ATTR_COMMANDS)
                .expression_attribute_values(":zero", AttributeValue::N("0".to_string()))
                .consistent_read(true)
                .set_exclusive_start_key(last_evaluated_key.take())
                .send()
                .await
                .map_err(|e| BackendError::storage(format!("DynamoDB Scan failed: {e}")))?;

            Self::decode_items(response.items(), &mut records)?;

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => last_evaluated_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(records)
    }
}

fn floor_bucket(attr: &AttributeValue) -> Result<TimeBucket, BackendError> {
    attr.as_s()
        .ok()
        .and_then(|label| TimeBucket::parse(label))
        .ok_or_else(|| BackendError::codec(format!("malformed bucket floor: {attr:?}")))
}

fn item_to_json(item: &Item) -> Result<Map<String, Value>, BackendError> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), attr_to_json(v)?)))
        .collect()
}

fn attr_to_json(attr: &AttributeValue) -> Result<Value, BackendError> {
    Ok(match attr {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => Value::Number(parse_number(n)?),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(list) => {
            Value::Array(list.iter().map(attr_to_json).collect::<Result<_, _>>()?)
        }
        AttributeValue::M(map) => Value::Object(item_to_json(map)?),
        other => {
            return Err(BackendError::codec(format!(
                "unsupported DynamoDB attribute type: {other:?}"
            )))
        }
    })
}

fn parse_number(n: &str) -> Result<Number, BackendError> {
    if let Ok(i) = n.parse::<i64>() {
        return Ok(i.into());
    }
    if let Ok(u) = n.parse::<u64>() {
        return Ok(u.into());
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| BackendError::codec(format!("unrepresentable number: {n}")))
}

fn json_to_item(map: &Map<String, Value>) -> Item {
    map.iter()
        .map(|(k, v)| (k.clone(), json_to_attr(v)))
        .collect()
}

fn json_to_attr(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attr).collect()),
        Value::Object(obj) => AttributeValue::M(
            obj.iter()
                .map(|(k, v)| (k.clone(), json_to_attr(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::{NewCommand, Saga, SagaVersion};
    use chrono::{TimeZone, Utc};
    use indexmap::IndexMap;
    use serde_json::json;

    #[test]
    fn test_record_maps_to_native_attributes() {
        let commit = Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap();
        let saga = Saga::new("order-1")
            .with_field("step", "reserve")
            .with_field("lines", json!([{"sku": "A", "qty": 2}]))
            .with_timeout(Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap());
        let record = encode(
            &saga,
            commit,
            SagaVersion::new("v1"),
            IndexMap::new(),
            vec![NewCommand::new("c1", json!({"to": "billing"}))],
        )
        .unwrap();

        let item = json_to_item(&record.to_document().unwrap());
        assert_eq!(item[ATTR_ID], AttributeValue::S("order-1".into()));
        assert_eq!(
            item["commitStamp"],
            AttributeValue::N(commit.timestamp_millis().to_string())
        );
        assert_eq!(item["commitStampBucket"], AttributeValue::S("202610".into()));
        assert_eq!(item["timeoutAtBucket"], AttributeValue::S("202611".into()));
        assert!(matches!(&item[ATTR_COMMANDS], AttributeValue::M(m) if m.contains_key("c1")));

        let back = DynamoDbBackend::decode_item(&item).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_numbers_keep_their_kind() {
        assert_eq!(
            attr_to_json(&AttributeValue::N("-42".into())).unwrap(),
            json!(-42)
        );
        assert_eq!(
            attr_to_json(&AttributeValue::N("18446744073709551615".into())).unwrap(),
            json!(u64::MAX)
        );
        assert_eq!(
            attr_to_json(&AttributeValue::N("1.5".into())).unwrap(),
            json!(1.5)
        );
        assert!(attr_to_json(&AttributeValue::N("nope".into())).is_err());
    }

    #[test]
    fn test_set_attributes_are_rejected() {
        let attr = AttributeValue::Ss(vec!["a".into()]);
        assert!(matches!(attr_to_json(&attr), Err(BackendError::Codec(_))));
    }

    #[test]
    fn test_table_status_mapping() {
        use aws_sdk_dynamodb::types::TableStatus as Remote;
        assert_eq!(table_status(Some(&Remote::Active)), TableStatus::Active);
        assert_eq!(table_status(Some(&Remote::Creating)), TableStatus::Creating);
        assert!(!table_status(None).is_active());
    }

    #[test]
    fn test_floor_bucket_parsing() {
        assert_eq!(
            floor_bucket(&AttributeValue::S("202401".into())).unwrap(),
            TimeBucket::new(2024, 1).unwrap()
        );
        assert!(floor_bucket(&AttributeValue::S("2024-01".into())).is_err());
        assert!(floor_bucket(&AttributeValue::N("202401".into())).is_err());
    }

    #[test]
    fn test_config_defaults_to_sagas_table() {
        let config = DynamoDbConfig::default();
        assert_eq!(config.table_name, "sagas");
        assert!(config.endpoint.is_none());
    }
}
