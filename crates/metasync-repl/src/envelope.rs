//! Wire envelopes: message kinds, correlation attributes and payload shapes.
//!
//! Attribute names and payload field names are shared with deployed
//! producers and consumers on both sides of the account boundary and must
//! not change. Inbound messages are decoded exactly once, here, into
//! [`InboundEnvelope`]; pipeline code never looks at raw attribute strings.

use crate::error::{ReplError, Result};
use crate::messaging::Message;
use crate::model::{Database, Table, TableRef, TableUnit};
use crate::object_store::ObjectPointer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bus attribute: message kind.
pub const ATTR_MESSAGE_TYPE: &str = "message_type";
/// Bus attribute: export batch id.
pub const ATTR_EXPORT_BATCH_ID: &str = "export_batch_id";
/// Bus attribute: source catalog id.
pub const ATTR_SOURCE_CATALOG_ID: &str = "source_catalog_id";
/// Bus attribute: export batch id on `table_list` messages.
pub const ATTR_TABLE_LIST_BATCH_ID: &str = "msg_attr_export_batch_id";
/// Bus attribute: export run id on `table_list` messages.
pub const ATTR_EXPORT_RUN_ID: &str = "export_run_id";
/// Bus attribute: bucket of a large-table object.
pub const ATTR_BUCKET_NAME: &str = "bucket_name";
/// Bus attribute: region of the exporting account.
pub const ATTR_REGION_NAME: &str = "region_name";

/// Queue attribute: export batch id.
pub const QUEUE_ATTR_EXPORT_BATCH_ID: &str = "ExportBatchId";
/// Queue attribute: source catalog id.
pub const QUEUE_ATTR_SOURCE_CATALOG_ID: &str = "SourceGlueDataCatalogId";
/// Queue attribute: schema type tag.
pub const QUEUE_ATTR_SCHEMA_TYPE: &str = "SchemaType";

/// The closed set of bus message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A database definition.
    Database,
    /// A table unit or an overflow pointer.
    Table,
    /// A chunk of table definitions for the export stage.
    TableList,
    /// A deferred table whose partitions sit in an object.
    LargeTable,
}

impl MessageKind {
    /// Wire value of the `message_type` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Database => "database",
            MessageKind::Table => "table",
            MessageKind::TableList => "table_list",
            MessageKind::LargeTable => "largeTable",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "database" => Ok(MessageKind::Database),
            "table" => Ok(MessageKind::Table),
            "table_list" => Ok(MessageKind::TableList),
            "largetable" => Ok(MessageKind::LargeTable),
            other => Err(ReplError::parse(format!("unknown message type: {}", other))),
        }
    }
}

/// The `SchemaType` tag on queue messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    /// A deferred table.
    LargeTable,
    /// A table unit or pointer.
    Table,
    /// A database definition.
    Database,
}

impl SchemaType {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::LargeTable => "largeTable",
            SchemaType::Table => "Table",
            SchemaType::Database => "Database",
        }
    }

    /// Parse a tag. Anything that is not a table or large table is a database,
    /// matching how dead-lettered messages have always been replayed.
    pub fn parse_lenient(s: &str) -> Self {
        if s.eq_ignore_ascii_case("largetable") {
            SchemaType::LargeTable
        } else if s.eq_ignore_ascii_case("table") {
            SchemaType::Table
        } else {
            SchemaType::Database
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation carried unchanged on every message derived from one export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Correlation {
    /// Batch id of the export sweep.
    pub export_batch_id: String,
    /// Catalog the entity was exported from.
    pub source_catalog_id: String,
}

impl Correlation {
    /// Create a correlation tag.
    pub fn new(export_batch_id: impl Into<String>, source_catalog_id: impl Into<String>) -> Self {
        Self {
            export_batch_id: export_batch_id.into(),
            source_catalog_id: source_catalog_id.into(),
        }
    }

    /// Read from bus attributes (exact names).
    pub fn from_bus(message: &Message) -> Result<Self> {
        Ok(Self::new(
            required(message.attribute(ATTR_EXPORT_BATCH_ID), ATTR_EXPORT_BATCH_ID)?,
            required(message.attribute(ATTR_SOURCE_CATALOG_ID), ATTR_SOURCE_CATALOG_ID)?,
        ))
    }

    /// Read from queue attributes (case-insensitive names).
    pub fn from_queue(message: &Message) -> Result<Self> {
        Ok(Self::new(
            required(
                message.attribute_ignore_case(QUEUE_ATTR_EXPORT_BATCH_ID),
                QUEUE_ATTR_EXPORT_BATCH_ID,
            )?,
            required(
                message.attribute_ignore_case(QUEUE_ATTR_SOURCE_CATALOG_ID),
                QUEUE_ATTR_SOURCE_CATALOG_ID,
            )?,
        ))
    }

    fn queue_message(&self, body: impl Into<String>, schema_type: SchemaType) -> Message {
        Message::new(body)
            .with_attribute(QUEUE_ATTR_EXPORT_BATCH_ID, &self.export_batch_id)
            .with_attribute(QUEUE_ATTR_SOURCE_CATALOG_ID, &self.source_catalog_id)
            .with_attribute(QUEUE_ATTR_SCHEMA_TYPE, schema_type.as_str())
    }

    fn bus_message(&self, body: impl Into<String>, kind: MessageKind) -> Message {
        Message::new(body)
            .with_attribute(ATTR_SOURCE_CATALOG_ID, &self.source_catalog_id)
            .with_attribute(ATTR_MESSAGE_TYPE, kind.as_str())
            .with_attribute(ATTR_EXPORT_BATCH_ID, &self.export_batch_id)
    }
}

fn required(value: Option<&str>, name: &str) -> Result<String> {
    value
        .map(str::to_string)
        .ok_or_else(|| ReplError::parse(format!("missing attribute {}", name)))
}

static LAST_RUN_ID: AtomicU64 = AtomicU64::new(0);

/// One export sweep or import invocation.
///
/// Run ids are epoch milliseconds, bumped when needed so that ids handed
/// out by one process strictly increase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRun {
    /// Timestamp-derived run id.
    pub run_id: u64,
    /// Batch id correlating all messages of the logical export.
    pub batch_id: String,
}

impl ReplicationRun {
    /// Start a new sweep; the batch id is the run id.
    pub fn start() -> Self {
        let run_id = next_run_id();
        Self {
            run_id,
            batch_id: run_id.to_string(),
        }
    }

    /// A new run continuing an existing batch.
    pub fn within(batch_id: impl Into<String>) -> Self {
        Self {
            run_id: next_run_id(),
            batch_id: batch_id.into(),
        }
    }

    /// A run with explicit ids, as carried on `table_list` messages.
    pub fn resume(run_id: u64, batch_id: impl Into<String>) -> Self {
        Self {
            run_id,
            batch_id: batch_id.into(),
        }
    }

    /// Correlation tag for messages of this run.
    pub fn correlation(&self, source_catalog_id: &str) -> Correlation {
        Correlation::new(&self.batch_id, source_catalog_id)
    }
}

fn next_run_id() -> u64 {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut last = LAST_RUN_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_RUN_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// Body of a large-table queue message on the source side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LargeTableRequest {
    /// The table definition, without partitions.
    pub table: Table,
    /// Whether the exporter flagged the table as large.
    pub large_table: bool,
    /// Partition count observed at export time.
    pub number_of_partitions: usize,
    /// Source catalog id.
    pub catalog_id: String,
}

/// Body of a `largeTable` bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LargeTableEnvelope {
    /// Source catalog id.
    #[serde(default)]
    pub catalog_id: String,
    /// Large-table flag, always set by producers.
    #[serde(default)]
    pub large_table: bool,
    /// Number of partitions written to the object.
    #[serde(default)]
    pub number_of_partitions: usize,
    /// The table definition.
    pub table: Table,
    /// Key of the newline-delimited partitions object.
    pub s3_object_key: String,
    /// Bucket of the partitions object.
    pub s3_bucket_name: String,
}

impl LargeTableEnvelope {
    /// Location of the partitions object.
    pub fn pointer(&self) -> ObjectPointer {
        ObjectPointer::new(&self.s3_bucket_name, &self.s3_object_key)
    }
}

/// Body of a `table` message: an inline unit or a pointer to an overflow object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TablePayload {
    /// Table and partitions inline.
    Unit(TableUnit),
    /// Table and partitions stored as one object.
    Pointer(ObjectPointer),
}

impl TablePayload {
    /// Decode a `table` body. Pointer bodies from older exporters use
    /// single-quoted keys and are accepted too.
    pub fn decode(body: &str) -> Result<Self> {
        match serde_json::from_str(body) {
            Ok(payload) => Ok(payload),
            Err(e) => {
                let trimmed = body.trim_start();
                if trimmed.starts_with("{'") {
                    if let Ok(pointer) = serde_json::from_str::<ObjectPointer>(&body.replace('\'', "\"")) {
                        return Ok(TablePayload::Pointer(pointer));
                    }
                }
                Err(ReplError::parse(format!("table body: {}", e)))
            }
        }
    }
}

/// A bus message decoded at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    /// A database definition.
    Database {
        /// Correlation attributes.
        correlation: Correlation,
        /// The database.
        database: Database,
        /// Original body, forwarded verbatim on escalation.
        raw: String,
    },
    /// A table unit or overflow pointer.
    Table {
        /// Correlation attributes.
        correlation: Correlation,
        /// The decoded payload.
        payload: TablePayload,
        /// Original body.
        raw: String,
    },
    /// A chunk of tables for the export stage.
    TableList {
        /// Run the chunk belongs to.
        run: ReplicationRun,
        /// Source catalog id.
        source_catalog_id: String,
        /// Tables of the chunk, in catalog order.
        tables: Vec<Table>,
    },
    /// A deferred table ready for import.
    LargeTable {
        /// Correlation attributes.
        correlation: Correlation,
        /// The decoded envelope.
        envelope: LargeTableEnvelope,
        /// Original body.
        raw: String,
    },
}

impl InboundEnvelope {
    /// Decode a bus message. Missing attributes, unknown kinds and
    /// malformed bodies are [`ReplError::Parse`].
    pub fn decode(message: &Message) -> Result<Self> {
        let kind: MessageKind = required(message.attribute(ATTR_MESSAGE_TYPE), ATTR_MESSAGE_TYPE)?.parse()?;
        let raw = message.body.clone();

        match kind {
            MessageKind::Database => {
                let database = serde_json::from_str(&raw)
                    .map_err(|e| ReplError::parse(format!("database body: {}", e)))?;
                Ok(InboundEnvelope::Database {
                    correlation: Correlation::from_bus(message)?,
                    database,
                    raw,
                })
            }
            MessageKind::Table => Ok(InboundEnvelope::Table {
                correlation: Correlation::from_bus(message)?,
                payload: TablePayload::decode(&raw)?,
                raw,
            }),
            MessageKind::TableList => {
                let batch_id = required(message.attribute(ATTR_TABLE_LIST_BATCH_ID), ATTR_TABLE_LIST_BATCH_ID)?;
                let run_id = required(message.attribute(ATTR_EXPORT_RUN_ID), ATTR_EXPORT_RUN_ID)?
                    .parse::<u64>()
                    .map_err(|e| ReplError::parse(format!("export_run_id: {}", e)))?;
                let tables = serde_json::from_str(&raw)
                    .map_err(|e| ReplError::parse(format!("table list body: {}", e)))?;
                Ok(InboundEnvelope::TableList {
                    run: ReplicationRun::resume(run_id, batch_id),
                    source_catalog_id: required(message.attribute(ATTR_SOURCE_CATALOG_ID), ATTR_SOURCE_CATALOG_ID)?,
                    tables,
                })
            }
            MessageKind::LargeTable => {
                let envelope = serde_json::from_str(&raw)
                    .map_err(|e| ReplError::parse(format!("large table body: {}", e)))?;
                Ok(InboundEnvelope::LargeTable {
                    correlation: Correlation::from_bus(message)?,
                    envelope,
                    raw,
                })
            }
        }
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundEnvelope::Database { .. } => MessageKind::Database,
            InboundEnvelope::Table { .. } => MessageKind::Table,
            InboundEnvelope::TableList { .. } => MessageKind::TableList,
            InboundEnvelope::LargeTable { .. } => MessageKind::LargeTable,
        }
    }
}

/// Peek at the kind of a bus message without decoding its body.
pub fn peek_kind(message: &Message) -> Option<MessageKind> {
    message.attribute(ATTR_MESSAGE_TYPE)?.parse().ok()
}

/// `database` message carrying a database definition.
pub fn database_message(database: &Database, correlation: &Correlation) -> Result<Message> {
    let body = serde_json::to_string(database)?;
    Ok(correlation.bus_message(body, MessageKind::Database))
}

/// `table` message carrying an already-encoded unit.
pub fn table_message(encoded_unit: &[u8], correlation: &Correlation) -> Message {
    correlation.bus_message(String::from_utf8_lossy(encoded_unit), MessageKind::Table)
}

/// `table` message carrying an overflow pointer.
pub fn pointer_message(pointer: &ObjectPointer, correlation: &Correlation, region: &str) -> Result<Message> {
    let body = serde_json::to_string(pointer)?;
    Ok(correlation
        .bus_message(body, MessageKind::Table)
        .with_attribute(ATTR_BUCKET_NAME, &pointer.bucket_name)
        .with_attribute(ATTR_REGION_NAME, region))
}

/// `table_list` message for one chunk of tables.
pub fn table_list_message(tables: &[Table], run: &ReplicationRun, source_catalog_id: &str) -> Result<Message> {
    let body = serde_json::to_string(tables)?;
    Ok(Message::new(body)
        .with_attribute(ATTR_SOURCE_CATALOG_ID, source_catalog_id)
        .with_attribute(ATTR_MESSAGE_TYPE, MessageKind::TableList.as_str())
        .with_attribute(ATTR_TABLE_LIST_BATCH_ID, &run.batch_id)
        .with_attribute(ATTR_EXPORT_RUN_ID, run.run_id.to_string()))
}

/// `largeTable` bus message.
pub fn large_table_message(
    envelope: &LargeTableEnvelope,
    correlation: &Correlation,
    region: &str,
) -> Result<Message> {
    let body = serde_json::to_string(envelope)?;
    Ok(correlation
        .bus_message(body, MessageKind::LargeTable)
        .with_attribute(ATTR_BUCKET_NAME, &envelope.s3_bucket_name)
        .with_attribute(ATTR_REGION_NAME, region))
}

/// Source-side large-table queue message.
pub fn large_table_request_message(request: &LargeTableRequest, correlation: &Correlation) -> Result<Message> {
    let body = serde_json::to_string(request)?;
    Ok(correlation.queue_message(body, SchemaType::LargeTable))
}

/// Queue message carrying a body forwarded verbatim, for the import
/// large-table queue and the dead-letter queue.
pub fn forward_message(raw: &str, correlation: &Correlation, schema_type: SchemaType) -> Message {
    correlation.queue_message(raw, schema_type)
}

/// Decoded queue record: correlation, schema tag and raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    /// Correlation attributes.
    pub correlation: Correlation,
    /// Schema tag; missing tags read as [`SchemaType::Database`].
    pub schema_type: SchemaType,
    /// Message body.
    pub body: String,
}

impl QueueRecord {
    /// Decode a queue message. Attribute names match case-insensitively.
    pub fn decode(message: &Message) -> Result<Self> {
        Ok(Self {
            correlation: Correlation::from_queue(message)?,
            schema_type: SchemaType::parse_lenient(message.attribute_ignore_case(QUEUE_ATTR_SCHEMA_TYPE).unwrap_or("")),
            body: message.body.clone(),
        })
    }
}

impl LargeTableRequest {
    /// Reference to the requested table.
    pub fn table_ref(&self) -> TableRef {
        self.table.table_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Partition;

    fn corr() -> Correlation {
        Correlation::new("1700000000000", "111122223333")
    }

    #[test]
    fn test_message_kind_wire_values() {
        assert_eq!(MessageKind::LargeTable.as_str(), "largeTable");
        assert_eq!("LARGETABLE".parse::<MessageKind>().unwrap(), MessageKind::LargeTable);
        assert_eq!("Database".parse::<MessageKind>().unwrap(), MessageKind::Database);
        assert!("partition".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_schema_type_lenient() {
        assert_eq!(SchemaType::parse_lenient("Table"), SchemaType::Table);
        assert_eq!(SchemaType::parse_lenient("largeTable"), SchemaType::LargeTable);
        assert_eq!(SchemaType::parse_lenient(""), SchemaType::Database);
        assert_eq!(SchemaType::Database.as_str(), "Database");
    }

    #[test]
    fn test_run_ids_strictly_increase() {
        let a = ReplicationRun::start();
        let b = ReplicationRun::start();
        let c = ReplicationRun::within(&a.batch_id);
        assert!(b.run_id > a.run_id);
        assert!(c.run_id > b.run_id);
        assert_eq!(a.batch_id, a.run_id.to_string());
        assert_eq!(c.batch_id, a.batch_id);
    }

    #[test]
    fn test_decode_table_unit_and_pointer() {
        let unit = TableUnit::new(Table::new("sales", "orders"), vec![Partition::with_values(["1"])]);
        let body = serde_json::to_vec(&unit).unwrap();
        let msg = table_message(&body, &corr());
        match InboundEnvelope::decode(&msg).unwrap() {
            InboundEnvelope::Table { payload, correlation, .. } => {
                assert_eq!(payload, TablePayload::Unit(unit));
                assert_eq!(correlation, corr());
            }
            other => panic!("unexpected {:?}", other),
        }

        let pointer = ObjectPointer::new("bucket", "2024-01-01_1_111_sales_orders.txt");
        let msg = pointer_message(&pointer, &corr(), "us-east-1").unwrap();
        assert_eq!(msg.attribute(ATTR_BUCKET_NAME), Some("bucket"));
        match InboundEnvelope::decode(&msg).unwrap() {
            InboundEnvelope::Table { payload, .. } => assert_eq!(payload, TablePayload::Pointer(pointer)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_legacy_single_quoted_pointer() {
        let payload = TablePayload::decode("{'bucket_name': 'b', 'object_key': 'k.txt'}").unwrap();
        assert_eq!(payload, TablePayload::Pointer(ObjectPointer::new("b", "k.txt")));
        assert!(TablePayload::decode("{'nope'").is_err());
    }

    #[test]
    fn test_table_list_attributes() {
        let run = ReplicationRun::resume(42, "batch-7");
        let msg = table_list_message(&[Table::new("sales", "a")], &run, "111").unwrap();
        assert_eq!(msg.attribute(ATTR_MESSAGE_TYPE), Some("table_list"));
        assert_eq!(msg.attribute(ATTR_TABLE_LIST_BATCH_ID), Some("batch-7"));
        assert_eq!(msg.attribute(ATTR_EXPORT_RUN_ID), Some("42"));

        match InboundEnvelope::decode(&msg).unwrap() {
            InboundEnvelope::TableList { run: decoded, tables, .. } => {
                assert_eq!(decoded, run);
                assert_eq!(tables.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_attributes_are_parse_errors() {
        let msg = Message::new("{}").with_attribute(ATTR_MESSAGE_TYPE, "database");
        assert!(matches!(InboundEnvelope::decode(&msg), Err(ReplError::Parse { .. })));

        let msg = Message::new("{\"Name\": \"sales\"}");
        assert!(matches!(InboundEnvelope::decode(&msg), Err(ReplError::Parse { .. })));
        assert_eq!(peek_kind(&msg), None);
    }

    #[test]
    fn test_large_table_wire_shapes() {
        let request = LargeTableRequest {
            table: Table::new("sales", "events"),
            large_table: true,
            number_of_partitions: 500,
            catalog_id: "111".into(),
        };
        let msg = large_table_request_message(&request, &corr()).unwrap();
        let body: serde_json::Value = serde_json::from_str(&msg.body).unwrap();
        assert_eq!(body["LargeTable"], true);
        assert_eq!(body["NumberOfPartitions"], 500);
        assert_eq!(msg.attribute(QUEUE_ATTR_SCHEMA_TYPE), Some("largeTable"));

        let envelope = LargeTableEnvelope {
            catalog_id: "111".into(),
            large_table: true,
            number_of_partitions: 500,
            table: Table::new("sales", "events"),
            s3_object_key: "k.txt".into(),
            s3_bucket_name: "b".into(),
        };
        let msg = large_table_message(&envelope, &corr(), "eu-west-1").unwrap();
        let body: serde_json::Value = serde_json::from_str(&msg.body).unwrap();
        assert_eq!(body["s3_object_key"], "k.txt");
        assert_eq!(body["number_of_partitions"], 500);
        assert_eq!(msg.attribute(ATTR_REGION_NAME), Some("eu-west-1"));
        assert_eq!(envelope.pointer(), ObjectPointer::new("b", "k.txt"));
    }

    #[test]
    fn test_queue_record_case_insensitive() {
        let msg = Message::new("{}")
            .with_attribute("exportbatchid", "b-1")
            .with_attribute("SOURCEGLUEDATACATALOGID", "111")
            .with_attribute("schematype", "table");
        let record = QueueRecord::decode(&msg).unwrap();
        assert_eq!(record.correlation, Correlation::new("b-1", "111"));
        assert_eq!(record.schema_type, SchemaType::Table);

        let forwarded = forward_message("{}", &record.correlation, SchemaType::Table);
        assert_eq!(forwarded.attribute(QUEUE_ATTR_EXPORT_BATCH_ID), Some("b-1"));
        assert_eq!(forwarded.attribute(QUEUE_ATTR_SCHEMA_TYPE), Some("Table"));
    }
}
