//! Catalog entities carried through the pipeline.
//!
//! Entities are copied, never translated: known fields are typed so the
//! pipeline can read them, everything else rides along in `extra` and is
//! written back out unchanged. Field names follow the catalog's wire format
//! (`PascalCase`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A catalog database definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Database {
    /// Database name, unique within a catalog.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Storage location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_uri: Option<String>,
    /// Key/value parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Fields the pipeline does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Database {
    /// Create a database definition with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Writable subset used when creating the database in a catalog.
    pub fn to_input(&self) -> DatabaseInput {
        DatabaseInput {
            name: self.name.clone(),
            description: self.description.clone(),
            location_uri: self.location_uri.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Input for creating a database.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseInput {
    /// Database name.
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Storage location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_uri: Option<String>,
    /// Key/value parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// A catalog table definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Table {
    /// Table name, unique within its database.
    pub name: String,
    /// Owning database.
    pub database_name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Owner principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Partition key columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_keys: Vec<Value>,
    /// Table type (EXTERNAL_TABLE, VIRTUAL_VIEW, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,
    /// Original view text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_original_text: Option<String>,
    /// Expanded view text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_expanded_text: Option<String>,
    /// Key/value parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Physical storage description, copied opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_descriptor: Option<Value>,
    /// Retention period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<i64>,
    /// Catalog-managed: creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<Value>,
    /// Catalog-managed: last update time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<Value>,
    /// Catalog-managed: last access time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_time: Option<Value>,
    /// Catalog-managed: owning catalog id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    /// Catalog-managed: version id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    /// Catalog-managed: creating principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Fields the pipeline does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Table {
    /// Create a table definition with only its identity.
    pub fn new(database_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database_name: database_name.into(),
            ..Default::default()
        }
    }

    /// Reference to this table.
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.database_name, &self.name)
    }

    /// Writable subset used for create/update. Catalog-managed metadata and
    /// the owning database name are dropped.
    pub fn to_input(&self) -> TableInput {
        TableInput {
            name: self.name.clone(),
            description: self.description.clone(),
            owner: self.owner.clone(),
            partition_keys: self.partition_keys.clone(),
            table_type: self.table_type.clone(),
            view_original_text: self.view_original_text.clone(),
            view_expanded_text: self.view_expanded_text.clone(),
            parameters: self.parameters.clone(),
            storage_descriptor: self.storage_descriptor.clone(),
            retention: self.retention,
        }
    }
}

/// Input for creating or updating a table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableInput {
    /// Table name.
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Owner principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Partition key columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partition_keys: Vec<Value>,
    /// Table type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_type: Option<String>,
    /// Original view text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_original_text: Option<String>,
    /// Expanded view text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_expanded_text: Option<String>,
    /// Key/value parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Physical storage description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_descriptor: Option<Value>,
    /// Retention period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<i64>,
}

/// A single partition of a table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Partition {
    /// Partition key values, in partition key order.
    pub values: Vec<String>,
    /// Owning database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Owning table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Physical storage description, copied opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_descriptor: Option<Value>,
    /// Key/value parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Fields the pipeline does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Partition {
    /// Create a partition with the given key values.
    pub fn with_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Writable subset used for batch creation.
    pub fn to_input(&self) -> PartitionInput {
        PartitionInput {
            values: self.values.clone(),
            storage_descriptor: self.storage_descriptor.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Input for creating a partition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartitionInput {
    /// Partition key values.
    pub values: Vec<String>,
    /// Physical storage description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_descriptor: Option<Value>,
    /// Key/value parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// A table together with its partitions: the unit the sizer measures and
/// the overflow object stores.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableUnit {
    /// All partitions of the table, in catalog pagination order.
    #[serde(rename = "PartitionList", default)]
    pub partitions: Vec<Partition>,
    /// The table definition.
    #[serde(rename = "Table")]
    pub table: Table,
}

impl TableUnit {
    /// Bundle a table with its partitions.
    pub fn new(table: Table, partitions: Vec<Partition>) -> Self {
        Self { partitions, table }
    }
}

/// Identity of a table, independent of any catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Database name.
    pub database: String,
    /// Table name.
    pub table: String,
}

impl TableRef {
    /// Create a table reference.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Composite ledger key: `table_name|database_name`.
    pub fn ledger_key(&self) -> String {
        format!("{}|{}", self.table, self.database)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Reference to a database or table across accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Catalog (account) id.
    pub catalog_id: String,
    /// Database name.
    pub database: String,
    /// Table name; `None` for a database.
    pub table: Option<String>,
}

impl EntityRef {
    /// Reference a database.
    pub fn database(catalog_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            database: database.into(),
            table: None,
        }
    }

    /// Reference a table.
    pub fn table(
        catalog_id: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            database: database.into(),
            table: Some(table.into()),
        }
    }

    /// Ledger identity: the database name, or `table|database` for a table.
    pub fn ledger_key(&self) -> String {
        match &self.table {
            Some(table) => format!("{}|{}", table, self.database),
            None => self.database.clone(),
        }
    }
}
