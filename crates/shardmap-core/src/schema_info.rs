//! Schema info documents
//!
//! A schema info names the reference (replicated) and sharded tables of a
//! shard map's databases. Documents are stored as XML in the global store:
//!
//! ```xml
//! <Schema>
//!   <ReferenceTableSet>
//!     <ReferenceTableInfo><SchemaName>dbo</SchemaName><TableName>regions</TableName></ReferenceTableInfo>
//!   </ReferenceTableSet>
//!   <ShardedTableSet>
//!     <ShardedTableInfo><SchemaName>dbo</SchemaName><TableName>orders</TableName><KeyColumnName>customer_id</KeyColumnName></ShardedTableInfo>
//!   </ShardedTableSet>
//! </Schema>
//! ```

use crate::client::StoreClient;
use crate::executor::global_min_version;
use serde::{Deserialize, Serialize};
use shardmap_common::{Error, ErrorCode, Result};
use shardmap_store::{OperationKind, StoreRequest};
use tracing::debug;

const MAX_SCHEMA_INFO_NAME_LENGTH: usize = 128;

/// A table replicated to every shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTableInfo {
    #[serde(rename = "SchemaName")]
    pub schema_name: String,
    #[serde(rename = "TableName")]
    pub table_name: String,
}

impl ReferenceTableInfo {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>) -> Result<Self> {
        let info = Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        };
        require_table_name(&info.table_name)?;
        Ok(info)
    }
}

/// A table partitioned by the shard key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedTableInfo {
    #[serde(rename = "SchemaName")]
    pub schema_name: String,
    #[serde(rename = "TableName")]
    pub table_name: String,
    #[serde(rename = "KeyColumnName")]
    pub key_column_name: String,
}

impl ShardedTableInfo {
    pub fn new(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        key_column_name: impl Into<String>,
    ) -> Result<Self> {
        let info = Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            key_column_name: key_column_name.into(),
        };
        require_table_name(&info.table_name)?;
        if info.key_column_name.is_empty() {
            return Err(Error::invalid_argument(format!(
                "sharded table {} needs a key column",
                info.table_name
            )));
        }
        Ok(info)
    }
}

fn require_table_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("table name must not be empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReferenceTableSet {
    #[serde(rename = "ReferenceTableInfo", default)]
    tables: Vec<ReferenceTableInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ShardedTableSet {
    #[serde(rename = "ShardedTableInfo", default)]
    tables: Vec<ShardedTableInfo>,
}

/// Reference and sharded tables of a shard map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "Schema")]
pub struct SchemaInfo {
    #[serde(rename = "ReferenceTableSet", default)]
    reference: ReferenceTableSet,
    #[serde(rename = "ShardedTableSet", default)]
    sharded: ShardedTableSet,
}

impl SchemaInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reference_tables(&self) -> &[ReferenceTableInfo] {
        &self.reference.tables
    }

    #[must_use]
    pub fn sharded_tables(&self) -> &[ShardedTableInfo] {
        &self.sharded.tables
    }

    /// Whether a table is already listed in either set
    fn contains_table(&self, schema_name: &str, table_name: &str) -> bool {
        let same = |s: &str, t: &str| {
            s.eq_ignore_ascii_case(schema_name) && t.eq_ignore_ascii_case(table_name)
        };
        self.reference
            .tables
            .iter()
            .any(|t| same(&t.schema_name, &t.table_name))
            || self
                .sharded
                .tables
                .iter()
                .any(|t| same(&t.schema_name, &t.table_name))
    }

    pub fn add_reference_table(&mut self, info: ReferenceTableInfo) -> Result<()> {
        if self.contains_table(&info.schema_name, &info.table_name) {
            return Err(Error::invalid_argument(format!(
                "table {}.{} is already part of the schema info",
                info.schema_name, info.table_name
            )));
        }
        self.reference.tables.push(info);
        Ok(())
    }

    pub fn add_sharded_table(&mut self, info: ShardedTableInfo) -> Result<()> {
        if self.contains_table(&info.schema_name, &info.table_name) {
            return Err(Error::invalid_argument(format!(
                "table {}.{} is already part of the schema info",
                info.schema_name, info.table_name
            )));
        }
        self.sharded.tables.push(info);
        Ok(())
    }

    /// Remove a reference table; returns whether it was present
    pub fn remove_reference_table(&mut self, info: &ReferenceTableInfo) -> bool {
        let before = self.reference.tables.len();
        self.reference.tables.retain(|t| t != info);
        self.reference.tables.len() != before
    }

    /// Remove a sharded table; returns whether it was present
    pub fn remove_sharded_table(&mut self, info: &ShardedTableInfo) -> bool {
        let before = self.sharded.tables.len();
        self.sharded.tables.retain(|t| t != info);
        self.sharded.tables.len() != before
    }

    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self)
            .map_err(|e| Error::serialization(format!("failed to serialize schema info: {e}")))
    }

    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml)
            .map_err(|e| Error::serialization(format!("failed to parse schema info: {e}")))
    }
}

/// Named schema info documents in the global store
pub struct SchemaInfoCollection<'a> {
    client: &'a StoreClient,
}

impl<'a> SchemaInfoCollection<'a> {
    pub(crate) const fn new(client: &'a StoreClient) -> Self {
        Self { client }
    }

    pub fn add(&self, name: &str, info: &SchemaInfo) -> Result<()> {
        validate_name(name)?;
        self.client.global(
            "add schema info",
            global_min_version(OperationKind::AddSchemaInfo),
            StoreRequest::AddSchemaInfo {
                name: name.to_string(),
                xml: info.to_xml()?,
            },
        )?;
        debug!(name, "added schema info");
        Ok(())
    }

    pub fn replace(&self, name: &str, info: &SchemaInfo) -> Result<()> {
        validate_name(name)?;
        self.client.global(
            "replace schema info",
            global_min_version(OperationKind::ReplaceSchemaInfo),
            StoreRequest::ReplaceSchemaInfo {
                name: name.to_string(),
                xml: info.to_xml()?,
            },
        )?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.client.global(
            "remove schema info",
            global_min_version(OperationKind::RemoveSchemaInfo),
            StoreRequest::RemoveSchemaInfo {
                name: name.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn try_get(&self, name: &str) -> Result<Option<SchemaInfo>> {
        let found = self
            .client
            .global(
                "find schema info",
                global_min_version(OperationKind::AddSchemaInfo),
                StoreRequest::FindSchemaInfo {
                    name: name.to_string(),
                },
            )?
            .into_schema_infos()
            .into_iter()
            .next();
        found.map(|(_, xml)| SchemaInfo::from_xml(&xml)).transpose()
    }

    pub fn get(&self, name: &str) -> Result<SchemaInfo> {
        self.try_get(name)?.ok_or_else(|| {
            Error::new(
                ErrorCode::SchemaInfoNameDoesNotExist,
                format!("schema info '{name}' does not exist"),
            )
        })
    }

    /// Every stored document, ordered by name
    pub fn list(&self) -> Result<Vec<(String, SchemaInfo)>> {
        self.client
            .global(
                "list schema info",
                global_min_version(OperationKind::AddSchemaInfo),
                StoreRequest::GetSchemaInfos,
            )?
            .into_schema_infos()
            .into_iter()
            .map(|(name, xml)| Ok((name, SchemaInfo::from_xml(&xml)?)))
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SCHEMA_INFO_NAME_LENGTH {
        return Err(Error::invalid_argument(format!(
            "schema info name must be 1 to {MAX_SCHEMA_INFO_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SchemaInfo {
        let mut info = SchemaInfo::new();
        info.add_reference_table(ReferenceTableInfo::new("dbo", "regions").unwrap())
            .unwrap();
        info.add_sharded_table(ShardedTableInfo::new("dbo", "orders", "customer_id").unwrap())
            .unwrap();
        info.add_sharded_table(ShardedTableInfo::new("sales", "lines", "customer_id").unwrap())
            .unwrap();
        info
    }

    #[test]
    fn test_xml_shape() {
        let xml = sample().to_xml().unwrap();
        assert!(xml.starts_with("<Schema>"));
        assert!(xml.contains(
            "<ReferenceTableSet><ReferenceTableInfo><SchemaName>dbo</SchemaName>\
             <TableName>regions</TableName></ReferenceTableInfo></ReferenceTableSet>"
        ));
        assert!(xml.contains("<KeyColumnName>customer_id</KeyColumnName>"));
        assert_eq!(SchemaInfo::from_xml(&xml).unwrap(), sample());
    }

    #[test]
    fn test_parse_handwritten_document() {
        let xml = "<Schema><ReferenceTableSet/><ShardedTableSet>\
                   <ShardedTableInfo><SchemaName>dbo</SchemaName><TableName>t</TableName>\
                   <KeyColumnName>k</KeyColumnName></ShardedTableInfo>\
                   </ShardedTableSet></Schema>";
        let info = SchemaInfo::from_xml(xml).unwrap();
        assert!(info.reference_tables().is_empty());
        assert_eq!(info.sharded_tables()[0].key_column_name, "k");
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut info = sample();
        let err = info
            .add_reference_table(ReferenceTableInfo::new("DBO", "Orders").unwrap())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let lines = ShardedTableInfo::new("sales", "lines", "customer_id").unwrap();
        assert!(info.remove_sharded_table(&lines));
        assert!(!info.remove_sharded_table(&lines));
        assert_eq!(info.sharded_tables().len(), 1);
    }

    #[test]
    fn test_invalid_document() {
        let err = SchemaInfo::from_xml("<Schema><ShardedTableSet>").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Serialization);
    }
}
