use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use serde::{Deserialize, Serialize};

use crate::schema::{SchemaError, StructType};

/// Storage format of the data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    /// Format name; always `parquet` for tables written by this crate.
    pub provider: String,
    /// Format options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: BTreeMap::new(),
        }
    }
}

/// Table metadata (`metaData` action).
///
/// The schema travels as a JSON string. [`Metadata::schema`] parses it once
/// and memoizes the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Unique table id, fixed at creation.
    pub id: String,
    /// Optional user-facing name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data file format.
    #[serde(default)]
    pub format: Format,
    /// JSON-encoded [`StructType`].
    pub schema_string: String,
    /// Ordered partition column names.
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Table properties (see [`crate::config::TableConfig`]).
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
    /// Creation time in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
    #[serde(skip)]
    parsed_schema: OnceLock<Arc<StructType>>,
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.format == other.format
            && self.schema_string == other.schema_string
            && self.partition_columns == other.partition_columns
            && self.configuration == other.configuration
            && self.created_time == other.created_time
    }
}

impl Metadata {
    /// Build metadata for a new table with a fresh id.
    pub fn try_new(
        schema: &StructType,
        partition_columns: Vec<String>,
        configuration: BTreeMap<String, String>,
    ) -> Result<Self, SchemaError> {
        let schema_string = schema.to_json()?;
        let parsed_schema = OnceLock::new();
        let _ = parsed_schema.set(Arc::new(schema.clone()));
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            description: None,
            format: Format::default(),
            schema_string,
            partition_columns,
            configuration,
            created_time: Some(crate::now_millis()),
            parsed_schema,
        })
    }

    /// Set the table name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the table description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set one table property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Replace the schema, keeping every other field.
    pub fn with_schema(&self, schema: &StructType) -> Result<Self, SchemaError> {
        let mut next = self.clone();
        next.schema_string = schema.to_json()?;
        next.parsed_schema = OnceLock::new();
        let _ = next.parsed_schema.set(Arc::new(schema.clone()));
        Ok(next)
    }

    /// Parsed schema, memoized after the first successful call.
    pub fn schema(&self) -> Result<Arc<StructType>, SchemaError> {
        if let Some(schema) = self.parsed_schema.get() {
            return Ok(Arc::clone(schema));
        }
        let parsed = Arc::new(StructType::from_json(&self.schema_string)?);
        Ok(Arc::clone(self.parsed_schema.get_or_init(|| parsed)))
    }

    /// Property value by key.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, PrimitiveType, StructField};

    fn schema() -> StructType {
        StructType::new(vec![
            StructField::new("id", DataType::Primitive(PrimitiveType::Long), false),
            StructField::new("p", DataType::Primitive(PrimitiveType::String), true),
        ])
    }

    #[test]
    fn round_trip_keeps_schema_string() -> Result<(), Box<dyn std::error::Error>> {
        let md = Metadata::try_new(&schema(), vec!["p".to_string()], BTreeMap::new())?
            .with_name("events");
        let json = serde_json::to_string(&md)?;
        let back: Metadata = serde_json::from_str(&json)?;
        assert_eq!(back, md);
        assert_eq!(back.schema()?.as_ref(), &schema());
        Ok(())
    }

    #[test]
    fn schema_errors_surface_on_access() -> Result<(), serde_json::Error> {
        let md: Metadata = serde_json::from_str(
            r#"{"id":"x","format":{"provider":"parquet"},"schemaString":"not json","partitionColumns":[],"configuration":{}}"#,
        )?;
        assert!(md.schema().is_err());
        Ok(())
    }
}
