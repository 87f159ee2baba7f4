//! Table schema model and its JSON encoding.
//!
//! The schema is stored inside the `metaData` action as a JSON string:
//!
//! ```json
//! {"type":"struct","fields":[
//!   {"name":"id","type":"long","nullable":false,"metadata":{}},
//!   {"name":"tags","type":{"type":"array","elementType":"string","containsNull":true},
//!    "nullable":true,"metadata":{}}
//! ]}
//! ```
//!
//! Primitive types are bare strings; complex types are objects tagged by
//! `"type"`. Field metadata is an arbitrary JSON object used by table features
//! (column mapping ids, invariants, generation expressions, identity columns).

pub mod column_mapping;
pub mod compat;

use std::{collections::BTreeMap, collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

/// Errors raised while parsing or validating a schema.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// The schema JSON could not be parsed or produced.
    #[snafu(display("Invalid schema JSON: {source}"))]
    Json {
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Two fields at the same level share a name (case-insensitive).
    #[snafu(display("Duplicate column {name} in schema"))]
    DuplicateField {
        /// Dotted path of the duplicated column.
        name: String,
    },

    /// A field has an empty name.
    #[snafu(display("Schema contains a field with an empty name"))]
    EmptyFieldName,

    /// A partition column does not exist as a top-level field.
    #[snafu(display("Partition column {column} not found in schema"))]
    MissingPartitionColumn {
        /// Offending partition column.
        column: String,
    },

    /// A partition column is listed twice.
    #[snafu(display("Partition column {column} is listed more than once"))]
    DuplicatePartitionColumn {
        /// Offending partition column.
        column: String,
    },

    /// A partition column has a nested type.
    #[snafu(display("Partition column {column} has non-primitive type {data_type}"))]
    NonPrimitivePartitionColumn {
        /// Offending partition column.
        column: String,
        /// Its type.
        data_type: DataType,
    },
}

/// Non-nested data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrimitiveType {
    /// UTF-8 string.
    String,
    /// 64-bit signed integer.
    Long,
    /// 32-bit signed integer.
    Integer,
    /// 16-bit signed integer.
    Short,
    /// 8-bit signed integer.
    Byte,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Boolean.
    Boolean,
    /// Byte array.
    Binary,
    /// Calendar date.
    Date,
    /// Timestamp with UTC adjustment.
    Timestamp,
    /// Timestamp without time zone.
    TimestampNtz,
    /// Fixed-point decimal.
    Decimal {
        /// Total number of digits.
        precision: u8,
        /// Digits after the decimal point.
        scale: u8,
    },
}

impl FromStr for PrimitiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "string" => PrimitiveType::String,
            "long" => PrimitiveType::Long,
            "integer" => PrimitiveType::Integer,
            "short" => PrimitiveType::Short,
            "byte" => PrimitiveType::Byte,
            "float" => PrimitiveType::Float,
            "double" => PrimitiveType::Double,
            "boolean" => PrimitiveType::Boolean,
            "binary" => PrimitiveType::Binary,
            "date" => PrimitiveType::Date,
            "timestamp" => PrimitiveType::Timestamp,
            "timestamp_ntz" => PrimitiveType::TimestampNtz,
            other => return parse_decimal(other),
        })
    }
}

fn parse_decimal(s: &str) -> Result<PrimitiveType, String> {
    let inner = s
        .strip_prefix("decimal(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("unknown primitive type {s:?}"))?;
    let (p, sc) = inner
        .split_once(',')
        .ok_or_else(|| format!("malformed decimal type {s:?}"))?;
    let precision: u8 = p
        .trim()
        .parse()
        .map_err(|_| format!("malformed decimal precision in {s:?}"))?;
    let scale: u8 = sc
        .trim()
        .parse()
        .map_err(|_| format!("malformed decimal scale in {s:?}"))?;
    if precision == 0 || precision > 38 || scale > precision {
        return Err(format!("decimal out of range: {s:?}"));
    }
    Ok(PrimitiveType::Decimal { precision, scale })
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveType::String => f.write_str("string"),
            PrimitiveType::Long => f.write_str("long"),
            PrimitiveType::Integer => f.write_str("integer"),
            PrimitiveType::Short => f.write_str("short"),
            PrimitiveType::Byte => f.write_str("byte"),
            PrimitiveType::Float => f.write_str("float"),
            PrimitiveType::Double => f.write_str("double"),
            PrimitiveType::Boolean => f.write_str("boolean"),
            PrimitiveType::Binary => f.write_str("binary"),
            PrimitiveType::Date => f.write_str("date"),
            PrimitiveType::Timestamp => f.write_str("timestamp"),
            PrimitiveType::TimestampNtz => f.write_str("timestamp_ntz"),
            PrimitiveType::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
        }
    }
}

impl TryFrom<String> for PrimitiveType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PrimitiveType> for String {
    fn from(value: PrimitiveType) -> Self {
        value.to_string()
    }
}

/// Any schema data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataType {
    /// A primitive, encoded as a bare string.
    Primitive(PrimitiveType),
    /// A nested struct.
    Struct(Box<StructType>),
    /// A list.
    Array(Box<ArrayType>),
    /// A key/value map.
    Map(Box<MapType>),
}

impl DataType {
    /// Shorthand for a primitive type.
    pub const fn primitive(p: PrimitiveType) -> Self {
        DataType::Primitive(p)
    }

    /// True when `pred` holds for this type or any type nested inside it.
    pub fn any_primitive(&self, pred: &dyn Fn(&PrimitiveType) -> bool) -> bool {
        match self {
            DataType::Primitive(p) => pred(p),
            DataType::Struct(s) => s.fields.iter().any(|f| f.data_type.any_primitive(pred)),
            DataType::Array(a) => a.element_type.any_primitive(pred),
            DataType::Map(m) => {
                m.key_type.any_primitive(pred) || m.value_type.any_primitive(pred)
            }
        }
    }
}

impl From<PrimitiveType> for DataType {
    fn from(p: PrimitiveType) -> Self {
        DataType::Primitive(p)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Primitive(p) => write!(f, "{p}"),
            DataType::Struct(s) => {
                f.write_str("struct<")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{}", field.name, field.data_type)?;
                }
                f.write_str(">")
            }
            DataType::Array(a) => write!(f, "array<{}>", a.element_type),
            DataType::Map(m) => write!(f, "map<{},{}>", m.key_type, m.value_type),
        }
    }
}

/// List type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "array", rename_all = "camelCase")]
pub struct ArrayType {
    /// Element type.
    pub element_type: DataType,
    /// Whether elements may be null.
    pub contains_null: bool,
}

/// Map type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "map", rename_all = "camelCase")]
pub struct MapType {
    /// Key type.
    pub key_type: DataType,
    /// Value type.
    pub value_type: DataType,
    /// Whether values may be null.
    pub value_contains_null: bool,
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Whether the column may be null.
    pub nullable: bool,
    /// Feature-defined annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl StructField {
    /// Create a field with empty metadata.
    pub fn new(name: impl Into<String>, data_type: impl Into<DataType>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            metadata: BTreeMap::new(),
        }
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A struct type; also the top-level table schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename = "struct")]
pub struct StructType {
    /// Fields in declaration order.
    pub fields: Vec<StructField>,
}

impl From<StructType> for DataType {
    fn from(s: StructType) -> Self {
        DataType::Struct(Box::new(s))
    }
}

impl StructType {
    /// Create a struct from its fields.
    pub fn new(fields: Vec<StructField>) -> Self {
        Self { fields }
    }

    /// Parse the JSON encoding.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(json).context(JsonSnafu)
    }

    /// Produce the JSON encoding.
    pub fn to_json(&self) -> Result<String, SchemaError> {
        serde_json::to_string(self).context(JsonSnafu)
    }

    /// Top-level field by exact name.
    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Top-level field by case-insensitive name.
    pub fn field_ignore_case(&self, name: &str) -> Option<&StructField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Top-level field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Every field at every nesting level, depth first.
    pub fn all_fields(&self) -> Vec<&StructField> {
        let mut out = Vec::new();
        collect_fields(&self.fields, &mut out);
        out
    }

    /// Reject empty names and case-insensitive duplicates at any level.
    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_fields(&self.fields, "")
    }

    /// Check partition columns against this schema.
    pub fn validate_partition_columns(&self, columns: &[String]) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for column in columns {
            ensure!(
                seen.insert(column.to_ascii_lowercase()),
                DuplicatePartitionColumnSnafu { column }
            );
            let field = self
                .field_ignore_case(column)
                .context(MissingPartitionColumnSnafu { column })?;
            ensure!(
                matches!(field.data_type, DataType::Primitive(_)),
                NonPrimitivePartitionColumnSnafu {
                    column,
                    data_type: field.data_type.clone(),
                }
            );
        }
        Ok(())
    }
}

fn collect_fields<'a>(fields: &'a [StructField], out: &mut Vec<&'a StructField>) {
    for field in fields {
        out.push(field);
        collect_nested(&field.data_type, out);
    }
}

fn collect_nested<'a>(data_type: &'a DataType, out: &mut Vec<&'a StructField>) {
    match data_type {
        DataType::Primitive(_) => {}
        DataType::Struct(s) => collect_fields(&s.fields, out),
        DataType::Array(a) => collect_nested(&a.element_type, out),
        DataType::Map(m) => {
            collect_nested(&m.key_type, out);
            collect_nested(&m.value_type, out);
        }
    }
}

fn validate_fields(fields: &[StructField], prefix: &str) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for field in fields {
        ensure!(!field.name.is_empty(), EmptyFieldNameSnafu);
        let path = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        ensure!(
            seen.insert(field.name.to_ascii_lowercase()),
            DuplicateFieldSnafu { name: path.clone() }
        );
        validate_nested(&field.data_type, &path)?;
    }
    Ok(())
}

fn validate_nested(data_type: &DataType, path: &str) -> Result<(), SchemaError> {
    match data_type {
        DataType::Primitive(_) => Ok(()),
        DataType::Struct(s) => validate_fields(&s.fields, path),
        DataType::Array(a) => validate_nested(&a.element_type, &format!("{path}.element")),
        DataType::Map(m) => {
            validate_nested(&m.key_type, &format!("{path}.key"))?;
            validate_nested(&m.value_type, &format!("{path}.value"))
        }
    }
}
