//! Parquet encoding of checkpoint parts.
//!
//! Each checkpoint row carries exactly one action. The file has one nullable
//! struct column per checkpointable action kind (`add`, `remove`, `metaData`,
//! `protocol`, `txn`, `domainMetadata`) whose fields mirror the action's JSON
//! keys with native types: sizes and timestamps are `Int64`, partition values,
//! tags and configurations are `Map<Utf8, Utf8>`, feature sets are lists.
//! `commitInfo` never appears in checkpoints.
//!
//! Rows are moved between serde and Arrow with `arrow_json`, so the column
//! layout and the commit-line JSON stay in lockstep.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow_json::{LineDelimitedWriter, ReaderBuilder};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;

use crate::actions::{self, Action, ActionParseError};

const COLUMNS: [&str; 6] = ["add", "remove", "metaData", "protocol", "txn", "domainMetadata"];

/// Rows converted per Arrow batch.
const BATCH_ROWS: usize = 8192;

/// Errors raised while encoding or decoding a checkpoint part.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckpointCodecError {
    /// Building or reading an Arrow batch failed.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Reading or writing Parquet failed.
    #[snafu(display("Parquet error: {source}"))]
    Parquet {
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// An action could not be converted to JSON for encoding.
    #[snafu(display("Action JSON error in row {row}: {source}"))]
    Json {
        /// Row index within the part.
        row: usize,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// A decoded row is not a valid action.
    #[snafu(display("Invalid checkpoint row: {source}"))]
    Row {
        /// Underlying parse error; `line` is the 1-based row within its batch.
        source: ActionParseError,
    },

    /// The file does not have the checkpoint layout.
    #[snafu(display("Unexpected checkpoint layout: {detail}"))]
    Layout {
        /// What is wrong.
        detail: String,
    },
}

fn utf8(name: &str) -> Field {
    Field::new(name, DataType::Utf8, true)
}

fn long(name: &str) -> Field {
    Field::new(name, DataType::Int64, true)
}

fn int(name: &str) -> Field {
    Field::new(name, DataType::Int32, true)
}

fn boolean(name: &str) -> Field {
    Field::new(name, DataType::Boolean, true)
}

fn string_map(name: &str) -> Field {
    let entries = Field::new(
        "key_value",
        DataType::Struct(Fields::from(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Utf8, true),
        ])),
        false,
    );
    Field::new(name, DataType::Map(Arc::new(entries), false), true)
}

fn string_list(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("element", DataType::Utf8, true))),
        true,
    )
}

fn structure(name: &str, fields: Vec<Field>) -> Field {
    Field::new(name, DataType::Struct(Fields::from(fields)), true)
}

fn deletion_vector() -> Field {
    structure(
        "deletionVector",
        vec![
            utf8("storageType"),
            utf8("pathOrInlineDv"),
            int("offset"),
            int("sizeInBytes"),
            long("cardinality"),
        ],
    )
}

/// Arrow schema of a checkpoint part.
pub fn checkpoint_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        structure(
            "add",
            vec![
                utf8("path"),
                string_map("partitionValues"),
                long("size"),
                long("modificationTime"),
                boolean("dataChange"),
                utf8("stats"),
                string_map("tags"),
                deletion_vector(),
                long("baseRowId"),
                long("defaultRowCommitVersion"),
            ],
        ),
        structure(
            "remove",
            vec![
                utf8("path"),
                long("deletionTimestamp"),
                boolean("dataChange"),
                boolean("extendedFileMetadata"),
                string_map("partitionValues"),
                long("size"),
                string_map("tags"),
                deletion_vector(),
                long("baseRowId"),
                long("defaultRowCommitVersion"),
            ],
        ),
        structure(
            "metaData",
            vec![
                utf8("id"),
                utf8("name"),
                utf8("description"),
                structure("format", vec![utf8("provider"), string_map("options")]),
                utf8("schemaString"),
                string_list("partitionColumns"),
                string_map("configuration"),
                long("createdTime"),
            ],
        ),
        structure(
            "protocol",
            vec![
                int("minReaderVersion"),
                int("minWriterVersion"),
                string_list("readerFeatures"),
                string_list("writerFeatures"),
            ],
        ),
        structure(
            "txn",
            vec![utf8("appId"), long("version"), long("lastUpdated")],
        ),
        structure(
            "domainMetadata",
            vec![utf8("domain"), utf8("configuration"), boolean("removed")],
        ),
    ]))
}

/// Encode actions into one Parquet file. `commitInfo` actions are skipped.
pub fn encode_actions(actions: &[Action]) -> Result<Vec<u8>, CheckpointCodecError> {
    let rows = actions
        .iter()
        .filter(|a| !matches!(a, Action::CommitInfo(_)))
        .enumerate()
        .map(|(row, action)| serde_json::to_value(action).context(JsonSnafu { row }))
        .collect::<Result<Vec<_>, _>>()?;

    let schema = checkpoint_schema();
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, schema.clone(), Some(props)).context(ParquetSnafu)?;
    let mut decoder = ReaderBuilder::new(schema)
        .with_batch_size(BATCH_ROWS)
        .build_decoder()
        .context(ArrowSnafu)?;
    for chunk in rows.chunks(BATCH_ROWS) {
        decoder.serialize(chunk).context(ArrowSnafu)?;
        if let Some(batch) = decoder.flush().context(ArrowSnafu)? {
            writer.write(&batch).context(ParquetSnafu)?;
        }
    }
    writer.close().context(ParquetSnafu)?;
    Ok(buf)
}

/// Decode a Parquet checkpoint part back into actions, in row order.
pub fn decode_actions(bytes: Bytes) -> Result<Vec<Action>, CheckpointCodecError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).context(ParquetSnafu)?;
    let schema = builder.schema().clone();
    let mut indices = Vec::with_capacity(COLUMNS.len());
    for name in COLUMNS {
        let (idx, field) = schema.column_with_name(name).context(LayoutSnafu {
            detail: format!("missing column {name}"),
        })?;
        ensure!(
            matches!(field.data_type(), DataType::Struct(_)),
            LayoutSnafu {
                detail: format!("column {name} has type {}", field.data_type()),
            }
        );
        indices.push(idx);
    }

    let reader = builder.build().context(ParquetSnafu)?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?.project(&indices).context(ArrowSnafu)?;
        // Null action columns are omitted, so each line names a single action.
        let mut lines = LineDelimitedWriter::new(Vec::new());
        lines.write(&batch).context(ArrowSnafu)?;
        lines.finish().context(ArrowSnafu)?;
        out.extend(actions::parse_actions(&lines.into_inner()).context(RowSnafu)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{
        AddFile, CommitInfo, DeletionVectorDescriptor, DomainMetadata, Metadata, PartitionValues,
        Protocol, SetTransaction,
    };
    use crate::schema::{DataType as ColumnType, PrimitiveType, StructField, StructType};
    use arrow::array::{Array, ArrayRef, AsArray, StringArray};
    use arrow::datatypes::Int64Type;
    use arrow::record_batch::RecordBatch;
    use std::collections::BTreeMap;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn struct_fields<'a>(schema: &'a Schema, column: &str) -> &'a Fields {
        match schema.field_with_name(column).map(|f| f.data_type()) {
            Ok(DataType::Struct(fields)) => fields,
            other => panic!("{column} is not a struct column: {other:?}"),
        }
    }

    fn field_type<'a>(fields: &'a Fields, name: &str) -> &'a DataType {
        fields
            .iter()
            .find(|f| f.name() == name)
            .map(|f| f.data_type())
            .unwrap_or_else(|| panic!("missing field {name}"))
    }

    #[test]
    fn each_row_populates_one_column() -> TestResult {
        let actions = vec![
            Action::Protocol(Protocol::legacy(1, 2)),
            Action::Txn(SetTransaction {
                app_id: "app".to_string(),
                version: 4,
                last_updated: None,
            }),
            Action::DomainMetadata(DomainMetadata::new("app.cfg", "{}")),
            Action::Add(AddFile::new("a.parquet", BTreeMap::new(), 1, 2, false)),
            Action::CommitInfo(CommitInfo::default()),
        ];
        let bytes = encode_actions(&actions)?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes.clone()))?.build()?;
        let mut rows = 0;
        for batch in reader {
            let batch = batch?;
            rows += batch.num_rows();
            for row in 0..batch.num_rows() {
                let populated = (0..batch.num_columns())
                    .filter(|c| batch.column(*c).is_valid(row))
                    .count();
                assert_eq!(populated, 1);
            }
        }
        assert_eq!(rows, 4);

        let decoded = decode_actions(Bytes::from(bytes))?;
        assert_eq!(decoded, actions[..4].to_vec());
        Ok(())
    }

    #[test]
    fn columns_are_typed_structs() -> TestResult {
        let mut pv = PartitionValues::new();
        pv.insert("date".to_string(), Some("2024-01-01".to_string()));
        let add = AddFile::new("date=2024-01-01/a.parquet", pv, 4096, 1_700_000_000_000, true);
        let bytes = encode_actions(&[Action::Add(add)])?;

        let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?;
        let schema = builder.schema().clone();
        let add_fields = struct_fields(&schema, "add");
        assert_eq!(field_type(add_fields, "path"), &DataType::Utf8);
        assert_eq!(field_type(add_fields, "size"), &DataType::Int64);
        assert_eq!(field_type(add_fields, "modificationTime"), &DataType::Int64);
        assert_eq!(field_type(add_fields, "dataChange"), &DataType::Boolean);
        assert!(matches!(field_type(add_fields, "partitionValues"), DataType::Map(_, _)));
        assert!(matches!(field_type(add_fields, "deletionVector"), DataType::Struct(_)));

        let meta_fields = struct_fields(&schema, "metaData");
        assert!(matches!(field_type(meta_fields, "partitionColumns"), DataType::List(_)));
        assert!(matches!(field_type(meta_fields, "configuration"), DataType::Map(_, _)));
        let protocol_fields = struct_fields(&schema, "protocol");
        assert_eq!(field_type(protocol_fields, "minReaderVersion"), &DataType::Int32);
        assert_eq!(field_type(struct_fields(&schema, "txn"), "version"), &DataType::Int64);

        let mut reader = builder.build()?;
        let batch = reader.next().ok_or("no batch")??;
        let add_column = batch.column(schema.index_of("add")?).as_struct();
        let size = add_column
            .column_by_name("size")
            .ok_or("size")?
            .as_primitive::<Int64Type>();
        assert_eq!(size.value(0), 4096);
        let path = add_column
            .column_by_name("path")
            .ok_or("path")?
            .as_string::<i32>();
        assert_eq!(path.value(0), "date=2024-01-01/a.parquet");
        Ok(())
    }

    #[test]
    fn nested_fields_survive_the_round_trip() -> TestResult {
        let mut pv = PartitionValues::new();
        pv.insert("date".to_string(), Some("2024-01-01".to_string()));
        pv.insert("region".to_string(), None);
        let mut add = AddFile::new("a.parquet", pv, 10, 20, true).with_num_records(3);
        add.tags = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        add.deletion_vector = Some(DeletionVectorDescriptor {
            storage_type: "u".to_string(),
            path_or_inline_dv: "ab^-aqEH.-t@S}K{vb[*k^".to_string(),
            offset: Some(4),
            size_in_bytes: 40,
            cardinality: 6,
        });
        add.base_row_id = Some(100);
        add.default_row_commit_version = Some(7);
        let remove = add.remove_with(30, true);

        let schema = StructType::new(vec![
            StructField::new("id", ColumnType::Primitive(PrimitiveType::Long), false),
            StructField::new("date", ColumnType::Primitive(PrimitiveType::Date), true),
        ]);
        let metadata = Metadata::try_new(
            &schema,
            vec!["date".to_string()],
            BTreeMap::from([("delta.appendOnly".to_string(), "true".to_string())]),
        )?
        .with_name("events");
        let protocol = Protocol::legacy(1, 2);

        let actions = vec![
            Action::Protocol(protocol),
            Action::Metadata(metadata),
            Action::Add(add),
            Action::Remove(remove),
            Action::Txn(SetTransaction {
                app_id: "ingest".to_string(),
                version: 9,
                last_updated: Some(1234),
            }),
        ];
        let decoded = decode_actions(Bytes::from(encode_actions(&actions)?))?;
        assert_eq!(decoded, actions);
        Ok(())
    }

    #[test]
    fn foreign_parquet_is_rejected() -> TestResult {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(StringArray::from(vec![Some("1")])) as ArrayRef],
        )?;
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        let err = decode_actions(Bytes::from(buf)).expect_err("not a checkpoint");
        assert!(matches!(err, CheckpointCodecError::Layout { .. }));
        Ok(())
    }

    #[test]
    fn json_string_columns_are_rejected() -> TestResult {
        let schema = Arc::new(Schema::new(
            COLUMNS
                .iter()
                .map(|name| Field::new(*name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ));
        let mut columns: Vec<ArrayRef> =
            vec![Arc::new(StringArray::from(vec![Some(r#"{"minReaderVersion":1}"#)]))];
        columns.extend(
            (1..COLUMNS.len()).map(|_| Arc::new(StringArray::from(vec![None::<&str>])) as ArrayRef),
        );
        let batch = RecordBatch::try_new(schema.clone(), columns)?;
        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;

        let err = decode_actions(Bytes::from(buf)).expect_err("untyped layout");
        assert!(matches!(err, CheckpointCodecError::Layout { .. }));
        Ok(())
    }

    #[test]
    fn garbage_bytes_are_a_parquet_error() {
        let err = decode_actions(Bytes::from_static(b"not parquet")).expect_err("garbage");
        assert!(matches!(err, CheckpointCodecError::Parquet { .. }));
    }
}
