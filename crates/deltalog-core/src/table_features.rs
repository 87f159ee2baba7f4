//! Catalogue of table features known to this engine.
//!
//! A feature is either *legacy* (implied by protocol versions alone) or
//! *native* (only expressible by naming it in the protocol's feature sets),
//! and either writer-only or reader-writer. Each descriptor also knows which
//! table metadata requires it, so enabling a property like
//! `delta.enableDeletionVectors` pulls in the matching feature automatically.

use std::fmt;

use crate::{
    actions::Metadata,
    config::{TableConfig, keys},
    schema::PrimitiveType,
};

/// Whether a feature is implied by protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    /// Supported implicitly by any protocol at or above its minimum versions.
    Legacy,
    /// Only supported when listed explicitly in the feature sets.
    Native,
}

/// Which side of the protocol must understand a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureScope {
    /// Only writers must understand it.
    WriterOnly,
    /// Readers and writers must understand it.
    ReaderWriter,
}

/// Static description of a table feature.
#[derive(Clone, Copy)]
pub struct TableFeature {
    /// Name as it appears in `readerFeatures` / `writerFeatures`.
    pub name: &'static str,
    /// Legacy or native.
    pub kind: FeatureKind,
    /// Writer-only or reader-writer.
    pub scope: FeatureScope,
    /// Minimum reader version that implies (legacy) or can carry (native) it.
    pub min_reader_version: i32,
    /// Minimum writer version that implies (legacy) or can carry (native) it.
    pub min_writer_version: i32,
    /// Features that must be supported alongside this one.
    pub requires: &'static [&'static str],
    required_by_metadata: fn(&Metadata) -> bool,
}

impl fmt::Debug for TableFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableFeature")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .finish()
    }
}

impl PartialEq for TableFeature {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TableFeature {}

impl TableFeature {
    /// True for reader-writer features.
    pub fn is_reader_writer(&self) -> bool {
        self.scope == FeatureScope::ReaderWriter
    }

    /// True for legacy features.
    pub fn is_legacy(&self) -> bool {
        self.kind == FeatureKind::Legacy
    }

    /// Whether `metadata` uses this feature and therefore needs it supported.
    pub fn is_required_by(&self, metadata: &Metadata) -> bool {
        (self.required_by_metadata)(metadata)
    }
}

fn property_enabled(metadata: &Metadata, key: &str) -> bool {
    TableConfig::new(&metadata.configuration).is_enabled(key)
}

fn any_field_metadata(metadata: &Metadata, key: &str) -> bool {
    metadata
        .schema()
        .map(|schema| {
            schema
                .all_fields()
                .iter()
                .any(|f| f.metadata.contains_key(key))
        })
        .unwrap_or(false)
}

fn never(_: &Metadata) -> bool {
    false
}

/// `appendOnly`
pub static APPEND_ONLY: TableFeature = TableFeature {
    name: "appendOnly",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 2,
    requires: &[],
    required_by_metadata: |m| property_enabled(m, keys::APPEND_ONLY),
};

/// `invariants`
pub static INVARIANTS: TableFeature = TableFeature {
    name: "invariants",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 2,
    requires: &[],
    required_by_metadata: |m| any_field_metadata(m, "delta.invariants"),
};

/// `checkConstraints`
pub static CHECK_CONSTRAINTS: TableFeature = TableFeature {
    name: "checkConstraints",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 3,
    requires: &[],
    required_by_metadata: |m| {
        TableConfig::new(&m.configuration)
            .check_constraints()
            .next()
            .is_some()
    },
};

/// `changeDataFeed`
pub static CHANGE_DATA_FEED: TableFeature = TableFeature {
    name: "changeDataFeed",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 4,
    requires: &[],
    required_by_metadata: |m| property_enabled(m, keys::ENABLE_CHANGE_DATA_FEED),
};

/// `generatedColumns`
pub static GENERATED_COLUMNS: TableFeature = TableFeature {
    name: "generatedColumns",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 4,
    requires: &[],
    required_by_metadata: |m| any_field_metadata(m, "delta.generationExpression"),
};

/// `columnMapping`
pub static COLUMN_MAPPING: TableFeature = TableFeature {
    name: "columnMapping",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::ReaderWriter,
    min_reader_version: 2,
    min_writer_version: 5,
    requires: &[],
    required_by_metadata: |m| {
        m.configuration
            .get(keys::COLUMN_MAPPING_MODE)
            .map(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("name") || v.eq_ignore_ascii_case("id")
            })
            .unwrap_or(false)
    },
};

/// `identityColumns`
pub static IDENTITY_COLUMNS: TableFeature = TableFeature {
    name: "identityColumns",
    kind: FeatureKind::Legacy,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 6,
    requires: &[],
    required_by_metadata: |m| any_field_metadata(m, "delta.identity.start"),
};

/// `deletionVectors`
pub static DELETION_VECTORS: TableFeature = TableFeature {
    name: "deletionVectors",
    kind: FeatureKind::Native,
    scope: FeatureScope::ReaderWriter,
    min_reader_version: 3,
    min_writer_version: 7,
    requires: &[],
    required_by_metadata: |m| property_enabled(m, keys::ENABLE_DELETION_VECTORS),
};

/// `timestampNtz`
pub static TIMESTAMP_NTZ: TableFeature = TableFeature {
    name: "timestampNtz",
    kind: FeatureKind::Native,
    scope: FeatureScope::ReaderWriter,
    min_reader_version: 3,
    min_writer_version: 7,
    requires: &[],
    required_by_metadata: |m| {
        m.schema()
            .map(|schema| {
                schema.fields.iter().any(|f| {
                    f.data_type
                        .any_primitive(&|p| *p == PrimitiveType::TimestampNtz)
                })
            })
            .unwrap_or(false)
    },
};

/// `domainMetadata`
pub static DOMAIN_METADATA: TableFeature = TableFeature {
    name: "domainMetadata",
    kind: FeatureKind::Native,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 7,
    requires: &[],
    required_by_metadata: never,
};

/// `rowTracking`
pub static ROW_TRACKING: TableFeature = TableFeature {
    name: "rowTracking",
    kind: FeatureKind::Native,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 7,
    requires: &["domainMetadata"],
    required_by_metadata: |m| property_enabled(m, keys::ENABLE_ROW_TRACKING),
};

/// `typeWidening`
pub static TYPE_WIDENING: TableFeature = TableFeature {
    name: "typeWidening",
    kind: FeatureKind::Native,
    scope: FeatureScope::ReaderWriter,
    min_reader_version: 3,
    min_writer_version: 7,
    requires: &[],
    required_by_metadata: |m| property_enabled(m, keys::ENABLE_TYPE_WIDENING),
};

/// `v2Checkpoint`
pub static V2_CHECKPOINT: TableFeature = TableFeature {
    name: "v2Checkpoint",
    kind: FeatureKind::Native,
    scope: FeatureScope::ReaderWriter,
    min_reader_version: 3,
    min_writer_version: 7,
    requires: &[],
    required_by_metadata: |m| {
        m.configuration
            .get(keys::CHECKPOINT_POLICY)
            .map(|v| v.trim().eq_ignore_ascii_case("v2"))
            .unwrap_or(false)
    },
};

/// `inCommitTimestamp`
pub static IN_COMMIT_TIMESTAMP: TableFeature = TableFeature {
    name: "inCommitTimestamp",
    kind: FeatureKind::Native,
    scope: FeatureScope::WriterOnly,
    min_reader_version: 1,
    min_writer_version: 7,
    requires: &[],
    required_by_metadata: |m| property_enabled(m, keys::ENABLE_IN_COMMIT_TIMESTAMPS),
};

/// Every feature this engine knows, legacy features first.
pub static ALL_FEATURES: &[&TableFeature] = &[
    &APPEND_ONLY,
    &INVARIANTS,
    &CHECK_CONSTRAINTS,
    &CHANGE_DATA_FEED,
    &GENERATED_COLUMNS,
    &COLUMN_MAPPING,
    &IDENTITY_COLUMNS,
    &DELETION_VECTORS,
    &TIMESTAMP_NTZ,
    &DOMAIN_METADATA,
    &ROW_TRACKING,
    &TYPE_WIDENING,
    &V2_CHECKPOINT,
    &IN_COMMIT_TIMESTAMP,
];

/// Look up a feature by its protocol name.
pub fn feature_by_name(name: &str) -> Option<&'static TableFeature> {
    ALL_FEATURES.iter().copied().find(|f| f.name == name)
}

/// Features `metadata` requires, including transitive `requires` entries.
pub fn features_required_by(metadata: &Metadata) -> Vec<&'static TableFeature> {
    let mut out: Vec<&'static TableFeature> = Vec::new();
    for feature in ALL_FEATURES.iter().copied() {
        if feature.is_required_by(metadata) {
            push_with_dependencies(feature, &mut out);
        }
    }
    out
}

/// Append `feature` and its dependencies to `out`, skipping duplicates.
pub(crate) fn push_with_dependencies(
    feature: &'static TableFeature,
    out: &mut Vec<&'static TableFeature>,
) {
    if out.iter().any(|f| f.name == feature.name) {
        return;
    }
    out.push(feature);
    for dep in feature.requires {
        if let Some(dep) = feature_by_name(dep) {
            push_with_dependencies(dep, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{StructField, StructType};
    use std::collections::BTreeMap;

    fn metadata(props: &[(&str, &str)], schema: StructType) -> Metadata {
        let configuration: BTreeMap<String, String> = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Metadata::try_new(&schema, vec![], configuration).expect("valid schema")
    }

    fn simple_schema() -> StructType {
        StructType::new(vec![StructField::new("id", PrimitiveType::Long, true)])
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(feature_by_name("rowTracking"), Some(&ROW_TRACKING));
        assert!(feature_by_name("doesNotExist").is_none());
    }

    #[test]
    fn properties_pull_in_features() {
        let md = metadata(
            &[(keys::ENABLE_DELETION_VECTORS, "true"), (keys::APPEND_ONLY, "true")],
            simple_schema(),
        );
        let names: Vec<_> = features_required_by(&md).iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["appendOnly", "deletionVectors"]);
    }

    #[test]
    fn row_tracking_requires_domain_metadata() {
        let md = metadata(&[(keys::ENABLE_ROW_TRACKING, "true")], simple_schema());
        let names: Vec<_> = features_required_by(&md).iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["rowTracking", "domainMetadata"]);
    }

    #[test]
    fn schema_driven_features() {
        let schema = StructType::new(vec![
            StructField::new("ts", PrimitiveType::TimestampNtz, true),
            StructField::new("id", PrimitiveType::Long, false)
                .with_metadata("delta.identity.start", 1),
        ]);
        let md = metadata(&[], schema);
        let names: Vec<_> = features_required_by(&md).iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["identityColumns", "timestampNtz"]);
    }

    #[test]
    fn disabled_property_requires_nothing() {
        let md = metadata(&[(keys::ENABLE_DELETION_VECTORS, "false")], simple_schema());
        assert!(features_required_by(&md).is_empty());
    }
}
