//! Protocol versions, feature sets, upgrades and client compatibility.
//!
//! A protocol is in *legacy* mode on a side (reader or writer) when that side's
//! version is below the table-features threshold (reader 3, writer 7); legacy
//! features are then implied by the version number. At or above the threshold
//! the side lists its features explicitly. Upgrades never drop support for a
//! feature: when a legacy protocol moves to explicit feature sets, the features
//! it implied are carried over as explicit members.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    actions::Metadata,
    table_features::{self, ALL_FEATURES, FeatureKind, TableFeature},
};

/// Reader version from which `readerFeatures` is used.
pub const TABLE_FEATURES_MIN_READER_VERSION: i32 = 3;
/// Writer version from which `writerFeatures` is used.
pub const TABLE_FEATURES_MIN_WRITER_VERSION: i32 = 7;

/// Errors raised by protocol validation, upgrades and compatibility checks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    /// Versions and feature sets contradict each other.
    #[snafu(display("Inconsistent protocol: {detail}"))]
    Inconsistent {
        /// What is inconsistent.
        detail: String,
    },

    /// The proposed protocol would drop a version or a supported feature.
    #[snafu(display("Protocol downgrade from {from} to {to} is not allowed"))]
    Downgrade {
        /// Current protocol.
        from: String,
        /// Proposed protocol.
        to: String,
    },

    /// The table needs a newer reader than this client.
    #[snafu(display(
        "Table requires reader version {required}; this client supports up to {supported}"
    ))]
    UnsupportedReaderVersion {
        /// Version the table requires.
        required: i32,
        /// Highest version this client supports.
        supported: i32,
    },

    /// The table needs a newer writer than this client.
    #[snafu(display(
        "Table requires writer version {required}; this client supports up to {supported}"
    ))]
    UnsupportedWriterVersion {
        /// Version the table requires.
        required: i32,
        /// Highest version this client supports.
        supported: i32,
    },

    /// The table lists a reader feature this client does not implement.
    #[snafu(display("Unsupported reader feature: {feature}"))]
    UnsupportedReaderFeature {
        /// Feature name.
        feature: String,
    },

    /// The table lists a writer feature this client does not implement.
    #[snafu(display("Unsupported writer feature: {feature}"))]
    UnsupportedWriterFeature {
        /// Feature name.
        feature: String,
    },

    /// The metadata needs a feature that the table protocol does not support.
    #[snafu(display("Feature {feature} is required by the table metadata but not supported"))]
    FeatureNotSupported {
        /// Feature name.
        feature: String,
    },
}

/// Minimum reader/writer versions and optional feature sets (`protocol` action).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Minimum reader version.
    pub min_reader_version: i32,
    /// Minimum writer version.
    pub min_writer_version: i32,
    /// Explicit reader features; present iff `min_reader_version >= 3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<BTreeSet<String>>,
    /// Explicit writer features; present iff `min_writer_version >= 7`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<BTreeSet<String>>,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::legacy(1, 2)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}", self.min_reader_version, self.min_writer_version)?;
        if let Some(rf) = &self.reader_features {
            write!(f, ", reader={rf:?}")?;
        }
        if let Some(wf) = &self.writer_features {
            write!(f, ", writer={wf:?}")?;
        }
        f.write_str(")")
    }
}

impl Protocol {
    /// A protocol without explicit feature sets.
    pub fn legacy(min_reader_version: i32, min_writer_version: i32) -> Self {
        Self {
            min_reader_version,
            min_writer_version,
            reader_features: None,
            writer_features: None,
        }
    }

    /// Build and validate a protocol.
    pub fn try_new(
        min_reader_version: i32,
        min_writer_version: i32,
        reader_features: Option<impl IntoIterator<Item = impl Into<String>>>,
        writer_features: Option<impl IntoIterator<Item = impl Into<String>>>,
    ) -> Result<Self, ProtocolError> {
        let protocol = Self {
            min_reader_version,
            min_writer_version,
            reader_features: reader_features.map(|fs| fs.into_iter().map(Into::into).collect()),
            writer_features: writer_features.map(|fs| fs.into_iter().map(Into::into).collect()),
        };
        protocol.validate()?;
        Ok(protocol)
    }

    /// Whether the reader side lists features explicitly.
    pub fn supports_reader_features(&self) -> bool {
        self.min_reader_version >= TABLE_FEATURES_MIN_READER_VERSION
    }

    /// Whether the writer side lists features explicitly.
    pub fn supports_writer_features(&self) -> bool {
        self.min_writer_version >= TABLE_FEATURES_MIN_WRITER_VERSION
    }

    /// Check that versions and feature sets agree.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        ensure!(
            self.min_reader_version >= 1 && self.min_writer_version >= 1,
            InconsistentSnafu {
                detail: "versions must be at least 1"
            }
        );
        ensure!(
            self.supports_reader_features() == self.reader_features.is_some(),
            InconsistentSnafu {
                detail: format!(
                    "readerFeatures must be present exactly when minReaderVersion >= {TABLE_FEATURES_MIN_READER_VERSION}"
                )
            }
        );
        ensure!(
            self.supports_writer_features() == self.writer_features.is_some(),
            InconsistentSnafu {
                detail: format!(
                    "writerFeatures must be present exactly when minWriterVersion >= {TABLE_FEATURES_MIN_WRITER_VERSION}"
                )
            }
        );
        if let Some(reader) = &self.reader_features {
            let writer = self.writer_features.as_ref().context(InconsistentSnafu {
                detail: "readerFeatures require writerFeatures",
            })?;
            if let Some(missing) = reader.iter().find(|f| !writer.contains(*f)) {
                return InconsistentSnafu {
                    detail: format!("reader feature {missing} is not listed as a writer feature"),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Whether this protocol supports `feature`, by set membership in feature
    /// mode or by version in legacy mode.
    pub fn is_feature_supported(&self, feature: &TableFeature) -> bool {
        let writer_ok = match &self.writer_features {
            Some(features) => features.contains(feature.name),
            None => feature.is_legacy() && self.min_writer_version >= feature.min_writer_version,
        };
        if !writer_ok || !feature.is_reader_writer() {
            return writer_ok;
        }
        match &self.reader_features {
            Some(features) => features.contains(feature.name),
            None => feature.is_legacy() && self.min_reader_version >= feature.min_reader_version,
        }
    }

    /// Known features this protocol supports, explicitly or implicitly.
    pub fn supported_features(&self) -> Vec<&'static TableFeature> {
        ALL_FEATURES
            .iter()
            .copied()
            .filter(|f| self.is_feature_supported(f))
            .collect()
    }

    /// Names of all supported features, including unknown explicit names.
    pub fn supported_feature_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .supported_features()
            .into_iter()
            .map(|f| f.name.to_string())
            .collect();
        if let Some(wf) = &self.writer_features {
            names.extend(wf.iter().cloned());
        }
        names
    }

    /// The smallest protocol that is at least `self` and supports every
    /// feature in `features` (plus their dependencies).
    pub fn with_features(&self, features: &[&'static TableFeature]) -> Protocol {
        let mut wanted: Vec<&'static TableFeature> = Vec::new();
        for feature in features {
            table_features::push_with_dependencies(feature, &mut wanted);
        }
        wanted.retain(|f| !self.is_feature_supported(f));
        if wanted.is_empty() {
            return self.clone();
        }

        let needs_writer_features = self.supports_writer_features()
            || wanted.iter().any(|f| f.kind == FeatureKind::Native);

        if !needs_writer_features {
            // All legacy: bump versions and stay in legacy mode.
            let (r, w) = wanted.iter().fold(
                (self.min_reader_version, self.min_writer_version),
                |(r, w), f| (r.max(f.min_reader_version), w.max(f.min_writer_version)),
            );
            return Protocol::legacy(r, w);
        }

        let implied = self.supported_features();
        let mut writer: BTreeSet<String> = self.writer_features.clone().unwrap_or_default();
        writer.extend(implied.iter().map(|f| f.name.to_string()));
        writer.extend(wanted.iter().map(|f| f.name.to_string()));

        let min_reader_version = wanted
            .iter()
            .filter(|f| f.is_reader_writer())
            .fold(self.min_reader_version, |r, f| r.max(f.min_reader_version));

        let reader_features = if min_reader_version >= TABLE_FEATURES_MIN_READER_VERSION {
            let mut reader: BTreeSet<String> = self.reader_features.clone().unwrap_or_default();
            reader.extend(
                implied
                    .iter()
                    .chain(wanted.iter())
                    .filter(|f| f.is_reader_writer())
                    .map(|f| f.name.to_string()),
            );
            Some(reader)
        } else {
            None
        };

        Protocol {
            min_reader_version,
            min_writer_version: self.min_writer_version.max(TABLE_FEATURES_MIN_WRITER_VERSION),
            reader_features,
            writer_features: Some(writer),
        }
    }

    /// Smallest protocol able to carry `metadata`, starting from the default.
    pub fn for_metadata(metadata: &Metadata) -> Protocol {
        Protocol::default().with_features(&table_features::features_required_by(metadata))
    }

    /// The upgrade `metadata` forces on this protocol, if any.
    pub fn upgrade_for_metadata(&self, metadata: &Metadata) -> Option<Protocol> {
        let upgraded = self.with_features(&table_features::features_required_by(metadata));
        (upgraded != *self).then_some(upgraded)
    }

    /// Union of two protocols: maximum versions and combined feature sets.
    pub fn merge(&self, other: &Protocol) -> Protocol {
        let features: Vec<&'static TableFeature> = other.supported_features();
        let mut merged = self.with_features(&features);
        merged.min_reader_version = merged.min_reader_version.max(other.min_reader_version);
        merged.min_writer_version = merged.min_writer_version.max(other.min_writer_version);
        if merged.supports_writer_features() {
            let mut wf = merged.writer_features.take().unwrap_or_default();
            wf.extend(self.supported_feature_names());
            wf.extend(other.supported_feature_names());
            merged.writer_features = Some(wf);
        }
        if merged.supports_reader_features() {
            let mut rf = merged.reader_features.take().unwrap_or_default();
            for p in [self, other] {
                rf.extend(p.reader_features.iter().flatten().cloned());
                rf.extend(
                    p.supported_features()
                        .into_iter()
                        .filter(|f| f.is_reader_writer())
                        .map(|f| f.name.to_string()),
                );
            }
            merged.reader_features = Some(rf);
        }
        merged
    }

    /// Reject `new` if it lowers a version or stops supporting a feature.
    pub fn ensure_not_downgraded_by(&self, new: &Protocol) -> Result<(), ProtocolError> {
        let downgrade = new.min_reader_version < self.min_reader_version
            || new.min_writer_version < self.min_writer_version
            || !self
                .supported_feature_names()
                .is_subset(&new.supported_feature_names());
        ensure!(
            !downgrade,
            DowngradeSnafu {
                from: self.to_string(),
                to: new.to_string(),
            }
        );
        Ok(())
    }

    /// Ensure every feature `metadata` needs is supported.
    pub fn ensure_supports_metadata(&self, metadata: &Metadata) -> Result<(), ProtocolError> {
        for feature in table_features::features_required_by(metadata) {
            ensure!(
                self.is_feature_supported(feature),
                FeatureNotSupportedSnafu {
                    feature: feature.name
                }
            );
        }
        Ok(())
    }
}

/// What a client implementation understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCapabilities {
    /// Highest reader version understood.
    pub max_reader_version: i32,
    /// Highest writer version understood.
    pub max_writer_version: i32,
    /// Feature names understood.
    pub features: BTreeSet<String>,
}

impl Default for ClientCapabilities {
    /// Everything this engine implements.
    fn default() -> Self {
        Self {
            max_reader_version: TABLE_FEATURES_MIN_READER_VERSION,
            max_writer_version: TABLE_FEATURES_MIN_WRITER_VERSION,
            features: ALL_FEATURES.iter().map(|f| f.name.to_string()).collect(),
        }
    }
}

impl ClientCapabilities {
    /// Capabilities without `feature`.
    pub fn without_feature(mut self, feature: &str) -> Self {
        self.features.remove(feature);
        self
    }

    /// Fail unless this client can read tables with `protocol`.
    pub fn ensure_can_read(&self, protocol: &Protocol) -> Result<(), ProtocolError> {
        ensure!(
            protocol.min_reader_version <= self.max_reader_version,
            UnsupportedReaderVersionSnafu {
                required: protocol.min_reader_version,
                supported: self.max_reader_version,
            }
        );
        if let Some(features) = &protocol.reader_features {
            if let Some(missing) = features.iter().find(|f| !self.features.contains(*f)) {
                return UnsupportedReaderFeatureSnafu {
                    feature: missing.clone(),
                }
                .fail();
            }
        } else {
            // Legacy readers imply legacy reader-writer features.
            for feature in protocol.supported_features() {
                ensure!(
                    !feature.is_reader_writer() || self.features.contains(feature.name),
                    UnsupportedReaderFeatureSnafu {
                        feature: feature.name
                    }
                );
            }
        }
        Ok(())
    }

    /// Fail unless this client can write tables with `protocol`.
    pub fn ensure_can_write(&self, protocol: &Protocol) -> Result<(), ProtocolError> {
        self.ensure_can_read(protocol)?;
        ensure!(
            protocol.min_writer_version <= self.max_writer_version,
            UnsupportedWriterVersionSnafu {
                required: protocol.min_writer_version,
                supported: self.max_writer_version,
            }
        );
        let required: Vec<String> = match &protocol.writer_features {
            Some(features) => features.iter().cloned().collect(),
            None => protocol
                .supported_features()
                .into_iter()
                .map(|f| f.name.to_string())
                .collect(),
        };
        if let Some(missing) = required.iter().find(|f| !self.features.contains(*f)) {
            return UnsupportedWriterFeatureSnafu {
                feature: missing.clone(),
            }
            .fail();
        }
        Ok(())
    }
}
