//! Row id assignment for tables with row tracking.
//!
//! The table keeps the highest row id handed out so far in the
//! `delta.rowTracking` domain as `{"rowIdHighWaterMark": n}` (`-1` when no row
//! ids were assigned yet). Every committed `add` without a `baseRowId` gets the
//! next free id range, sized by its `numRecords` stat, and every `add` without
//! a `defaultRowCommitVersion` gets the commit version.
//!
//! Assignment depends on the commit version and on the winner's high-water
//! mark, so it is redone from the caller's original actions on every attempt.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    Version,
    actions::{Action, DomainMetadata},
    snapshot::Snapshot,
};

/// Domain that stores the row id high-water mark.
pub const ROW_TRACKING_DOMAIN: &str = "delta.rowTracking";

/// Errors raised while assigning row ids.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RowTrackingError {
    /// An added file has no `numRecords` stat.
    #[snafu(display("File {path} has no numRecords statistic; row ids cannot be assigned"))]
    MissingNumRecords {
        /// Added file.
        path: String,
    },

    /// An added file claims fewer than zero records.
    #[snafu(display("File {path} has a negative numRecords statistic ({records})"))]
    NegativeNumRecords {
        /// Added file.
        path: String,
        /// Reported record count.
        records: i64,
    },

    /// The stored domain configuration is malformed.
    #[snafu(display("Invalid {ROW_TRACKING_DOMAIN} domain configuration: {source}"))]
    InvalidDomain {
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RowTrackingDomain {
    row_id_high_water_mark: i64,
}

/// Highest row id assigned in `snapshot`, or `-1`.
pub fn high_water_mark(snapshot: Option<&Snapshot>) -> Result<i64, RowTrackingError> {
    let Some(domain) = snapshot.and_then(|s| s.domain_metadata(ROW_TRACKING_DOMAIN)) else {
        return Ok(-1);
    };
    let parsed: RowTrackingDomain =
        serde_json::from_str(&domain.configuration).context(InvalidDomainSnafu)?;
    Ok(parsed.row_id_high_water_mark)
}

/// Assign row ids and commit versions to the `add` actions in `actions`.
///
/// Returns the updated domain when the high-water mark moved.
pub fn assign_row_ids(
    actions: &mut [Action],
    high_water_mark: i64,
    version: Version,
) -> Result<Option<DomainMetadata>, RowTrackingError> {
    let mut next = high_water_mark;
    for action in actions.iter_mut() {
        let Action::Add(add) = action else {
            continue;
        };
        if add.base_row_id.is_none() {
            let records = add.num_records().context(MissingNumRecordsSnafu {
                path: add.path.clone(),
            })?;
            ensure!(
                records >= 0,
                NegativeNumRecordsSnafu {
                    path: add.path.clone(),
                    records,
                }
            );
            add.base_row_id = Some(next + 1);
            next += records;
        }
        if add.default_row_commit_version.is_none() {
            add.default_row_commit_version = Some(version as i64);
        }
    }

    if next == high_water_mark {
        return Ok(None);
    }
    let configuration = serde_json::to_string(&RowTrackingDomain {
        row_id_high_water_mark: next,
    })
    .context(InvalidDomainSnafu)?;
    Ok(Some(DomainMetadata::new(ROW_TRACKING_DOMAIN, configuration)))
}
