//! Transactional metadata layer for append-only table storage.
//!
//! This is the supported entry point. It re-exports the engine from
//! `deltalog-core`; most callers only need the [`prelude`]:
//!
//! ```no_run
//! use deltalog::prelude::*;
//! use std::collections::BTreeMap;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let table = DeltaTable::local("/tmp/events");
//! let schema = StructType::new(vec![StructField::new(
//!     "id",
//!     DataType::primitive(PrimitiveType::Long),
//!     false,
//! )]);
//! table.create(&schema, vec![], BTreeMap::new()).await?;
//!
//! let mut txn = table.start_transaction().await?;
//! let add = AddFile::new("part-0.parquet", BTreeMap::new(), 1024, 0, true);
//! txn.commit(vec![Action::Add(add)], Operation::Write {
//!     mode: WriteMode::Append,
//!     predicate: None,
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

pub mod prelude;

pub use deltalog_core::*;
