//! The types most programs need, in one import.

pub use deltalog_core::{
    Version,
    actions::{Action, AddFile, CommitInfo, DomainMetadata, Metadata, RemoveFile, SetTransaction},
    config::{CommitOptions, IsolationLevel, TableConfig},
    history::CommitEntry,
    log::LogError,
    predicate::{CompareOp, PartitionColumns, Predicate},
    protocol::{ClientCapabilities, Protocol},
    schema::{DataType, PrimitiveType, StructField, StructType},
    snapshot::{Snapshot, SnapshotCache},
    storage::{LocalLogStore, LogStore, MemoryLogStore, StorageError},
    table::{DeltaTable, TableError},
    transaction::{
        CommitError, CommitOutcome, ConflictKind, FileWriter, MetadataUpdate, Operation,
        OptimisticTransaction, WriteContext, WriteMode,
    },
};
