use std::{collections::BTreeMap, sync::Arc};

use deltalog::prelude::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn prelude_covers_a_create_write_read_cycle() -> TestResult {
    let dir = tempfile::TempDir::new()?;
    let table = DeltaTable::local(dir.path());
    let schema = StructType::new(vec![
        StructField::new("id", DataType::primitive(PrimitiveType::Long), false),
        StructField::new("day", DataType::primitive(PrimitiveType::String), false),
    ]);
    table
        .create(&schema, vec!["day".to_string()], BTreeMap::new())
        .await?;

    let mut txn = table.start_transaction().await?;
    let values = BTreeMap::from([("day".to_string(), Some("2024-01-01".to_string()))]);
    txn.commit(
        vec![Action::Add(AddFile::new("day=2024-01-01/a.parquet", values, 10, 0, true))],
        Operation::Write {
            mode: WriteMode::Append,
            predicate: None,
        },
    )
    .await?;

    let reopened = DeltaTable::open(Arc::new(LocalLogStore::new(dir.path()))).await?;
    let snapshot = reopened.snapshot().await?;
    assert_eq!(snapshot.version(), 1);
    let first_day = Predicate::eq("day", "2024-01-01");
    let hits: Vec<_> = snapshot.files_matching(&first_day).collect();
    assert_eq!(hits.len(), 1);
    let second_day = Predicate::eq("day", "2024-01-02");
    assert_eq!(snapshot.files_matching(&second_day).count(), 0);
    Ok(())
}
